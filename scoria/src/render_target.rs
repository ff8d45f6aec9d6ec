//! Render targets as a capability trait over raw transition/clear/blit
//! commands. Render-pass and pipeline semantics stay with the caller;
//! this module manages image lifetimes and layout bookkeeping only.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::error::Result;
use crate::resource::{
    cmd_transition_image, format_aspect_mask, layout_stage_access, Image, ImageCreateDesc,
    ImageView,
};

/// Capability trait for anything commands can render into.
pub trait RenderTarget {
    fn extent(&self) -> vk::Extent2D;
    fn color_image(&self) -> vk::Image;
    fn color_view(&self) -> vk::ImageView;
    fn color_format(&self) -> vk::Format;
    fn layout(&self) -> vk::ImageLayout;

    /// Transitions the color image to the given layout, from whatever
    /// layout the target tracked last.
    fn transition(&mut self, device: &Device, command_buffer: vk::CommandBuffer, new_layout: vk::ImageLayout);

    /// Makes the target renderable (color-attachment layout).
    fn begin(&mut self, device: &Device, command_buffer: vk::CommandBuffer) {
        self.transition(device, command_buffer, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    /// Moves the target to its resting layout.
    fn end(&mut self, device: &Device, command_buffer: vk::CommandBuffer);

    /// Clears the whole color image.
    fn clear(&mut self, device: &Device, command_buffer: vk::CommandBuffer, color: vk::ClearColorValue) {
        self.transition(device, command_buffer, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        unsafe {
            device.handle().cmd_clear_color_image(
                command_buffer,
                self.color_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &color,
                &[range],
            );
        }
    }

    /// Blits the color image into `dst_image`, which must already be in
    /// `TRANSFER_DST_OPTIMAL`.
    fn blit_to(
        &mut self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        dst_image: vk::Image,
        dst_extent: vk::Extent2D,
    ) {
        self.transition(device, command_buffer, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let src_extent = self.extent();
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_extent.width as i32,
                    y: src_extent.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: subresource,
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            device.handle().cmd_blit_image(
                command_buffer,
                self.color_image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
    }
}

/// A swapchain image seen as a render target for one frame. Does not own
/// the image; the swapchain manages its lifetime.
pub struct Frame {
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    layout: vk::ImageLayout,
}

impl Frame {
    pub(crate) fn new(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Frame {
        Frame {
            image,
            view,
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl RenderTarget for Frame {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_image(&self) -> vk::Image {
        self.image
    }

    fn color_view(&self) -> vk::ImageView {
        self.view
    }

    fn color_format(&self) -> vk::Format {
        self.format
    }

    fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    fn transition(&mut self, device: &Device, command_buffer: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        if self.layout == new_layout {
            return;
        }
        let (src_stage, src_access) = layout_stage_access(self.layout);
        let (dst_stage, dst_access) = layout_stage_access(new_layout);
        cmd_transition_image(
            device,
            command_buffer,
            self.image,
            vk::ImageAspectFlags::COLOR,
            (self.layout, src_stage, src_access),
            (new_layout, dst_stage, dst_access),
        );
        self.layout = new_layout;
    }

    /// A frame rests in present layout.
    fn end(&mut self, device: &Device, command_buffer: vk::CommandBuffer) {
        self.transition(device, command_buffer, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}

/// An owning bundle of color (and optionally depth) images and views,
/// usable as an off-screen render target across frames.
pub struct RenderImageSet {
    color: Image,
    color_view: ImageView,
    depth: Option<(Image, ImageView)>,
    extent: vk::Extent2D,
    layout: vk::ImageLayout,
    depth_layout: vk::ImageLayout,
}

impl RenderImageSet {
    pub fn new(
        device: &Arc<Device>,
        name: impl Into<String>,
        color_desc: ImageCreateDesc,
        depth_format: Option<vk::Format>,
    ) -> Result<RenderImageSet> {
        let name = name.into();
        let extent = vk::Extent2D {
            width: color_desc.extent.width,
            height: color_desc.extent.height,
        };
        let color = Image::new(device, format!("{name}.color"), color_desc)?;
        let color_view = ImageView::new(device, format!("{name}.color_view"), &color)?;
        let depth = depth_format
            .map(|format| -> Result<(Image, ImageView)> {
                let image = Image::new(
                    device,
                    format!("{name}.depth"),
                    ImageCreateDesc {
                        format,
                        extent: color_desc.extent,
                        usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                        ..Default::default()
                    },
                )?;
                let view = ImageView::new(device, format!("{name}.depth_view"), &image)?;
                Ok((image, view))
            })
            .transpose()?;
        Ok(RenderImageSet {
            color,
            color_view,
            depth,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            depth_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|(_, view)| view.handle())
    }

    /// Makes the depth attachment writable alongside `begin`.
    pub fn begin_depth(&mut self, device: &Device, command_buffer: vk::CommandBuffer) {
        let Some((image, _)) = &self.depth else { return };
        if self.depth_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
            return;
        }
        let (src_stage, src_access) = layout_stage_access(self.depth_layout);
        let (dst_stage, dst_access) =
            layout_stage_access(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        cmd_transition_image(
            device,
            command_buffer,
            image.handle(),
            format_aspect_mask(image.desc().format),
            (self.depth_layout, src_stage, src_access),
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                dst_stage,
                dst_access,
            ),
        );
        self.depth_layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
    }
}

impl RenderTarget for RenderImageSet {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_image(&self) -> vk::Image {
        self.color.handle()
    }

    fn color_view(&self) -> vk::ImageView {
        self.color_view.handle()
    }

    fn color_format(&self) -> vk::Format {
        self.color.desc().format
    }

    fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    fn transition(&mut self, device: &Device, command_buffer: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        if self.layout == new_layout {
            return;
        }
        let (src_stage, src_access) = layout_stage_access(self.layout);
        let (dst_stage, dst_access) = layout_stage_access(new_layout);
        cmd_transition_image(
            device,
            command_buffer,
            self.color.handle(),
            vk::ImageAspectFlags::COLOR,
            (self.layout, src_stage, src_access),
            (new_layout, dst_stage, dst_access),
        );
        self.layout = new_layout;
    }

    /// An off-screen set rests in shader-readable layout.
    fn end(&mut self, device: &Device, command_buffer: vk::CommandBuffer) {
        self.transition(device, command_buffer, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
