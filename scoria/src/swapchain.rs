//! Swapchain ownership: creation against an externally created surface,
//! image acquisition, and deferred teardown.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace_span};

use crate::device::{Device, DeviceObjectHeader};
use crate::error::{Error, Result};
use crate::render_target::Frame;

/// Chooses a swapchain surface format among the supported ones.
fn preferred_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

fn preferred_present_mode(
    available: &[vk::PresentModeKHR],
    requested: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(mode) = requested {
        if available.contains(&mode) {
            return mode;
        }
    }
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn preferred_swap_extent(
    framebuffer_extent: vk::Extent2D,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: framebuffer_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub struct SwapchainCreateDesc {
    /// Surface created by the windowing collaborator; the swapchain does
    /// not take ownership of it.
    pub surface: vk::SurfaceKHR,
    /// Fallback extent when the surface does not dictate one.
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub usage: vk::ImageUsageFlags,
    pub present_mode: Option<vk::PresentModeKHR>,
}

pub struct Swapchain {
    header: DeviceObjectHeader,
    swapchain: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    usage: vk::ImageUsageFlags,
    present_mode: vk::PresentModeKHR,
    min_image_count: u32,
}

impl Swapchain {
    pub fn new(device: Arc<Device>, name: impl Into<String>, desc: SwapchainCreateDesc) -> Result<Swapchain> {
        let header = DeviceObjectHeader::new(device, name);
        let mut swapchain = Swapchain {
            header,
            swapchain: vk::SwapchainKHR::null(),
            surface: desc.surface,
            images: Vec::new(),
            views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: desc.extent,
            usage: desc.usage,
            present_mode: desc.present_mode.unwrap_or(vk::PresentModeKHR::FIFO),
            min_image_count: desc.min_image_count,
        };
        swapchain.create(desc.extent, desc.present_mode)?;
        Ok(swapchain)
    }

    fn create(
        &mut self,
        framebuffer_extent: vk::Extent2D,
        requested_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<()> {
        let _span = trace_span!("swapchain_create").entered();
        let device = self.header.device().clone();
        let surface_loader = device.instance().vk_khr_surface();
        let physical_device = device.physical_device();

        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, self.surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            )
        };
        if formats.is_empty() {
            return Err(Error::SurfaceOutOfDate);
        }

        let format = preferred_surface_format(&formats);
        let present_mode = preferred_present_mode(&present_modes, requested_present_mode);
        let extent = preferred_swap_extent(framebuffer_extent, &capabilities);

        let mut min_image_count = self.min_image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR {
            surface: self.surface,
            min_image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: self.usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };
        let swapchain = unsafe { device.vk_khr_swapchain().create_swapchain(&create_info, None)? };
        if old_swapchain != vk::SwapchainKHR::null() {
            self.schedule_teardown();
        }

        let images = unsafe { device.vk_khr_swapchain().get_swapchain_images(swapchain)? };
        let views = images
            .iter()
            .map(|&image| {
                let view_create_info = vk::ImageViewCreateInfo {
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: format.format,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                };
                Ok(unsafe { device.handle().create_image_view(&view_create_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            image_count = images.len(),
            format = ?format.format,
            present_mode = ?present_mode,
            "swapchain created"
        );

        self.swapchain = swapchain;
        self.images = images;
        self.views = views;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        Ok(())
    }

    /// Defers destruction of the current handle and views past any
    /// submission that may still reference them.
    fn schedule_teardown(&mut self) {
        let device = self.header.device();
        let swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        let views = std::mem::take(&mut self.views);
        device.add_timeline_callback(device.current_timeline_value() + 1, move |device, _| unsafe {
            for view in views {
                device.handle().destroy_image_view(view, None);
            }
            device.vk_khr_swapchain().destroy_swapchain(swapchain, None);
        });
    }

    /// Rebuilds the swapchain, e.g. after an out-of-date result. The old
    /// chain is torn down on the timeline.
    pub fn recreate(&mut self, framebuffer_extent: vk::Extent2D) -> Result<()> {
        self.create(framebuffer_extent, Some(self.present_mode))
    }

    /// Acquires the next image, signalling `semaphore` when it is usable.
    /// The boolean marks a suboptimal (but usable) swapchain.
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let result = unsafe {
            self.header.device().vk_khr_swapchain().acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// A render-target view of one acquired swapchain image.
    pub fn frame(&self, image_index: u32) -> Frame {
        Frame::new(
            self.images[image_index as usize],
            self.views[image_index as usize],
            self.format.format,
            self.extent,
        )
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.schedule_teardown();
    }
}
