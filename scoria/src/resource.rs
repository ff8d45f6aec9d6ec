//! GPU-owning resource wrappers.
//!
//! Every wrapper carries a [`DeviceObjectHeader`] and follows the same
//! destruction discipline: its `Drop` captures the raw handles by value
//! and appends a `(current_timeline_value + 1, destroy)` callback on the
//! device, so no handle dies while a queue might still reference it.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::command::{CommandBufferScopeDesc, CommandPoolContext};
use crate::device::{Device, DeviceObjectHeader};
use crate::error::{Error, Result};

pub fn is_depth_only_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT
    )
}

pub fn is_depth_and_stencil_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_only_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else if format == vk::Format::S8_UINT {
        vk::ImageAspectFlags::STENCIL
    } else if is_depth_and_stencil_format(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// The pipeline stage and access mask that make an image usable in the
/// given layout; used as the source or destination half of a layout
/// transition.
pub(crate) fn layout_stage_access(
    layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
        }
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

/// Records a full-subresource layout transition.
pub(crate) fn cmd_transition_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    (old_layout, src_stage, src_access): (vk::ImageLayout, vk::PipelineStageFlags, vk::AccessFlags),
    (new_layout, dst_stage, dst_access): (vk::ImageLayout, vk::PipelineStageFlags, vk::AccessFlags),
) {
    let barrier = vk::ImageMemoryBarrier {
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        },
        ..Default::default()
    };
    unsafe {
        device.handle().cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

// --- buffers -----------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct BufferCreateDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryLocation,
}

/// A buffer plus its memory allocation.
pub struct Buffer {
    header: DeviceObjectHeader,
    desc: BufferCreateDesc,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
}

impl Buffer {
    /// Creates an uninitialized buffer.
    pub fn new(device: &Arc<Device>, name: impl Into<String>, desc: BufferCreateDesc) -> Result<Buffer> {
        let create_info = vk::BufferCreateInfo {
            size: desc.size,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { device.handle().create_buffer(&create_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let header = DeviceObjectHeader::new(device.clone(), name);
        let allocation = device.with_allocator(|allocator| {
            allocator.allocate(&AllocationCreateDesc {
                name: header.name(),
                requirements,
                location: desc.memory,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                // No partial object state on allocator failure.
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?
        };
        header.tag_object(buffer);

        Ok(Buffer {
            header,
            desc,
            buffer,
            allocation: Some(allocation),
        })
    }

    /// A host-visible transfer-source buffer pre-filled with `data`.
    pub fn staging(device: &Arc<Device>, name: impl Into<String>, data: &[u8]) -> Result<Buffer> {
        let mut buffer = Buffer::new(
            device,
            name,
            BufferCreateDesc {
                size: data.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                memory: MemoryLocation::CpuToGpu,
            },
        )?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Creates a device buffer initialized from a CPU byte slice: the
    /// bytes go through an internal staging buffer whose destruction is
    /// scheduled once the recorded copy has executed.
    pub fn with_data(
        device: &Arc<Device>,
        context: &mut CommandPoolContext,
        name: impl Into<String>,
        desc: BufferCreateDesc,
        data: &[u8],
    ) -> Result<Buffer> {
        let name = name.into();
        let staging = Buffer::staging(device, format!("{name}.staging"), data)?;
        Buffer::from_staging(device, context, name, desc, staging)
    }

    /// Like [`with_data`](Buffer::with_data), but the caller provides
    /// the pre-filled staging buffer. The staging buffer is destroyed
    /// after the copy completes on the device.
    pub fn from_staging(
        device: &Arc<Device>,
        context: &mut CommandPoolContext,
        name: impl Into<String>,
        desc: BufferCreateDesc,
        staging: Buffer,
    ) -> Result<Buffer> {
        assert!(staging.desc.size >= desc.size, "staging buffer too small");
        let target = Buffer::new(
            device,
            name,
            BufferCreateDesc {
                usage: desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
                ..desc
            },
        )?;

        {
            let scope = context.commands(CommandBufferScopeDesc::default())?;
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: desc.size,
            };
            unsafe {
                device.handle().cmd_copy_buffer(
                    scope.command_buffer(),
                    staging.handle(),
                    target.handle(),
                    &[region],
                );
            }
        }
        // Dropping the staging buffer here would only schedule its
        // destruction against the *current* timeline value; holding it
        // until the commands-finished boundary keeps it alive across the
        // actual copy.
        context.add_commands_finished_callback(move |_| drop(staging));
        Ok(target)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn desc(&self) -> &BufferCreateDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        self.header.name()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.header.device()
    }

    /// Host-mapped bytes of a CPU-visible allocation.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }

    /// Copies `data` into the mapped allocation at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let slice = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(Error::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        slice[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let buffer = self.buffer;
        let allocation = self.allocation.take();
        let device = self.header.device();
        device.add_timeline_callback(
            device.current_timeline_value() + 1,
            move |device, _| {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                if let Some(allocation) = allocation {
                    device.with_allocator(|allocator| {
                        let _ = allocator.free(allocation);
                    });
                }
            },
        );
    }
}

/// A formatted (texel-buffer) view over a [`Buffer`] range.
pub struct BufferView {
    header: DeviceObjectHeader,
    view: vk::BufferView,
    format: vk::Format,
}

impl BufferView {
    pub fn new(
        device: &Arc<Device>,
        name: impl Into<String>,
        buffer: &Buffer,
        format: vk::Format,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Result<BufferView> {
        let create_info = vk::BufferViewCreateInfo {
            buffer: buffer.handle(),
            format,
            offset,
            range,
            ..Default::default()
        };
        let view = unsafe { device.handle().create_buffer_view(&create_info, None)? };
        let header = DeviceObjectHeader::new(device.clone(), name);
        header.tag_object(view);
        Ok(BufferView { header, view, format })
    }

    pub fn handle(&self) -> vk::BufferView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        let view = self.view;
        let device = self.header.device();
        device.add_timeline_callback(device.current_timeline_value() + 1, move |device, _| {
            unsafe { device.handle().destroy_buffer_view(view, None) };
        });
    }
}

// --- images ------------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct ImageCreateDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub memory: MemoryLocation,
}

impl Default for ImageCreateDesc {
    fn default() -> Self {
        ImageCreateDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D { width: 1, height: 1, depth: 1 },
            usage: vk::ImageUsageFlags::SAMPLED,
            mip_levels: 1,
            array_layers: 1,
            memory: MemoryLocation::GpuOnly,
        }
    }
}

pub struct Image {
    header: DeviceObjectHeader,
    desc: ImageCreateDesc,
    image: vk::Image,
    allocation: Option<Allocation>,
}

impl Image {
    pub fn new(device: &Arc<Device>, name: impl Into<String>, desc: ImageCreateDesc) -> Result<Image> {
        let create_info = vk::ImageCreateInfo {
            image_type: if desc.extent.depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            },
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { device.handle().create_image(&create_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let header = DeviceObjectHeader::new(device.clone(), name);
        let allocation = device.with_allocator(|allocator| {
            allocator.allocate(&AllocationCreateDesc {
                name: header.name(),
                requirements,
                location: desc.memory,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(err.into());
            }
        };
        unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())?
        };
        header.tag_object(image);

        Ok(Image {
            header,
            desc,
            image,
            allocation: Some(allocation),
        })
    }

    /// Creates a device image initialized from CPU bytes (tightly packed
    /// mip 0, layer 0). The upload is recorded into `context` and the
    /// staging buffer is destroyed once the copy has executed; the image
    /// ends up in `final_layout`.
    pub fn with_data(
        device: &Arc<Device>,
        context: &mut CommandPoolContext,
        name: impl Into<String>,
        desc: ImageCreateDesc,
        data: &[u8],
        final_layout: vk::ImageLayout,
    ) -> Result<Image> {
        let name = name.into();
        let desc = ImageCreateDesc {
            usage: desc.usage | vk::ImageUsageFlags::TRANSFER_DST,
            ..desc
        };
        let image = Image::new(device, name.clone(), desc)?;
        let staging = Buffer::staging(device, format!("{name}.staging"), data)?;
        let aspect_mask = format_aspect_mask(desc.format);

        {
            let scope = context.commands(CommandBufferScopeDesc::default())?;
            let command_buffer = scope.command_buffer();
            cmd_transition_image(
                device,
                command_buffer,
                image.handle(),
                aspect_mask,
                (
                    vk::ImageLayout::UNDEFINED,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::AccessFlags::empty(),
                ),
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            );
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: desc.extent,
            };
            unsafe {
                device.handle().cmd_copy_buffer_to_image(
                    command_buffer,
                    staging.handle(),
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            // Make the transfer write visible to whatever consumes the
            // image in its final layout.
            let (dst_stage, dst_access) = layout_stage_access(final_layout);
            cmd_transition_image(
                device,
                command_buffer,
                image.handle(),
                aspect_mask,
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
                (final_layout, dst_stage, dst_access),
            );
        }
        context.add_commands_finished_callback(move |_| drop(staging));
        Ok(image)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn desc(&self) -> &ImageCreateDesc {
        &self.desc
    }

    pub fn device(&self) -> &Arc<Device> {
        self.header.device()
    }

    pub fn name(&self) -> &str {
        self.header.name()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let image = self.image;
        let allocation = self.allocation.take();
        let device = self.header.device();
        device.add_timeline_callback(
            device.current_timeline_value() + 1,
            move |device, _| {
                unsafe { device.handle().destroy_image(image, None) };
                if let Some(allocation) = allocation {
                    device.with_allocator(|allocator| {
                        let _ = allocator.free(allocation);
                    });
                }
            },
        );
    }
}

// --- image views -------------------------------------------------------

pub struct ImageView {
    header: DeviceObjectHeader,
    view: vk::ImageView,
    format: vk::Format,
}

impl ImageView {
    pub fn new(device: &Arc<Device>, name: impl Into<String>, image: &Image) -> Result<ImageView> {
        let desc = image.desc();
        let create_info = vk::ImageViewCreateInfo {
            image: image.handle(),
            view_type: if desc.extent.depth > 1 {
                vk::ImageViewType::TYPE_3D
            } else {
                vk::ImageViewType::TYPE_2D
            },
            format: desc.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: format_aspect_mask(desc.format),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            ..Default::default()
        };
        let view = unsafe { device.handle().create_image_view(&create_info, None)? };
        let header = DeviceObjectHeader::new(device.clone(), name);
        header.tag_object(view);
        Ok(ImageView {
            header,
            view,
            format: desc.format,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        let view = self.view;
        let device = self.header.device();
        device.add_timeline_callback(device.current_timeline_value() + 1, move |device, _| {
            unsafe { device.handle().destroy_image_view(view, None) };
        });
    }
}

// --- samplers ----------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct SamplerCreateDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerCreateDesc {
    fn default() -> Self {
        SamplerCreateDesc {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

pub struct Sampler {
    header: DeviceObjectHeader,
    sampler: vk::Sampler,
}

impl Sampler {
    pub fn new(device: &Arc<Device>, name: impl Into<String>, desc: SamplerCreateDesc) -> Result<Sampler> {
        let create_info = vk::SamplerCreateInfo {
            mag_filter: desc.mag_filter,
            min_filter: desc.min_filter,
            mipmap_mode: desc.mipmap_mode,
            address_mode_u: desc.address_mode,
            address_mode_v: desc.address_mode,
            address_mode_w: desc.address_mode,
            max_lod: vk::LOD_CLAMP_NONE,
            ..Default::default()
        };
        let sampler = unsafe { device.handle().create_sampler(&create_info, None)? };
        let header = DeviceObjectHeader::new(device.clone(), name);
        header.tag_object(sampler);
        Ok(Sampler { header, sampler })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        let sampler = self.sampler;
        let device = self.header.device();
        device.add_timeline_callback(device.current_timeline_value() + 1, move |device, _| {
            unsafe { device.handle().destroy_sampler(sampler, None) };
        });
    }
}

// --- semaphores --------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline { initial_value: u64 },
}

pub struct Semaphore {
    header: DeviceObjectHeader,
    semaphore: vk::Semaphore,
    kind: SemaphoreKind,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, name: impl Into<String>, kind: SemaphoreKind) -> Result<Semaphore> {
        let mut type_create_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: match kind {
                SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
                SemaphoreKind::Timeline { .. } => vk::SemaphoreType::TIMELINE,
            },
            initial_value: match kind {
                SemaphoreKind::Binary => 0,
                SemaphoreKind::Timeline { initial_value } => initial_value,
            },
            ..Default::default()
        };
        let create_info = vk::SemaphoreCreateInfo {
            p_next: &mut type_create_info as *mut _ as *mut std::os::raw::c_void,
            ..Default::default()
        };
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        let header = DeviceObjectHeader::new(device.clone(), name);
        header.tag_object(semaphore);
        Ok(Semaphore {
            header,
            semaphore,
            kind,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    /// Current counter of a timeline semaphore.
    pub fn value(&self) -> Result<u64> {
        debug_assert!(matches!(self.kind, SemaphoreKind::Timeline { .. }));
        let value = unsafe {
            self.header
                .device()
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Signals a timeline semaphore from the host.
    pub fn signal(&self, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo {
            semaphore: self.semaphore,
            value,
            ..Default::default()
        };
        unsafe { self.header.device().handle().signal_semaphore(&signal_info)? };
        Ok(())
    }

    /// Waits for the timeline to reach `value`; `u64::MAX` timeout waits
    /// forever. Returns whether the value was reached.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<bool> {
        Semaphore::wait_many(self.header.device(), &[self], &[value], timeout_ns)
    }

    /// Waits on several timeline semaphores at once.
    pub fn wait_many(
        device: &Arc<Device>,
        semaphores: &[&Semaphore],
        values: &[u64],
        timeout_ns: u64,
    ) -> Result<bool> {
        assert_eq!(semaphores.len(), values.len());
        let raw: Vec<vk::Semaphore> = semaphores.iter().map(|s| s.semaphore).collect();
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: raw.len() as u32,
            p_semaphores: raw.as_ptr(),
            p_values: values.as_ptr(),
            ..Default::default()
        };
        match unsafe { device.handle().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let semaphore = self.semaphore;
        let device = self.header.device();
        device.add_timeline_callback(device.current_timeline_value() + 1, move |device, _| {
            unsafe { device.handle().destroy_semaphore(semaphore, None) };
        });
    }
}
