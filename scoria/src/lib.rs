//! scoria: a task-graph executor coupled to a Vulkan resource &
//! submission layer.
//!
//! CPU tasks (built into DAGs, drained by a worker pool) produce GPU
//! command streams; the device sequences submissions on a monotonic
//! timeline, and timeline completion releases host resources back
//! through deferred destruction callbacks.

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;

mod command;
mod device;
mod error;
mod instance;
pub mod pool;
mod queue;
mod render_target;
mod resource;
mod swapchain;
pub mod sync;
pub mod task;

pub use command::{
    CommandBufferArray, CommandBufferScope, CommandBufferScopeDesc, CommandPoolConfig,
    CommandPoolContext, RenderPassInheritance, COMMAND_BUFFER_ARRAY_CAPACITY,
};
pub use device::{Device, DeviceConfig, DeviceObjectHeader, MAX_QUEUES};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceConfig, VALIDATION_LOG_ENV};
pub use pool::{Handle, MemoryPool};
pub use queue::{Queue, QueueConfig, QueuePresentInfo, QueueSubmitInfo};
pub use render_target::{Frame, RenderImageSet, RenderTarget};
pub use resource::{
    format_aspect_mask, Buffer, BufferCreateDesc, BufferView, Image, ImageCreateDesc, ImageView,
    Sampler, SamplerCreateDesc, Semaphore, SemaphoreKind,
};
pub use swapchain::{Swapchain, SwapchainCreateDesc};
pub use task::{
    current_executor, current_task, Executor, ExecutorHandle, Future, Task, TaskGraph, TaskHandle,
    TaskNodeId,
};
