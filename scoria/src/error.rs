//! Crate-wide error taxonomy.
//!
//! Every fallible call surfaces one of these variants to the caller; the
//! crate performs no internal recovery. Vulkan result codes map onto the
//! dedicated variants where the caller can act on them (device loss,
//! memory exhaustion, stale swapchains) and pass through raw otherwise.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device was lost; the device context drains and refuses new
    /// submissions.
    #[error("device lost")]
    DeviceLost,

    /// Allocation failed; no partially constructed object remains.
    #[error("out of device memory")]
    OutOfMemory,

    /// The surface no longer matches the swapchain; recreate it.
    #[error("surface out of date")]
    SurfaceOutOfDate,

    /// A task graph contains a cycle; nothing was scheduled.
    #[error("task graph is not a DAG")]
    GraphNotDag,

    /// The fixed-capacity task pool is full.
    #[error("task pool exhausted")]
    PoolExhausted,

    /// New GPU work was pushed at a device that is shutting down.
    #[error("device is draining, submission refused")]
    DeviceDraining,

    /// Allocator failure other than memory exhaustion.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Any Vulkan error without a dedicated variant.
    #[error("vulkan error: {0}")]
    Vulkan(#[source] vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Error {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => Error::OutOfMemory,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                Error::SurfaceOutOfDate
            }
            other => Error::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for Error {
    fn from(error: gpu_allocator::AllocationError) -> Error {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Error::OutOfMemory,
            other => Error::Allocation(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
