//! Device queues: submission batching against the device timeline, and
//! swapchain presentation.

use std::os::raw::c_void;
use std::sync::Arc;

use ash::vk;
use tracing::{trace, trace_span, warn};

use crate::device::{Device, DeviceObjectHeader};
use crate::error::{Error, Result};

pub struct QueueConfig {
    pub queue_family_index: u32,
    pub queue_index: u32,
}

/// One pending submission: wait/signal sets plus the command buffers.
/// The device timeline signal is appended by [`Queue::submit`]; wait
/// values pair up with `wait_semaphores` (ignored for binary ones).
#[derive(Default)]
pub struct QueueSubmitInfo {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_dst_stage_masks: Vec<vk::PipelineStageFlags>,
    pub wait_semaphore_values: Vec<u64>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphore_values: Vec<u64>,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

/// Accumulated present request; merges across `enqueue_present` calls
/// so several swapchains go out in one `vkQueuePresentKHR`.
#[derive(Default)]
pub struct QueuePresentInfo {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub swapchains: Vec<vk::SwapchainKHR>,
    pub image_indices: Vec<u32>,
}

impl QueuePresentInfo {
    fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    fn merge(&mut self, mut other: QueuePresentInfo) {
        self.wait_semaphores.append(&mut other.wait_semaphores);
        self.swapchains.append(&mut other.swapchains);
        self.image_indices.append(&mut other.image_indices);
    }
}

impl std::ops::BitOrAssign for QueuePresentInfo {
    fn bitor_assign(&mut self, rhs: QueuePresentInfo) {
        self.merge(rhs);
    }
}

/// A wrapper over a device queue with a pending-submit list and a
/// pending-present list.
///
/// `enqueue_submit` only records; `submit` allocates the next timeline
/// value, patches it into every pending submission's signal set and
/// issues one batched `vkQueueSubmit`. Submissions land on the queue in
/// the order they were enqueued.
pub struct Queue {
    header: DeviceObjectHeader,
    queue: vk::Queue,
    queue_family_index: u32,
    pending_submits: Vec<QueueSubmitInfo>,
    pending_present: QueuePresentInfo,
    last_submit_timeline_value: Option<u64>,
}

impl Queue {
    pub fn new(device: Arc<Device>, name: impl Into<String>, config: QueueConfig) -> Queue {
        assert!(device
            .created_queue_families()
            .contains(&config.queue_family_index));
        let queue = unsafe {
            device
                .handle()
                .get_device_queue(config.queue_family_index, config.queue_index)
        };
        let header = DeviceObjectHeader::new(device, name);
        header.tag_object(queue);
        Queue {
            header,
            queue,
            queue_family_index: config.queue_family_index,
            pending_submits: Vec::new(),
            pending_present: QueuePresentInfo::default(),
            last_submit_timeline_value: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        self.header.device()
    }

    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Timeline value signalled by the most recent [`submit`](Queue::submit).
    pub fn last_submit_timeline_value(&self) -> Option<u64> {
        self.last_submit_timeline_value
    }

    pub fn enqueue_submit(&mut self, submit: QueueSubmitInfo) {
        debug_assert_eq!(
            submit.wait_semaphores.len(),
            submit.wait_dst_stage_masks.len()
        );
        self.pending_submits.push(submit);
    }

    /// Flushes the pending submissions as one batched submit signalling
    /// the next timeline value. On failure the pending list is left
    /// intact and the error surfaces to the caller.
    pub fn submit(&mut self) -> Result<u64> {
        let device = self.header.device();
        if device.is_draining() {
            return Err(if device.is_lost() {
                Error::DeviceLost
            } else {
                Error::DeviceDraining
            });
        }
        if self.pending_submits.is_empty() {
            return Ok(device.current_timeline_value());
        }

        let _span = trace_span!("queue_submit", batches = self.pending_submits.len()).entered();

        let timeline_value = device.next_timeline_value();
        let timeline_semaphore = device.timeline_semaphore();

        // Patched copies of the signal/wait sets; the originals stay
        // untouched so a failed submit can be retried.
        let mut signal_semaphores: Vec<Vec<vk::Semaphore>> = Vec::with_capacity(self.pending_submits.len());
        let mut signal_values: Vec<Vec<u64>> = Vec::with_capacity(self.pending_submits.len());
        let mut wait_values: Vec<Vec<u64>> = Vec::with_capacity(self.pending_submits.len());
        for submit in &self.pending_submits {
            let mut semaphores = submit.signal_semaphores.clone();
            let mut values = submit.signal_semaphore_values.clone();
            values.resize(semaphores.len(), 0);
            semaphores.push(timeline_semaphore);
            values.push(timeline_value);
            signal_semaphores.push(semaphores);
            signal_values.push(values);

            let mut wait = submit.wait_semaphore_values.clone();
            wait.resize(submit.wait_semaphores.len(), 0);
            wait_values.push(wait);
        }

        let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo> =
            Vec::with_capacity(self.pending_submits.len());
        for i in 0..self.pending_submits.len() {
            timeline_infos.push(vk::TimelineSemaphoreSubmitInfo {
                wait_semaphore_value_count: wait_values[i].len() as u32,
                p_wait_semaphore_values: wait_values[i].as_ptr(),
                signal_semaphore_value_count: signal_values[i].len() as u32,
                p_signal_semaphore_values: signal_values[i].as_ptr(),
                ..Default::default()
            });
        }

        let submit_infos: Vec<vk::SubmitInfo> = self
            .pending_submits
            .iter()
            .enumerate()
            .map(|(i, submit)| vk::SubmitInfo {
                p_next: &timeline_infos[i] as *const _ as *const c_void,
                wait_semaphore_count: submit.wait_semaphores.len() as u32,
                p_wait_semaphores: submit.wait_semaphores.as_ptr(),
                p_wait_dst_stage_mask: submit.wait_dst_stage_masks.as_ptr(),
                command_buffer_count: submit.command_buffers.len() as u32,
                p_command_buffers: submit.command_buffers.as_ptr(),
                signal_semaphore_count: signal_semaphores[i].len() as u32,
                p_signal_semaphores: signal_semaphores[i].as_ptr(),
                ..Default::default()
            })
            .collect();

        let result = unsafe {
            device
                .handle()
                .queue_submit(self.queue, &submit_infos, vk::Fence::null())
        };
        if let Err(err) = result {
            if err == vk::Result::ERROR_DEVICE_LOST {
                device.note_device_lost();
            }
            warn!(?err, "queue submit failed");
            return Err(err.into());
        }

        self.pending_submits.clear();
        self.last_submit_timeline_value = Some(timeline_value);
        trace!(timeline_value, "submitted");

        // Opportunistic reap: work finished earlier may release hosts
        // resources now.
        let _ = device.process_timeline_callbacks();

        Ok(timeline_value)
    }

    pub fn enqueue_present(&mut self, present: QueuePresentInfo) {
        self.pending_present |= present;
    }

    /// Presents every accumulated swapchain image in one call. Returns
    /// the per-swapchain results; `Ok(true)` marks a suboptimal (but
    /// successful) present.
    pub fn present(&mut self) -> Result<(bool, Vec<vk::Result>)> {
        let device = self.header.device();
        if device.is_draining() {
            return Err(if device.is_lost() {
                Error::DeviceLost
            } else {
                Error::DeviceDraining
            });
        }
        if self.pending_present.is_empty() {
            return Ok((false, Vec::new()));
        }

        let _span = trace_span!("queue_present", swapchains = self.pending_present.swapchains.len())
            .entered();

        let info = std::mem::take(&mut self.pending_present);
        let mut results = vec![vk::Result::SUCCESS; info.swapchains.len()];
        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: info.wait_semaphores.len() as u32,
            p_wait_semaphores: info.wait_semaphores.as_ptr(),
            swapchain_count: info.swapchains.len() as u32,
            p_swapchains: info.swapchains.as_ptr(),
            p_image_indices: info.image_indices.as_ptr(),
            p_results: results.as_mut_ptr(),
            ..Default::default()
        };

        let outcome = unsafe {
            device
                .vk_khr_swapchain()
                .queue_present(self.queue, &present_info)
        };
        match outcome {
            Ok(suboptimal) => Ok((suboptimal, results)),
            Err(err) => {
                if err == vk::Result::ERROR_DEVICE_LOST {
                    device.note_device_lost();
                }
                // Leave the request intact for a retry after e.g. a
                // swapchain rebuild.
                self.pending_present = info;
                Err(err.into())
            }
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.header.device().handle().queue_wait_idle(self.queue)? };
        Ok(())
    }
}
