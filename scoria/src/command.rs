//! Command recording: fixed-size command buffer arrays, RAII recording
//! scopes, and the per-level free/pending/submitted lanes of a command
//! pool context.
//!
//! A pool context is single-owner: one thread records on it, and it is
//! reset only when no recording cursor is open. Cross-thread recording
//! uses one context per thread.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use tracing::{trace, trace_span};

use crate::device::{Device, DeviceObjectHeader};
use crate::error::Result;
use crate::queue::{Queue, QueueSubmitInfo};

/// Command buffers allocated per array. The recording state is a `u8`
/// bitmask, which caps the capacity at 8.
pub const COMMAND_BUFFER_ARRAY_CAPACITY: usize = 4;
const _: () = assert!(COMMAND_BUFFER_ARRAY_CAPACITY <= 8);

/// Inheritance for secondary command buffers recorded inside a render
/// pass.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RenderPassInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

/// Selects a recording cursor: the command buffer level (0 primary,
/// >= 1 secondary), whether the scope ends the buffer on drop, and the
/// optional render-pass inheritance.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CommandBufferScopeDesc {
    pub level: u8,
    pub scoped_begin_end: bool,
    pub inheritance: Option<RenderPassInheritance>,
}

impl Default for CommandBufferScopeDesc {
    fn default() -> Self {
        CommandBufferScopeDesc {
            level: 0,
            scoped_begin_end: true,
            inheritance: None,
        }
    }
}

/// A batch of command buffers allocated together from one pool at one
/// level.
///
/// Slots advance `Fresh -> Recording -> Recorded -> Submitted` and come
/// back to `Fresh` on reset. `head` is the next slot to begin;
/// `recording_flags` tracks the open slots, and a slot must not be
/// begun twice before a reset.
pub struct CommandBufferArray {
    buffers: [vk::CommandBuffer; COMMAND_BUFFER_ARRAY_CAPACITY],
    level: u8,
    head: u8,
    recording_flags: u8,
}

impl CommandBufferArray {
    fn new(device: &Device, pool: vk::CommandPool, level: u8) -> Result<CommandBufferArray> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: if level == 0 {
                vk::CommandBufferLevel::PRIMARY
            } else {
                vk::CommandBufferLevel::SECONDARY
            },
            command_buffer_count: COMMAND_BUFFER_ARRAY_CAPACITY as u32,
            ..Default::default()
        };
        let allocated = unsafe { device.handle().allocate_command_buffers(&allocate_info)? };
        let mut buffers = [vk::CommandBuffer::null(); COMMAND_BUFFER_ARRAY_CAPACITY];
        buffers.copy_from_slice(&allocated);
        Ok(CommandBufferArray {
            buffers,
            level,
            head: 0,
            recording_flags: 0,
        })
    }

    pub const fn capacity() -> usize {
        COMMAND_BUFFER_ARRAY_CAPACITY
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn head(&self) -> u8 {
        self.head
    }

    pub fn full(&self) -> bool {
        self.head as usize >= COMMAND_BUFFER_ARRAY_CAPACITY
    }

    pub fn is_recording(&self, index: u8) -> bool {
        self.recording_flags & (1 << index) != 0
    }

    pub fn buffer(&self, index: u8) -> vk::CommandBuffer {
        self.buffers[index as usize]
    }

    /// Begins the buffer at `head` and advances it. Returns the begun
    /// slot index.
    fn begin(&mut self, device: &Device, desc: &CommandBufferScopeDesc) -> Result<u8> {
        assert!(!self.full(), "command buffer array exhausted");
        let index = self.head;
        assert!(
            self.recording_flags & (1 << index) == 0,
            "slot begun twice without reset"
        );

        let inheritance_info = desc.inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo {
                render_pass: inheritance.render_pass,
                subpass: inheritance.subpass,
                framebuffer: inheritance.framebuffer,
                ..Default::default()
            }
        });
        let mut flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        if self.level > 0 && desc.inheritance.is_some() {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        let begin_info = vk::CommandBufferBeginInfo {
            flags,
            p_inheritance_info: inheritance_info
                .as_ref()
                .map_or(std::ptr::null(), |info| info as *const _),
            ..Default::default()
        };
        unsafe {
            device
                .handle()
                .begin_command_buffer(self.buffers[index as usize], &begin_info)?
        };
        self.recording_flags |= 1 << index;
        self.head += 1;
        Ok(index)
    }

    fn end(&mut self, device: &Device, index: u8) -> Result<()> {
        assert!(self.is_recording(index));
        unsafe { device.handle().end_command_buffer(self.buffers[index as usize])? };
        self.recording_flags &= !(1 << index);
        Ok(())
    }

    /// The recorded (begun and ended) buffers, in begin order.
    pub fn recorded(&self) -> &[vk::CommandBuffer] {
        assert_eq!(self.recording_flags, 0, "array still recording");
        &self.buffers[..self.head as usize]
    }

    /// Book-keeping reset; the underlying buffers are reset through the
    /// pool (or individually when the pool allows it).
    fn reset(&mut self, device: &Device, reset_buffers: bool) -> Result<()> {
        assert_eq!(self.recording_flags, 0, "array reset while recording");
        if reset_buffers {
            for &buffer in &self.buffers[..self.head as usize] {
                unsafe {
                    device
                        .handle()
                        .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?
                };
            }
        }
        self.head = 0;
        Ok(())
    }
}

struct RecordingCursor {
    array: CommandBufferArray,
    desc: CommandBufferScopeDesc,
    open_index: Option<u8>,
}

pub struct CommandPoolConfig {
    pub queue_family_index: u32,
    pub flags: vk::CommandPoolCreateFlags,
    /// Number of levels to maintain lanes for; level 0 is primary.
    pub level_count: u32,
}

impl Default for CommandPoolConfig {
    fn default() -> Self {
        CommandPoolConfig {
            queue_family_index: 0,
            flags: vk::CommandPoolCreateFlags::empty(),
            level_count: 1,
        }
    }
}

/// Owns one command pool plus, per level, the *free*, *pending* and
/// *submitted* lanes of [`CommandBufferArray`]s, and the currently open
/// recording cursors.
pub struct CommandPoolContext {
    header: DeviceObjectHeader,
    pool: vk::CommandPool,
    config: CommandPoolConfig,
    free: Vec<Vec<CommandBufferArray>>,
    pending: Vec<VecDeque<CommandBufferArray>>,
    submitted: Vec<VecDeque<(CommandBufferArray, u64)>>,
    recording: Vec<Option<RecordingCursor>>,
    /// Callbacks attached to the next submit boundary.
    finished_callbacks: Vec<Box<dyn FnOnce(u64) + Send>>,
}

impl CommandPoolContext {
    pub fn new(
        device: Arc<Device>,
        name: impl Into<String>,
        config: CommandPoolConfig,
    ) -> Result<CommandPoolContext> {
        let create_info = vk::CommandPoolCreateInfo {
            flags: config.flags,
            queue_family_index: config.queue_family_index,
            ..Default::default()
        };
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        let header = DeviceObjectHeader::new(device, name);
        header.tag_object(pool);

        let levels = config.level_count as usize;
        Ok(CommandPoolContext {
            header,
            pool,
            config,
            free: (0..levels).map(|_| Vec::new()).collect(),
            pending: (0..levels).map(|_| VecDeque::new()).collect(),
            submitted: (0..levels).map(|_| VecDeque::new()).collect(),
            recording: (0..levels).map(|_| None).collect(),
            finished_callbacks: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        self.header.device()
    }

    pub fn queue_family_index(&self) -> u32 {
        self.config.queue_family_index
    }

    /// Obtains (creating if needed) the recording cursor for the
    /// requested level and returns a scope over the open buffer. A
    /// cursor that is already open with the same descriptor is reused.
    pub fn commands(&mut self, desc: CommandBufferScopeDesc) -> Result<CommandBufferScope<'_>> {
        let level = desc.level as usize;
        assert!(level < self.recording.len(), "level out of range");

        // A cursor recorded under a different descriptor is sealed first.
        if matches!(&self.recording[level], Some(cursor) if cursor.desc != desc) {
            self.flush_level(desc.level)?;
        }

        if self.recording[level].is_none() {
            let array = match self.free[level].pop() {
                Some(array) => array,
                None => CommandBufferArray::new(self.header.device(), self.pool, desc.level)?,
            };
            self.recording[level] = Some(RecordingCursor {
                array,
                desc,
                open_index: None,
            });
        }

        let device = self.header.device().clone();
        let cursor = self.recording[level].as_mut().unwrap();
        if cursor.open_index.is_none() {
            cursor.open_index = Some(cursor.array.begin(&device, &desc)?);
        }
        Ok(CommandBufferScope { context: self, level })
    }

    /// Ends the open recording on `level`. A full array is closed and
    /// linked onto the pending lane.
    pub fn end_commands(&mut self, level: u8) -> Result<()> {
        let device = self.header.device().clone();
        let cursor_slot = &mut self.recording[level as usize];
        let Some(cursor) = cursor_slot.as_mut() else { return Ok(()) };
        if let Some(index) = cursor.open_index.take() {
            cursor.array.end(&device, index)?;
        }
        if cursor.array.full() {
            let cursor = cursor_slot.take().unwrap();
            self.pending[level as usize].push_back(cursor.array);
        }
        Ok(())
    }

    /// Ends the open recording (if any) and moves the cursor's array to
    /// the pending lane even when it is not full.
    pub fn flush_level(&mut self, level: u8) -> Result<()> {
        self.end_commands(level)?;
        if let Some(cursor) = self.recording[level as usize].take() {
            if cursor.array.head() > 0 {
                self.pending[level as usize].push_back(cursor.array);
            } else {
                self.free[level as usize].push(cursor.array);
            }
        }
        Ok(())
    }

    /// Registers a callback for the next submit boundary; it fires when
    /// the device timeline reaches that submission's value. Used to
    /// destroy staging resources once their copy has completed.
    pub fn add_commands_finished_callback(&mut self, callback: impl FnOnce(u64) + Send + 'static) {
        self.finished_callbacks.push(Box::new(callback));
    }

    /// Tags each array with `timeline_value` and splices the list into
    /// the submitted lane; pending finished-callbacks are handed to the
    /// device reaper with the same deadline.
    pub fn enqueue_submitted(
        &mut self,
        arrays: Vec<CommandBufferArray>,
        level: u8,
        timeline_value: u64,
    ) {
        let lane = &mut self.submitted[level as usize];
        for array in arrays {
            debug_assert_eq!(array.level(), level);
            lane.push_back((array, timeline_value));
        }
        for callback in self.finished_callbacks.drain(..) {
            self.header
                .device()
                .add_timeline_callback(timeline_value, move |_, value| callback(value));
        }
    }

    /// Convenience: seals the level, enqueues its pending command
    /// buffers on `queue`, submits, and moves the arrays to the
    /// submitted lane tagged with the new timeline value.
    pub fn submit_level(&mut self, queue: &mut Queue, level: u8) -> Result<u64> {
        self.flush_level(level)?;

        let lane = &self.pending[level as usize];
        if lane.is_empty() && self.finished_callbacks.is_empty() {
            return Ok(self.header.device().current_timeline_value());
        }
        let command_buffers: Vec<vk::CommandBuffer> = lane
            .iter()
            .flat_map(|array| array.recorded().iter().copied())
            .collect();

        let _span = trace_span!("submit_level", level, buffers = command_buffers.len()).entered();

        queue.enqueue_submit(QueueSubmitInfo {
            command_buffers,
            ..Default::default()
        });
        // On failure the pending lane is left untouched for a retry.
        let timeline_value = queue.submit()?;

        let arrays: Vec<CommandBufferArray> =
            self.pending[level as usize].drain(..).collect();
        self.enqueue_submitted(arrays, level, timeline_value);
        Ok(timeline_value)
    }

    /// Returns every submitted (and pending) array to the free lane and
    /// resets the pool. Requires that no cursor is open and that the
    /// device has caught up with every submitted array.
    pub fn reset(&mut self) -> Result<()> {
        assert!(
            self.recording.iter().all(Option::is_none),
            "pool reset while a recording cursor is open"
        );
        let device = self.header.device().clone();

        if let Ok(completed) = device.completed_timeline_value() {
            debug_assert!(
                self.submitted
                    .iter()
                    .flatten()
                    .all(|(_, value)| *value <= completed),
                "pool reset while submitted work is still in flight"
            );
        }

        let per_buffer_reset = self
            .config
            .flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        if !per_buffer_reset {
            unsafe {
                device
                    .handle()
                    .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?
            };
        }

        for level in 0..self.free.len() {
            let mut reclaimed: Vec<CommandBufferArray> = self.submitted[level]
                .drain(..)
                .map(|(array, _)| array)
                .chain(self.pending[level].drain(..))
                .collect();
            for array in reclaimed.iter_mut() {
                array.reset(&device, per_buffer_reset)?;
            }
            self.free[level].append(&mut reclaimed);
        }
        trace!("command pool reset");
        Ok(())
    }
}

impl Drop for CommandPoolContext {
    fn drop(&mut self) {
        let device = self.header.device();
        // Callbacks never attached to a submit fire at the current
        // submission boundary.
        let current = device.current_timeline_value();
        for callback in self.finished_callbacks.drain(..) {
            device.add_timeline_callback(current, move |_, value| callback(value));
        }
        // The pool (and with it every command buffer) dies once the
        // device has passed the last submission that may reference it.
        let pool = self.pool;
        device.add_timeline_callback(current.saturating_add(1), move |device, _| unsafe {
            device.handle().destroy_command_pool(pool, None);
        });
    }
}

/// RAII acquisition of a recording cursor. Dereferences to the open
/// command buffer; ends the recording on drop when the descriptor asked
/// for scoped begin/end.
pub struct CommandBufferScope<'a> {
    context: &'a mut CommandPoolContext,
    level: usize,
}

impl CommandBufferScope<'_> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        let cursor = self.context.recording[self.level].as_ref().unwrap();
        cursor.array.buffer(cursor.open_index.expect("scope not recording"))
    }

    pub fn device(&self) -> &Arc<Device> {
        self.context.header.device()
    }

    /// Executes recorded secondary command buffers from this (primary)
    /// scope.
    pub fn execute_commands(&self, secondary: &[vk::CommandBuffer]) {
        if secondary.is_empty() {
            return;
        }
        unsafe {
            self.context
                .header
                .device()
                .handle()
                .cmd_execute_commands(self.command_buffer(), secondary);
        }
    }
}

impl std::ops::Deref for CommandBufferScope<'_> {
    type Target = CommandPoolContext;
    fn deref(&self) -> &CommandPoolContext {
        self.context
    }
}

impl Drop for CommandBufferScope<'_> {
    fn drop(&mut self) {
        let desc = self.context.recording[self.level]
            .as_ref()
            .map(|cursor| cursor.desc);
        if let Some(desc) = desc {
            if desc.scoped_begin_end {
                let _ = self.context.end_commands(desc.level);
            }
        }
    }
}
