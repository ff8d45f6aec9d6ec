//! Device context: logical device, queue families, memory allocator,
//! and the submission timeline with its deferred-destruction callbacks.

use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, trace, trace_span, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::Instance;

/// Upper bound on simultaneously created queues, mirroring the fixed
/// arrays used on the submission paths.
pub const MAX_QUEUES: usize = 4;

pub struct DeviceConfig {
    /// Index into [`Instance::physical_devices`].
    pub physical_device_index: usize,
    /// Queue families to create queues on, one queue per entry. Empty
    /// means "one queue on the first graphics+compute family".
    pub queue_family_requests: Vec<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            physical_device_index: 0,
            queue_family_requests: Vec::new(),
        }
    }
}

/// A deferred host-side destructor, fired once the device timeline has
/// reached its deadline.
struct TimelineCallback {
    deadline: u64,
    callback: Box<dyn FnOnce(&Device, u64) + Send>,
}

/// The pending-callback list and the reaper that matches deadlines
/// against the signalled timeline value, firing each callback at most
/// once no matter how often the reaper runs.
struct TimelineCallbacks {
    pending: Mutex<Vec<TimelineCallback>>,
}

impl TimelineCallbacks {
    fn new() -> TimelineCallbacks {
        TimelineCallbacks {
            pending: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, deadline: u64, callback: Box<dyn FnOnce(&Device, u64) + Send>) {
        self.pending.lock().unwrap().push(TimelineCallback { deadline, callback });
    }

    /// Extracts the callbacks whose deadline has been reached. Fired
    /// outside the lock so callbacks may re-enqueue.
    fn take_reached(&self, completed: u64) -> Vec<TimelineCallback> {
        let mut pending = self.pending.lock().unwrap();
        let mut reached = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].deadline <= completed {
                reached.push(pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
        reached
    }

    fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Wrapper around a logical device, its queues info, allocator and
/// submission timeline.
///
/// The device is *active* until shutdown begins, then *draining*: a
/// one-way transition that waits for the device to go idle, flushes
/// every pending timeline callback, and refuses new submissions.
pub struct Device {
    device: ash::Device,
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    physical_device_properties: vk::PhysicalDeviceProperties,
    physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,
    created_queue_families: Vec<u32>,
    allocator: Mutex<Option<Allocator>>,
    vk_khr_swapchain: ash::extensions::khr::Swapchain,

    /// Monotonic submission counter. Every submission takes the next
    /// value and signals it on `timeline_semaphore`.
    timeline_value: AtomicU64,
    timeline_semaphore: vk::Semaphore,
    timeline_callbacks: TimelineCallbacks,

    draining: AtomicBool,
    lost: AtomicBool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("timeline_value", &self.timeline_value.load(Ordering::Relaxed))
            .finish()
    }
}

fn find_default_queue_family(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
        .ok_or(Error::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))
}

impl Device {
    pub fn new(instance: Arc<Instance>, config: DeviceConfig) -> Result<Arc<Device>> {
        let _span = trace_span!("device_new").entered();

        let physical_devices = instance.physical_devices()?;
        let physical_device = *physical_devices
            .get(config.physical_device_index)
            .ok_or(Error::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        let (physical_device_properties, physical_device_memory_properties, queue_family_properties) = unsafe {
            (
                instance.handle().get_physical_device_properties(physical_device),
                instance.handle().get_physical_device_memory_properties(physical_device),
                instance
                    .handle()
                    .get_physical_device_queue_family_properties(physical_device),
            )
        };

        let mut requested_families = config.queue_family_requests.clone();
        if requested_families.is_empty() {
            requested_families.push(find_default_queue_family(&queue_family_properties)?);
        }
        assert!(requested_families.len() <= MAX_QUEUES);
        for &family in &requested_families {
            assert!((family as usize) < queue_family_properties.len());
        }

        let queue_priority = 1.0f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = requested_families
            .iter()
            .map(|&family| vk::DeviceQueueCreateInfo {
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: &queue_priority,
                ..Default::default()
            })
            .collect();

        let device_extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        };
        let device_create_info = vk::DeviceCreateInfo {
            p_next: &mut vulkan_12_features as *mut _ as *mut std::os::raw::c_void,
            queue_create_info_count: queue_create_infos.len() as u32,
            p_queue_create_infos: queue_create_infos.as_ptr(),
            enabled_extension_count: device_extensions.len() as u32,
            pp_enabled_extension_names: device_extensions.as_ptr(),
            ..Default::default()
        };

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device, &device_create_info, None)?
        };
        let vk_khr_swapchain = ash::extensions::khr::Swapchain::new(instance.handle(), &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
        })?;

        let mut timeline_create_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value: 0,
            ..Default::default()
        };
        let semaphore_create_info = vk::SemaphoreCreateInfo {
            p_next: &mut timeline_create_info as *mut _ as *mut std::os::raw::c_void,
            ..Default::default()
        };
        let timeline_semaphore = unsafe { device.create_semaphore(&semaphore_create_info, None)? };

        let device_name = unsafe {
            CStr::from_ptr(physical_device_properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        debug!(device_name = %device_name, families = ?requested_families, "device created");

        Ok(Arc::new(Device {
            device,
            instance,
            physical_device,
            physical_device_properties,
            physical_device_memory_properties,
            queue_family_properties,
            created_queue_families: requested_families,
            allocator: Mutex::new(Some(allocator)),
            vk_khr_swapchain,
            timeline_value: AtomicU64::new(0),
            timeline_semaphore,
            timeline_callbacks: TimelineCallbacks::new(),
            draining: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }))
    }

    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn physical_device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.physical_device_properties
    }

    pub fn physical_device_memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical_device_memory_properties
    }

    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_family_properties
    }

    pub fn created_queue_families(&self) -> &[u32] {
        &self.created_queue_families
    }

    pub(crate) fn vk_khr_swapchain(&self) -> &ash::extensions::khr::Swapchain {
        &self.vk_khr_swapchain
    }

    /// Runs `f` with the memory allocator. Panics after shutdown began.
    pub(crate) fn with_allocator<T>(&self, f: impl FnOnce(&mut Allocator) -> T) -> T {
        let mut guard = self.allocator.lock().unwrap();
        f(guard.as_mut().expect("allocator used after device drain"))
    }

    // --- timeline ------------------------------------------------------

    pub fn timeline_semaphore(&self) -> vk::Semaphore {
        self.timeline_semaphore
    }

    /// The last value handed out to a submission.
    pub fn current_timeline_value(&self) -> u64 {
        self.timeline_value.load(Ordering::Acquire)
    }

    /// Allocates the timeline value for the next submission.
    pub(crate) fn next_timeline_value(&self) -> u64 {
        self.timeline_value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The timeline value the device has signalled so far.
    pub fn completed_timeline_value(&self) -> Result<u64> {
        let value = unsafe { self.device.get_semaphore_counter_value(self.timeline_semaphore)? };
        Ok(value)
    }

    /// Blocks until the timeline reaches `value` or `timeout_ns` passes
    /// (`u64::MAX` waits forever). Returns whether the value was reached.
    pub fn wait_timeline_value(&self, value: u64, timeout_ns: u64) -> Result<bool> {
        let semaphores = [self.timeline_semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: semaphores.as_ptr(),
            p_values: values.as_ptr(),
            ..Default::default()
        };
        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Schedules `callback` to run once the device has signalled
    /// `deadline`. Callbacks run on whichever thread drives the reaper.
    pub fn add_timeline_callback(
        &self,
        deadline: u64,
        callback: impl FnOnce(&Device, u64) + Send + 'static,
    ) {
        self.timeline_callbacks.add(deadline, Box::new(callback));
    }

    /// The reaper: fires every pending callback whose deadline the
    /// device has reached. Each callback runs exactly once regardless of
    /// how many times this is called.
    pub fn process_timeline_callbacks(&self) -> Result<usize> {
        let completed = self.completed_timeline_value()?;
        let reached = self.timeline_callbacks.take_reached(completed);
        let count = reached.len();
        if count > 0 {
            trace!(completed, count, "firing timeline callbacks");
        }
        for entry in reached {
            (entry.callback)(self, completed);
        }
        Ok(count)
    }

    // --- state machine -------------------------------------------------

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Marks the device lost. Subsequent submissions are refused.
    pub(crate) fn note_device_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            warn!("device lost, draining");
        }
        self.draining.store(true, Ordering::Release);
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Begins shutdown: waits for the device to go idle, then flushes
    /// every pending timeline callback. One transition, one direction.
    pub fn drain(&self) -> Result<()> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _span = trace_span!("device_drain").entered();
        self.wait_idle()?;
        // Everything submitted has completed; fire the whole list.
        self.flush_timeline_callbacks();
        debug_assert_eq!(self.timeline_callbacks.len(), 0);
        Ok(())
    }

    /// Fires every pending callback unconditionally. Callbacks may
    /// enqueue further callbacks (dropping a staging buffer schedules
    /// its destroy), so loop until the list is dry.
    fn flush_timeline_callbacks(&self) {
        let completed = self.current_timeline_value();
        loop {
            let remaining = self.timeline_callbacks.take_reached(u64::MAX);
            if remaining.is_empty() {
                break;
            }
            for entry in remaining {
                (entry.callback)(self, completed);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.drain();
        // Destructors scheduled after an explicit drain still fire.
        self.flush_timeline_callbacks();
        unsafe {
            // The allocator must release its blocks before the device goes.
            *self.allocator.lock().unwrap() = None;
            self.device.destroy_semaphore(self.timeline_semaphore, None);
            self.device.destroy_device(None);
        }
        debug!("device destroyed");
    }
}

/// Identity carried by every GPU-owning object: a strong device
/// reference, a debug uid and a name.
pub struct DeviceObjectHeader {
    device: Arc<Device>,
    uid: Uuid,
    name: String,
}

impl DeviceObjectHeader {
    pub fn new(device: Arc<Device>, name: impl Into<String>) -> DeviceObjectHeader {
        DeviceObjectHeader {
            device,
            uid: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the object's name to a raw handle for the debug layers.
    pub fn tag_object<H: vk::Handle>(&self, object: H) {
        let Some(debug_utils) = self.device.instance().vk_ext_debug_utils() else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(self.name.as_str()) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT {
            object_type: H::TYPE,
            object_handle: object.as_raw(),
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        unsafe {
            let _ = debug_utils.set_debug_utils_object_name(self.device.handle().handle(), &name_info);
        }
    }
}

impl fmt::Debug for DeviceObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceObjectHeader")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // The callback-list logic is pure bookkeeping; exercise it without
    // a device by driving `take_reached` directly.
    #[test]
    fn callbacks_fire_once_at_their_deadline() {
        let callbacks = TimelineCallbacks::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            callbacks.add(5, Box::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(callbacks.take_reached(4).is_empty());
        assert_eq!(callbacks.take_reached(5).len(), 1);
        // Reaper runs again: nothing left to fire.
        assert!(callbacks.take_reached(5).is_empty());
        assert!(callbacks.take_reached(u64::MAX).is_empty());
    }

    #[test]
    fn reaper_only_takes_reached_deadlines() {
        let callbacks = TimelineCallbacks::new();
        callbacks.add(1, Box::new(|_, _| {}));
        callbacks.add(3, Box::new(|_, _| {}));
        callbacks.add(10, Box::new(|_, _| {}));

        assert_eq!(callbacks.take_reached(3).len(), 2);
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks.take_reached(u64::MAX).len(), 1);
    }
}
