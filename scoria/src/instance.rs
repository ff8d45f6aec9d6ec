//! Vulkan instance creation and the validation messenger.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use ash::vk;
use once_cell::sync::Lazy;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// Environment variable tuning the minimum severity echoed by the
/// validation messenger: `off` (also disables the error trap), `error`,
/// `warn` (default), `info` or `verbose`.
pub const VALIDATION_LOG_ENV: &str = "SCORIA_VALIDATION_LOG";

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Minimum severity echoed by the messenger, as the raw severity bit.
/// Parsed from [`VALIDATION_LOG_ENV`] on first use.
static LOG_SEVERITY_FLOOR: Lazy<u32> = Lazy::new(severity_floor_from_env);

pub struct InstanceConfig {
    pub application_name: String,
    pub engine_name: String,
    pub application_version: u32,
    pub engine_version: u32,
    pub api_version: u32,
    /// Enable the Khronos validation layer and the debug messenger.
    pub validation: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            application_name: "scoria".to_string(),
            engine_name: "scoria".to_string(),
            application_version: 0,
            engine_version: 0,
            api_version: vk::API_VERSION_1_2,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Owns the `ash` entry points, the instance, and (with validation on)
/// the debug messenger.
pub struct Instance {
    entry: ash::Entry,
    instance: ash::Instance,
    vk_khr_surface: ash::extensions::khr::Surface,
    vk_ext_debug_utils: Option<ash::extensions::ext::DebugUtils>,
    debug_messenger: vk::DebugUtilsMessengerEXT,
    validation: bool,
}

unsafe extern "system" fn debug_utils_message_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if (*p_callback_data).p_message.is_null() {
        ""
    } else {
        CStr::from_ptr((*p_callback_data).p_message)
            .to_str()
            .unwrap_or("<invalid utf-8 in validation message>")
    };

    if message_severity.as_raw() < *LOG_SEVERITY_FLOOR {
        return vk::FALSE;
    }

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "scoria::validation", "{}", message);
        // Unwinding across the loader is not an option.
        std::process::abort();
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "scoria::validation", "{}", message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!(target: "scoria::validation", "{}", message);
    } else {
        trace!(target: "scoria::validation", "{}", message);
    }
    vk::FALSE
}

fn severity_floor_from_env() -> u32 {
    match std::env::var(VALIDATION_LOG_ENV).ok().as_deref() {
        Some("off") => u32::MAX,
        Some("error") => vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
        Some("info") => vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw(),
        Some("verbose") => vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw(),
        _ => vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw(),
    }
}

impl Instance {
    pub fn new(config: InstanceConfig) -> Result<Instance> {
        let entry = unsafe {
            ash::Entry::load().map_err(|_| Error::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))?
        };

        let available_layers = entry.enumerate_instance_layer_properties()?;
        let validation_available = config.validation
            && available_layers.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
            });
        if config.validation && !validation_available {
            warn!("validation requested but the layer is not available");
        }

        let available_extensions = entry.enumerate_instance_extension_properties(None)?;
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut push_if_present = |name: &CStr| {
            let present = has_extension(name);
            if present {
                extensions.push(name.as_ptr());
            }
            present
        };

        push_if_present(ash::extensions::khr::Surface::name());
        #[cfg(windows)]
        push_if_present(ash::extensions::khr::Win32Surface::name());
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            push_if_present(ash::extensions::khr::XlibSurface::name());
            push_if_present(ash::extensions::khr::WaylandSurface::name());
        }
        let debug_utils_available =
            validation_available && push_if_present(ash::extensions::ext::DebugUtils::name());

        let application_name = CString::new(config.application_name.as_str()).unwrap();
        let engine_name = CString::new(config.engine_name.as_str()).unwrap();

        let application_info = vk::ApplicationInfo {
            p_application_name: application_name.as_ptr(),
            application_version: config.application_version,
            p_engine_name: engine_name.as_ptr(),
            engine_version: config.engine_version,
            api_version: config.api_version,
            ..Default::default()
        };

        let layers = [VALIDATION_LAYER.as_ptr()];
        let instance_create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            enabled_layer_count: if validation_available { 1 } else { 0 },
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };

        let instance = unsafe { entry.create_instance(&instance_create_info, None)? };
        let vk_khr_surface = ash::extensions::khr::Surface::new(&entry, &instance);

        let (vk_ext_debug_utils, debug_messenger) = if debug_utils_available {
            let debug_utils = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_utils_message_callback),
                ..Default::default()
            };
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&messenger_create_info, None)? };
            (Some(debug_utils), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        debug!(validation = validation_available, "instance created");

        Ok(Instance {
            entry,
            instance,
            vk_khr_surface,
            vk_ext_debug_utils,
            debug_messenger,
            validation: validation_available,
        })
    }

    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(crate) fn vk_khr_surface(&self) -> &ash::extensions::khr::Surface {
        &self.vk_khr_surface
    }

    pub(crate) fn vk_ext_debug_utils(&self) -> Option<&ash::extensions::ext::DebugUtils> {
        self.vk_ext_debug_utils.as_ref()
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    /// Enumerates the physical devices visible through this instance.
    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.instance.enumerate_physical_devices()? })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug_utils) = &self.vk_ext_debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
