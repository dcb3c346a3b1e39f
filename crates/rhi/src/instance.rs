//! Vulkan instance with optional validation.
//!
//! When validation is requested and the Khronos layer is installed, a debug
//! messenger forwards layer output into `tracing` under the `vulkan`
//! target, so `RUST_LOG=vulkan=warn` filters it like any other module.

use std::ffi::{CStr, c_char};

use ash::{Entry, vk};
use tracing::{debug, error, info, warn};

use crate::error::RhiResult;

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan entry, instance and (when validating) debug messenger.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Loads Vulkan and creates an instance.
    ///
    /// `surface_extensions` are the platform extensions needed to create a
    /// window surface. Requested validation that is not installed is logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded or instance
    /// creation fails.
    pub fn new(enable_validation: bool, surface_extensions: &[*const c_char]) -> RhiResult<Self> {
        // SAFETY: loading the Vulkan library has no preconditions beyond the
        // library being a conforming loader.
        let entry = unsafe { Entry::load()? };

        let validation = enable_validation && Self::validation_layer_available(&entry)?;
        if enable_validation && !validation {
            warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"Ember")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Ember")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = surface_extensions.to_vec();
        let layers = if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        // SAFETY: every pointer in create_info outlives this call.
        let instance = unsafe { entry.create_instance(&create_info, None)? };
        info!(
            "Vulkan instance created ({} extension(s), validation {})",
            extensions.len(),
            if validation { "on" } else { "off" }
        );

        let debug = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match Self::create_messenger(&loader) {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    // SAFETY: nothing else references the instance yet.
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug.is_some()
    }

    fn validation_layer_available(entry: &Entry) -> RhiResult<bool> {
        // SAFETY: the entry was loaded successfully.
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
        }))
    }

    fn create_messenger(
        loader: &ash::ext::debug_utils::Instance,
    ) -> RhiResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        // SAFETY: the callback is a plain function valid for the program's
        // lifetime.
        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };
        debug!("Debug messenger installed");
        Ok(messenger)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: the messenger and instance are destroyed once, messenger
        // first. Devices and surfaces created from this instance are
        // dropped by their owners before it.
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the layer passes a valid callback struct for the duration of
    // the call.
    let data = unsafe { &*callback_data };
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        // SAFETY: p_message is a NUL-terminated string owned by the layer.
        unsafe { CStr::from_ptr(data.p_message).to_string_lossy() }
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "general",
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            error!(target: "vulkan", kind, "{}", message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            warn!(target: "vulkan", kind, "{}", message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            debug!(target: "vulkan", kind, "{}", message)
        }
        _ => tracing::trace!(target: "vulkan", kind, "{}", message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RhiError;

    #[test]
    fn test_headless_instance_without_validation() {
        // Requires a Vulkan loader; skipped when none is installed.
        match Instance::new(false, &[]) {
            Ok(instance) => assert!(!instance.has_validation()),
            Err(RhiError::LoadingError(_)) => eprintln!("Skipping: Vulkan not available"),
            Err(RhiError::VulkanError(e)) => eprintln!("Skipping: no usable driver ({e})"),
            Err(e) => panic!("Unexpected error: {e:?}"),
        }
    }
}
