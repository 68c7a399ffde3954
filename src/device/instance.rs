// Vulkan rendering instance
//
// This holds the instance-wide state: the loader entry, the VkInstance
// itself, and the debug messenger used in debug builds.

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use utils::log;

use crate::{GraupelError, Result};

// print any errors/warnings the validation layers throw at us
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

pub struct Instance {
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,

    /// the entry loads function pointers from the dynamic library
    pub(crate) loader: Entry,
    pub(crate) inst: ash::Instance,
}

impl Instance {
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = match unsafe { dr_loader.create_debug_utils_messenger(&debug_info, None) } {
            Ok(c) => c,
            Err(e) => {
                log::error!("create_debug_utils_messenger failed: {:?}", e);
                vk::DebugUtilsMessengerEXT::null()
            }
        };
        (dr_loader, callback)
    }

    /// Create a VkInstance targeting Vulkan 1.3, with the surface
    /// extensions needed for presentation.
    pub fn new() -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("Graupel").unwrap();

        let layer_names = vec![
            #[cfg(debug_assertions)]
            CString::new("VK_LAYER_KHRONOS_validation").unwrap(),
        ];
        let layer_names_raw: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let mut extension_names_raw = vec![
            khr::Surface::name().as_ptr(),
            #[cfg(target_os = "linux")]
            khr::XcbSurface::name().as_ptr(),
            #[cfg(target_os = "windows")]
            khr::Win32Surface::name().as_ptr(),
        ];
        extension_names_raw.push(ext::DebugUtils::name().as_ptr());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(|_| GraupelError::VK_NOT_ALL_EXTENSIONS_AVAILABLE)?
        };

        let (debug_loader, debug_callback) = Self::setup_debug(&entry, &instance);

        Ok(Self {
            debug_loader,
            debug_callback,
            loader: entry,
            inst: instance,
        })
    }

    /// Pick a physical device, preferring discrete GPUs over anything
    /// else the machine reports.
    pub fn select_physical_device(&self) -> Result<vk::PhysicalDevice> {
        let pdevices = unsafe {
            self.inst
                .enumerate_physical_devices()
                .map_err(GraupelError::from)?
        };

        let score = |pdev: &vk::PhysicalDevice| -> u32 {
            let props = unsafe { self.inst.get_physical_device_properties(*pdev) };
            match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 3,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                _ => 0,
            }
        };

        pdevices
            .iter()
            .max_by_key(|p| score(p))
            .copied()
            .ok_or(GraupelError::INVALID)
    }

    /// Queue family indices able to serve the requested flags, in the
    /// order the device reports them.
    pub fn find_queue_families(
        &self,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> Vec<(u32, vk::QueueFamilyProperties)> {
        let props = unsafe { self.inst.get_physical_device_queue_family_properties(pdev) };
        props
            .into_iter()
            .enumerate()
            .filter(|(_, p)| p.queue_flags.contains(flags))
            .map(|(i, p)| (i as u32, p))
            .collect()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if self.debug_callback != vk::DebugUtilsMessengerEXT::null() {
                self.debug_loader
                    .destroy_debug_utils_messenger(self.debug_callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
