// Instance context - API instance, layers, extensions, debug messenger
//
// Layer and extension lists are append-only and de-duplicated by name.
// The validation layer and debug-utils extension are only added in
// non-release builds.

use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

use super::error::{GraphicsError, GraphicsResult, VkResultExt};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Append-only list of layer or extension names without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameList {
    names: Vec<CString>,
}

impl NameList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the name was already present.
    pub fn push(&mut self, name: &CStr) -> bool {
        if self.contains(name) {
            return false;
        }
        self.names.push(name.to_owned());
        true
    }

    pub fn push_str(&mut self, name: &str) -> GraphicsResult<bool> {
        let name = CString::new(name).map_err(|_| GraphicsError::InvalidName(name.to_string()))?;
        Ok(self.push(&name))
    }

    pub fn contains(&self, name: &CStr) -> bool {
        self.names.iter().any(|n| n.as_c_str() == name)
    }

    /// Replace the whole list; duplicates in `names` are dropped.
    pub fn replace<I: IntoIterator<Item = CString>>(&mut self, names: I) {
        self.names.clear();
        for name in names {
            self.push(&name);
        }
    }

    pub fn remove(&mut self, name: &CStr) {
        self.names.retain(|n| n.as_c_str() != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.names.iter().map(CString::as_c_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn to_vec(&self) -> Vec<CString> {
        self.names.clone()
    }

    /// Pointers valid for as long as `self` is not modified.
    pub fn as_ptrs(&self) -> Vec<*const c_char> {
        self.names.iter().map(|n| n.as_ptr()).collect()
    }

    /// Names in this list that `available` does not contain.
    pub fn missing_from(&self, available: &[CString]) -> Vec<CString> {
        self.names
            .iter()
            .filter(|n| !available.contains(n))
            .cloned()
            .collect()
    }
}

fn layer_names(properties: &[vk::LayerProperties]) -> Vec<CString> {
    properties
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) }.to_owned())
        .collect()
}

fn extension_names(properties: &[vk::ExtensionProperties]) -> Vec<CString> {
    properties
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect()
}

/// Newest instance version the loader supports, or 1.0 on a 1.0 loader.
pub fn latest_api_version(entry: &Entry) -> GraphicsResult<u32> {
    #[allow(unused_unsafe)]
    let version = unsafe { entry.try_enumerate_instance_version() }.during("vkEnumerateInstanceVersion")?;
    Ok(version.unwrap_or(vk::API_VERSION_1_0))
}

/// Requested layers the loader does not offer.
pub fn check_instance_layers(entry: &Entry, requested: &NameList) -> GraphicsResult<Vec<CString>> {
    #[allow(unused_unsafe)]
    let available = unsafe { entry.enumerate_instance_layer_properties() }
        .during("vkEnumerateInstanceLayerProperties")?;
    Ok(requested.missing_from(&layer_names(&available)))
}

/// Requested instance extensions not offered by the loader (or by `layer`).
pub fn check_instance_extensions(
    entry: &Entry,
    requested: &NameList,
    layer: Option<&CStr>,
) -> GraphicsResult<Vec<CString>> {
    #[allow(unused_unsafe)]
    let available = unsafe { entry.enumerate_instance_extension_properties(layer) }
        .during("vkEnumerateInstanceExtensionProperties")?;
    Ok(requested.missing_from(&extension_names(&available)))
}

pub struct InstanceBuilder {
    entry: Entry,
    app_name: String,
    layers: NameList,
    extensions: NameList,
    flags: vk::InstanceCreateFlags,
    validation: bool,
}

impl InstanceBuilder {
    /// Load the Vulkan library and start describing an instance.
    pub fn new(app_name: &str) -> GraphicsResult<Self> {
        let entry = unsafe { Entry::load() }?;
        Ok(Self {
            entry,
            app_name: app_name.to_string(),
            layers: NameList::new(),
            extensions: NameList::new(),
            flags: vk::InstanceCreateFlags::empty(),
            validation: false,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn layer(mut self, name: &CStr) -> Self {
        self.layers.push(name);
        self
    }

    pub fn extension(mut self, name: &CStr) -> Self {
        self.extensions.push(name);
        self
    }

    pub fn extensions<I: IntoIterator<Item = CString>>(mut self, names: I) -> Self {
        for name in names {
            self.extensions.push(&name);
        }
        self
    }

    pub fn flags(mut self, flags: vk::InstanceCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Request the validation layer; ignored in release builds.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable && cfg!(debug_assertions);
        self
    }

    pub fn build(mut self) -> GraphicsResult<InstanceContext> {
        if self.validation {
            self.layers.push(VALIDATION_LAYER);
            self.extensions.push(ash::extensions::ext::DebugUtils::name());
        }

        for missing in check_instance_layers(&self.entry, &self.layers)? {
            log::warn!("Instance layer {:?} is not available, skipping it", missing);
            self.layers.remove(&missing);
        }
        if self.validation && !self.layers.contains(VALIDATION_LAYER) {
            self.extensions.remove(ash::extensions::ext::DebugUtils::name());
            self.validation = false;
        }

        let api_version = latest_api_version(&self.entry)?;

        let app_name = CString::new(self.app_name.as_str())
            .map_err(|_| GraphicsError::InvalidName(self.app_name.clone()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkbase")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let layer_ptrs = self.layers.as_ptrs();
        let extension_ptrs = self.extensions.as_ptrs();
        let create_info = vk::InstanceCreateInfo::builder()
            .flags(self.flags)
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { self.entry.create_instance(&create_info, None) }.during("vkCreateInstance")?;

        log::info!(
            "Vulkan API Version: {}.{}.{}",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version)
        );

        let debug_utils = if self.validation {
            match setup_debug_messenger(&self.entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(InstanceContext {
            debug_utils,
            instance,
            entry: self.entry,
            api_version,
            layers: self.layers,
            extensions: self.extensions,
        })
    }
}

/// Owns the API instance. Destroyed last, after device and surface are gone.
pub struct InstanceContext {
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    entry: Entry,
    api_version: u32,
    layers: NameList,
    extensions: NameList,
}

impl InstanceContext {
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn layers(&self) -> &NameList {
        &self.layers
    }

    pub fn extensions(&self) -> &NameList {
        &self.extensions
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> GraphicsResult<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .during("vkCreateDebugUtilsMessengerEXT")?;

    Ok((debug_utils, messenger))
}

// Routes validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_deduplicates() {
        let mut list = NameList::new();
        assert!(list.push(c"VK_KHR_surface"));
        assert!(!list.push(c"VK_KHR_surface"));
        assert!(list.push_str("VK_KHR_swapchain").unwrap());
        assert!(!list.push_str("VK_KHR_swapchain").unwrap());
        assert_eq!(list.len(), 2);
        assert_eq!(list.as_ptrs().len(), 2);
    }

    #[test]
    fn name_list_keeps_insertion_order() {
        let mut list = NameList::new();
        list.push(c"b");
        list.push(c"a");
        list.push(c"b");
        let names: Vec<&CStr> = list.iter().collect();
        assert_eq!(names, vec![c"b", c"a"]);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut list = NameList::new();
        assert!(matches!(list.push_str("bad\0name"), Err(GraphicsError::InvalidName(_))));
        assert!(list.is_empty());
    }

    #[test]
    fn replace_drops_duplicates() {
        let mut list = NameList::new();
        list.push(c"old");
        list.replace(vec![c"x".to_owned(), c"y".to_owned(), c"x".to_owned()]);
        assert_eq!(list.to_vec(), vec![c"x".to_owned(), c"y".to_owned()]);
    }

    #[test]
    fn missing_names_are_reported() {
        let mut list = NameList::new();
        list.push(c"VK_KHR_swapchain");
        list.push(c"VK_EXT_made_up");
        let available = vec![c"VK_KHR_swapchain".to_owned(), c"VK_KHR_maintenance1".to_owned()];
        assert_eq!(list.missing_from(&available), vec![c"VK_EXT_made_up".to_owned()]);
    }
}
