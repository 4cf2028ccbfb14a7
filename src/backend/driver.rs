// Driver - the native calls the lifecycle core depends on
//
// Everything the selector, device manager and swapchain manager ask of the
// driver goes through this trait. `AshDriver` is the real implementation;
// tests drive the same code through a scripted mock.

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::{CStr, CString};

use super::error::{GraphicsError, GraphicsResult};
use super::instance::InstanceContext;

/// Parameters for logical device creation.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    /// Unique queue family indices; one queue is created per family.
    pub queue_families: Vec<u32>,
    pub extensions: Vec<CString>,
    pub flags: vk::DeviceCreateFlags,
}

pub trait Driver {
    // Physical devices
    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>>;
    fn physical_device_properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;
    fn physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties;
    fn queue_family_properties(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;
    fn device_extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>>;

    // Surface
    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> VkResult<bool>;
    fn surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    // Logical device
    fn create_device(&mut self, physical_device: vk::PhysicalDevice, desc: &DeviceDesc) -> VkResult<vk::Device>;
    fn destroy_device(&mut self);
    /// Handle of the live logical device, if any.
    fn device_handle(&self) -> Option<vk::Device>;
    fn device_queue(&self, family: u32, index: u32) -> vk::Queue;
    fn device_wait_idle(&self) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    // Swapchain
    fn create_swapchain(&self, create_info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    /// Returns `true` when the presentation was suboptimal.
    fn queue_present(&self, queue: vk::Queue, present_info: &vk::PresentInfoKHR) -> VkResult<bool>;
}

/// `Driver` backed by a real Vulkan instance.
///
/// Field order matters for drop: the device goes first, the instance last.
pub struct AshDriver {
    device: Option<(ash::Device, ash::extensions::khr::Swapchain)>,
    surface_loader: ash::extensions::khr::Surface,
    instance: InstanceContext,
}

impl AshDriver {
    pub fn new(instance: InstanceContext) -> Self {
        let surface_loader = ash::extensions::khr::Surface::new(instance.entry(), instance.instance());
        Self {
            device: None,
            surface_loader,
            instance,
        }
    }

    pub fn instance(&self) -> &InstanceContext {
        &self.instance
    }

    pub fn surface_loader(&self) -> &ash::extensions::khr::Surface {
        &self.surface_loader
    }

    /// The logical device, for renderer resources created from lifecycle callbacks.
    pub fn device(&self) -> GraphicsResult<&ash::Device> {
        self.device
            .as_ref()
            .map(|(device, _)| device)
            .ok_or(GraphicsError::NotInitialized("Logical device"))
    }

    fn raw_device(&self) -> VkResult<&ash::Device> {
        self.device
            .as_ref()
            .map(|(device, _)| device)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn swapchain_loader(&self) -> VkResult<&ash::extensions::khr::Swapchain> {
        self.device
            .as_ref()
            .map(|(_, loader)| loader)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }
}

impl Driver for AshDriver {
    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.instance().enumerate_physical_devices() }
    }

    fn physical_device_properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        unsafe { self.instance.instance().get_physical_device_properties(physical_device) }
    }

    fn physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .instance()
                .get_physical_device_memory_properties(physical_device)
        }
    }

    fn queue_family_properties(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .instance()
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    fn device_extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        let properties = unsafe {
            self.instance
                .instance()
                .enumerate_device_extension_properties(physical_device)
        }?;
        Ok(properties
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
            .collect())
    }

    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> VkResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, queue_family, surface)
        }
    }

    fn surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
    }

    fn surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
        }
    }

    fn surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn create_device(&mut self, physical_device: vk::PhysicalDevice, desc: &DeviceDesc) -> VkResult<vk::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = desc
            .queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const std::ffi::c_char> = desc.extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .flags(desc.flags)
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe {
            self.instance
                .instance()
                .create_device(physical_device, &create_info, None)
        }?;
        let swapchain_loader = ash::extensions::khr::Swapchain::new(self.instance.instance(), &device);
        let handle = device.handle();
        self.device = Some((device, swapchain_loader));
        Ok(handle)
    }

    fn destroy_device(&mut self) {
        if let Some((device, _)) = self.device.take() {
            unsafe { device.destroy_device(None) };
        }
    }

    fn device_handle(&self) -> Option<vk::Device> {
        self.device.as_ref().map(|(device, _)| device.handle())
    }

    fn device_queue(&self, family: u32, index: u32) -> vk::Queue {
        match self.raw_device() {
            Ok(device) => unsafe { device.get_device_queue(family, index) },
            Err(_) => vk::Queue::null(),
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.raw_device()?.device_wait_idle() }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.raw_device()?.queue_wait_idle(queue) }
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        unsafe { self.raw_device()?.queue_submit(queue, submits, fence) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.raw_device()?.create_fence(&fence_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if let Ok(device) = self.raw_device() {
            unsafe { device.destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.raw_device()?.create_semaphore(&semaphore_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if let Ok(device) = self.raw_device() {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        unsafe { self.raw_device()?.wait_for_fences(fences, true, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.raw_device()?.reset_fences(fences) }
    }

    fn create_swapchain(&self, create_info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        unsafe { self.swapchain_loader()?.create_swapchain(create_info, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Ok(loader) = self.swapchain_loader() {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader()?.get_swapchain_images(swapchain) }
    }

    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.raw_device()?.create_image_view(create_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if let Ok(device) = self.raw_device() {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader()?
                .acquire_next_image(swapchain, timeout, semaphore, fence)
        }
    }

    fn queue_present(&self, queue: vk::Queue, present_info: &vk::PresentInfoKHR) -> VkResult<bool> {
        unsafe { self.swapchain_loader()?.queue_present(queue, present_info) }
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        if self.device.is_some() {
            log::warn!("AshDriver dropped with a live logical device, destroying it now");
            let _ = self.device_wait_idle();
            self.destroy_device();
        }
    }
}
