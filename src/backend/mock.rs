// Scripted driver for unit tests
//
// Hands out fake handles, answers surface queries from editable state and
// records every lifecycle-relevant call into one ordered event log. Callbacks
// can write into the same log through `record`.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::ffi::CString;

use super::driver::{DeviceDesc, Driver};

#[derive(Debug, Clone, Copy)]
pub struct MockFamily {
    pub flags: vk::QueueFlags,
    pub present: bool,
}

impl MockFamily {
    pub fn new(flags: vk::QueueFlags, present: bool) -> Self {
        Self { flags, present }
    }
}

#[derive(Debug, Clone)]
pub struct MockGpu {
    pub handle: vk::PhysicalDevice,
    pub device_type: vk::PhysicalDeviceType,
    pub families: Vec<MockFamily>,
    pub extensions: Vec<CString>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainRecord {
    pub handle: vk::SwapchainKHR,
    pub old_swapchain: vk::SwapchainKHR,
    pub min_image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

pub struct MockState {
    pub events: Vec<String>,
    pub queue_family_queries: usize,
    pub surface_support_queries: usize,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Number of images the driver hands back, regardless of the request.
    pub reported_image_count: Option<u32>,
    pub surface_support_error: Option<vk::Result>,
    pub view_creation_error: Option<vk::Result>,
    pub acquire_results: VecDeque<VkResult<(u32, bool)>>,
    pub present_results: VecDeque<VkResult<bool>>,
    pub swapchains: Vec<SwapchainRecord>,
    pub live_swapchains: Vec<vk::SwapchainKHR>,
    pub live_views: Vec<vk::ImageView>,
    pub submits: usize,
    device: Option<vk::Device>,
    next_handle: u64,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockDriver {
    gpus: Vec<MockGpu>,
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(gpus: Vec<MockGpu>) -> Self {
        Self {
            gpus,
            state: Arc::new(Mutex::new(MockState {
                events: Vec::new(),
                queue_family_queries: 0,
                surface_support_queries: 0,
                capabilities: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 8,
                    current_extent: vk::Extent2D { width: 800, height: 600 },
                    min_image_extent: vk::Extent2D { width: 1, height: 1 },
                    max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                    max_image_array_layers: 1,
                    supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE
                        | vk::CompositeAlphaFlagsKHR::INHERIT,
                    supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::TRANSFER_DST,
                },
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                reported_image_count: None,
                surface_support_error: None,
                view_creation_error: None,
                acquire_results: VecDeque::new(),
                present_results: VecDeque::new(),
                swapchains: Vec::new(),
                live_swapchains: Vec::new(),
                live_views: Vec::new(),
                submits: 0,
                device: None,
                next_handle: 0x1000,
            })),
        }
    }

    /// One discrete GPU with a single family that does everything.
    pub fn standard() -> Self {
        Self::with_families(vec![MockFamily::new(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            true,
        )])
    }

    pub fn with_families(families: Vec<MockFamily>) -> Self {
        Self::new(vec![MockGpu {
            handle: vk::PhysicalDevice::from_raw(0x10),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            families,
            extensions: vec![CString::from(c"VK_KHR_swapchain")],
        }])
    }

    pub fn gpu(&self, index: usize) -> vk::PhysicalDevice {
        self.gpus[index].handle
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    /// Handle to the state that outlives the driver, for checking teardown.
    pub fn shared(&self) -> Arc<Mutex<MockState>> {
        self.state.clone()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.state.lock().events.push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn surface() -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(0x5)
    }

    fn find(&self, physical_device: vk::PhysicalDevice) -> Option<&MockGpu> {
        self.gpus.iter().find(|g| g.handle == physical_device)
    }
}

impl Driver for MockDriver {
    fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        Ok(self.gpus.iter().map(|g| g.handle).collect())
    }

    fn physical_device_properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type: self
                .find(physical_device)
                .map(|g| g.device_type)
                .unwrap_or(vk::PhysicalDeviceType::OTHER),
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        }
    }

    fn physical_device_memory_properties(
        &self,
        _physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            ..Default::default()
        }
    }

    fn queue_family_properties(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        self.state.lock().queue_family_queries += 1;
        self.find(physical_device)
            .map(|g| {
                g.families
                    .iter()
                    .map(|f| vk::QueueFamilyProperties {
                        queue_flags: f.flags,
                        queue_count: 1,
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn device_extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        Ok(self
            .find(physical_device)
            .map(|g| g.extensions.clone())
            .unwrap_or_default())
    }

    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.surface_support_queries += 1;
        if let Some(err) = state.surface_support_error {
            return Err(err);
        }
        Ok(self
            .find(physical_device)
            .and_then(|g| g.families.get(queue_family as usize))
            .map(|f| f.present)
            .unwrap_or(false))
    }

    fn surface_capabilities(
        &self,
        _physical_device: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn surface_formats(
        &self,
        _physical_device: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        let mut state = self.state.lock();
        state.events.push("query_formats".into());
        Ok(state.formats.clone())
    }

    fn surface_present_modes(
        &self,
        _physical_device: vk::PhysicalDevice,
        _surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn destroy_surface(&self, _surface: vk::SurfaceKHR) {
        self.record("destroy_surface");
    }

    fn create_device(&mut self, _physical_device: vk::PhysicalDevice, desc: &DeviceDesc) -> VkResult<vk::Device> {
        let mut state = self.state.lock();
        let handle = vk::Device::from_raw(state.next());
        state.device = Some(handle);
        state.events.push(format!("create_device families={:?}", desc.queue_families));
        Ok(handle)
    }

    fn destroy_device(&mut self) {
        let mut state = self.state.lock();
        state.device = None;
        state.events.push("destroy_device".into());
    }

    fn device_handle(&self) -> Option<vk::Device> {
        self.state.lock().device
    }

    fn device_queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x100 + u64::from(family) * 0x10 + u64::from(index))
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.record("device_wait_idle");
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.record(format!("queue_wait_idle:{:#x}", queue.as_raw()));
        Ok(())
    }

    fn queue_submit(&self, _queue: vk::Queue, submits: &[vk::SubmitInfo], _fence: vk::Fence) -> VkResult<()> {
        self.state.lock().submits += submits.len();
        Ok(())
    }

    fn create_fence(&self, _signaled: bool) -> VkResult<vk::Fence> {
        Ok(vk::Fence::from_raw(self.state.lock().next()))
    }

    fn destroy_fence(&self, _fence: vk::Fence) {}

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.state.lock().next()))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn wait_for_fences(&self, _fences: &[vk::Fence], _timeout: u64) -> VkResult<()> {
        self.record("wait_for_fences");
        Ok(())
    }

    fn reset_fences(&self, _fences: &[vk::Fence]) -> VkResult<()> {
        Ok(())
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let handle = vk::SwapchainKHR::from_raw(state.next());
        state.swapchains.push(SwapchainRecord {
            handle,
            old_swapchain: info.old_swapchain,
            min_image_count: info.min_image_count,
            format: info.image_format,
            color_space: info.image_color_space,
            extent: info.image_extent,
            usage: info.image_usage,
            composite_alpha: info.composite_alpha,
            present_mode: info.present_mode,
        });
        state.live_swapchains.push(handle);
        state.events.push(format!("create_swapchain:{:#x}", handle.as_raw()));
        Ok(handle)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.live_swapchains.retain(|&s| s != swapchain);
        state.events.push(format!("destroy_swapchain:{:#x}", swapchain.as_raw()));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut state = self.state.lock();
        let requested = state
            .swapchains
            .iter()
            .find(|r| r.handle == swapchain)
            .map(|r| r.min_image_count)
            .unwrap_or(0);
        let count = state.reported_image_count.unwrap_or(requested);
        Ok((0..count).map(|_| vk::Image::from_raw(state.next())).collect())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        if let Some(err) = state.view_creation_error {
            return Err(err);
        }
        let view = vk::ImageView::from_raw(state.next());
        state.live_views.push(view);
        state.events.push("create_view".into());
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.live_views.retain(|&v| v != view);
        state.events.push("destroy_view".into());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        _semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.events.push(format!("acquire:{:#x}", swapchain.as_raw()));
        state.acquire_results.pop_front().unwrap_or(Ok((0, false)))
    }

    fn queue_present(&self, _queue: vk::Queue, _present_info: &vk::PresentInfoKHR) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.events.push("present".into());
        state.present_results.pop_front().unwrap_or(Ok(false))
    }
}
