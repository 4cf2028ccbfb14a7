// Graphics context - the single owner of the device/presentation lifecycle
//
// Construction order: instance (inside the driver) -> surface -> physical
// device -> logical device -> swapchain. Teardown runs the other way round
// in `Drop`; the instance goes last when the driver itself is dropped.

use ash::vk;
use std::ffi::CString;

use super::callbacks::CallbackRegistry;
use super::device::{LogicalDeviceManager, QueueSet};
use super::driver::{AshDriver, Driver};
use super::error::{GraphicsError, GraphicsResult};
use super::instance::{InstanceBuilder, InstanceContext, NameList};
use super::physical::{check_device_extensions, PhysicalDeviceSelector, QueueRequest, SelectedPhysicalDevice};
use super::result::CheckedResult;
use super::swapchain::{PresentationPreferences, RecreateOutcome, SwapchainManager, SwapchainState};

/// Everything the context needs to know before it touches the driver.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub app_name: String,
    /// Ignored in release builds.
    pub validation: bool,
    pub fullscreen: bool,
    pub resizable: bool,
    pub enable_compute: bool,
    /// Use this enumeration index instead of picking the best GPU.
    pub device_index: Option<usize>,
    pub device_extensions: Vec<String>,
    pub presentation: PresentationPreferences,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            app_name: "vkbase".to_string(),
            validation: true,
            fullscreen: false,
            resizable: true,
            enable_compute: true,
            device_index: None,
            device_extensions: Vec::new(),
            presentation: PresentationPreferences::default(),
        }
    }
}

/// Supplies the platform surface and the instance extensions it needs.
pub trait SurfaceProvider {
    fn required_extensions(&self) -> GraphicsResult<Vec<CString>>;
    fn create_surface(&self, instance: &InstanceContext) -> GraphicsResult<vk::SurfaceKHR>;
}

pub struct GraphicsContext<D: Driver = AshDriver> {
    callbacks: CallbackRegistry<D>,
    selector: PhysicalDeviceSelector,
    device: LogicalDeviceManager,
    swapchain: Option<SwapchainManager>,
    surface: Option<vk::SurfaceKHR>,
    settings: ContextSettings,
    // Dropped last: owns the instance.
    driver: D,
}

impl GraphicsContext<AshDriver> {
    /// Create the instance and a surface for the provider's window.
    pub fn with_surface<P: SurfaceProvider>(settings: ContextSettings, provider: &P) -> GraphicsResult<Self> {
        let instance = InstanceBuilder::new(&settings.app_name)?
            .extensions(provider.required_extensions()?)
            .validation(settings.validation)
            .build()?;
        let driver = AshDriver::new(instance);
        let surface = provider.create_surface(driver.instance())?;
        Ok(Self::new(driver, Some(surface), settings))
    }

    /// Compute-only context without presentation.
    pub fn headless(settings: ContextSettings) -> GraphicsResult<Self> {
        let instance = InstanceBuilder::new(&settings.app_name)?
            .validation(settings.validation)
            .build()?;
        Ok(Self::new(AshDriver::new(instance), None, settings))
    }
}

impl<D: Driver> GraphicsContext<D> {
    /// Takes ownership of `surface`; nothing is created until `initialize`.
    pub fn new(driver: D, surface: Option<vk::SurfaceKHR>, settings: ContextSettings) -> Self {
        let swapchain = surface.map(|surface| SwapchainManager::new(surface, settings.presentation));
        Self {
            callbacks: CallbackRegistry::new(),
            selector: PhysicalDeviceSelector::new(),
            device: LogicalDeviceManager::new(),
            swapchain,
            surface,
            settings,
            driver,
        }
    }

    /// Select the GPU, then create the logical device and the swapchain.
    ///
    /// Register lifecycle callbacks before calling this so they see the
    /// initial creation.
    pub fn initialize(&mut self) -> GraphicsResult<()> {
        let request = QueueRequest::new(true, self.settings.enable_compute, self.surface);
        let physical = match self.settings.device_index {
            Some(index) => *self.selector.determine(&self.driver, index, &request)?,
            None => *self.selector.pick_best(&self.driver, &request)?,
        };

        let mut extensions = NameList::new();
        for name in &self.settings.device_extensions {
            extensions.push_str(name)?;
        }
        for name in check_device_extensions(&self.driver, physical.handle, &extensions)? {
            log::warn!("Device extension {:?} is not available, skipping", name);
            extensions.remove(&name);
        }
        self.device.set_extensions(extensions);
        self.device.create(&mut self.driver, &mut self.callbacks, &physical)?;

        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.create(&self.driver, &mut self.callbacks, physical.handle)?;
        }
        Ok(())
    }

    fn physical(&self) -> GraphicsResult<SelectedPhysicalDevice> {
        self.selector
            .selected()
            .copied()
            .ok_or(GraphicsError::NotInitialized("Physical device"))
    }

    fn idle_tolerating_loss(&self) {
        if !self.device.is_created() {
            return;
        }
        match self.driver.device_wait_idle() {
            Ok(()) | Err(vk::Result::ERROR_DEVICE_LOST) => {}
            Err(e) => log::warn!("vkDeviceWaitIdle failed: {:?}", e),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry<D> {
        &mut self.callbacks
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn selector(&self) -> &PhysicalDeviceSelector {
        &self.selector
    }

    pub fn physical_device(&self) -> Option<&SelectedPhysicalDevice> {
        self.selector.selected()
    }

    pub fn device(&self) -> &LogicalDeviceManager {
        &self.device
    }

    pub fn queues(&self) -> &QueueSet {
        self.device.queues()
    }

    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    pub fn swapchain(&self) -> Option<&SwapchainManager> {
        self.swapchain.as_ref()
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref()?.settings().map(|s| s.extent)
    }

    pub fn surface_formats(&mut self) -> GraphicsResult<&[vk::SurfaceFormatKHR]> {
        let physical = self.physical()?.handle;
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.surface_formats(&self.driver, physical)
    }

    pub fn set_surface_format(&mut self, surface_format: vk::SurfaceFormatKHR) -> GraphicsResult<()> {
        let physical = self.physical()?.handle;
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.set_surface_format(
            &self.driver,
            &mut self.callbacks,
            physical,
            self.device.queues(),
            surface_format,
        )
    }

    /// `Ok(None)` while the window has no area (minimized).
    pub fn acquire_next_image(&mut self, semaphore: vk::Semaphore, fence: vk::Fence) -> GraphicsResult<Option<u32>> {
        let physical = self.physical()?.handle;
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.acquire_next_image(
            &self.driver,
            &mut self.callbacks,
            physical,
            self.device.queues(),
            semaphore,
            fence,
        )
    }

    pub fn present(&mut self, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> GraphicsResult<()> {
        let physical = self.physical()?.handle;
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.present(
            &self.driver,
            &mut self.callbacks,
            physical,
            self.device.queues(),
            image_index,
            wait_semaphores,
        )
    }

    pub fn recreate_swapchain(&mut self) -> GraphicsResult<RecreateOutcome> {
        let physical = self.physical()?.handle;
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.recreate(&self.driver, &mut self.callbacks, physical, self.device.queues())
    }

    /// Window resize notification.
    pub fn resize(&mut self, width: u32, height: u32) -> GraphicsResult<RecreateOutcome> {
        let swapchain = self.swapchain.as_mut().ok_or(GraphicsError::NoSurface)?;
        swapchain.set_window_extent(vk::Extent2D { width, height });
        self.recreate_swapchain()
    }

    /// Destroy and recreate the logical device on the same GPU.
    ///
    /// A live swapchain is torn down first and rebuilt once the new device
    /// and its create callbacks are in place.
    pub fn rebuild_device(&mut self) -> GraphicsResult<()> {
        let physical = self.physical()?;
        log::info!("Rebuilding logical device on {}", physical.name());

        let mut had_swapchain = false;
        if self.swapchain.is_some() {
            self.idle_tolerating_loss();
        }
        if let Some(swapchain) = self.swapchain.as_mut() {
            // A failed recreate leaves `Recreating` with no handle; it still needs a swapchain.
            had_swapchain = matches!(swapchain.state(), SwapchainState::Created | SwapchainState::Recreating);
            swapchain.destroy(&self.driver, &mut self.callbacks);
            swapchain.reset();
        }

        self.device.recreate(&mut self.driver, &mut self.callbacks, &physical)?;

        if had_swapchain {
            if let Some(swapchain) = self.swapchain.as_mut() {
                swapchain.create(&self.driver, &mut self.callbacks, physical.handle)?;
            }
        }
        Ok(())
    }

    pub fn submit_graphics(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> CheckedResult {
        self.submit(self.device.queues().graphics.map(|q| q.handle), submits, fence)
    }

    pub fn submit_compute(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> CheckedResult {
        self.submit(self.device.queues().compute.map(|q| q.handle), submits, fence)
    }

    fn submit(&self, queue: Option<vk::Queue>, submits: &[vk::SubmitInfo], fence: vk::Fence) -> CheckedResult {
        match queue {
            Some(queue) => CheckedResult::from_vk("vkQueueSubmit", self.driver.queue_submit(queue, submits, fence)),
            None => {
                log::error!("Submit without a matching queue");
                CheckedResult::of("vkQueueSubmit", vk::Result::ERROR_INITIALIZATION_FAILED)
            }
        }
    }

    /// Block until `fence` signals. No timeout.
    pub fn wait_for_fence(&self, fence: vk::Fence) -> CheckedResult {
        CheckedResult::from_vk("vkWaitForFences", self.driver.wait_for_fences(&[fence], u64::MAX))
    }

    pub fn reset_fence(&self, fence: vk::Fence) -> CheckedResult {
        CheckedResult::from_vk("vkResetFences", self.driver.reset_fences(&[fence]))
    }

    pub fn wait_idle(&self) -> CheckedResult {
        self.device.wait_idle(&self.driver)
    }
}

impl<D: Driver> Drop for GraphicsContext<D> {
    fn drop(&mut self) {
        self.idle_tolerating_loss();
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.destroy(&self.driver, &mut self.callbacks);
        }
        if let Err(e) = self.device.destroy(&mut self.driver, &mut self.callbacks) {
            log::error!("Failed to destroy logical device: {}", e);
        }
        if let Some(surface) = self.surface.take() {
            self.driver.destroy_surface(surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDriver, MockFamily};
    use ash::vk::Handle;

    fn context() -> GraphicsContext<MockDriver> {
        GraphicsContext::new(MockDriver::standard(), Some(MockDriver::surface()), ContextSettings::default())
    }

    fn hook_all(context: &mut GraphicsContext<MockDriver>) {
        let callbacks = context.callbacks_mut();
        callbacks.on_device_created(|d: &MockDriver| d.record("cb:device_created"));
        callbacks.on_device_destroying(|d: &MockDriver| d.record("cb:device_destroying"));
        callbacks.on_swapchain_created(|d: &MockDriver| d.record("cb:swapchain_created"));
        callbacks.on_swapchain_destroying(|d: &MockDriver| d.record("cb:swapchain_destroying"));
    }

    fn position(events: &[String], needle: &str) -> usize {
        events
            .iter()
            .position(|e| e.starts_with(needle))
            .unwrap_or_else(|| panic!("{} not in {:?}", needle, events))
    }

    #[test]
    fn initialize_creates_device_then_swapchain() {
        let mut context = context();
        hook_all(&mut context);
        context.initialize().unwrap();

        let events = context.driver().events();
        assert!(position(&events, "cb:device_created") < position(&events, "create_swapchain"));
        assert!(position(&events, "create_swapchain") < position(&events, "cb:swapchain_created"));
        assert!(context.device().is_created());
        assert_eq!(context.swapchain_extent().map(|e| e.width), Some(800));
        assert_eq!(context.swapchain().unwrap().image_count(), 3);
    }

    #[test]
    fn rebuild_tears_down_swapchain_before_device() {
        let mut context = context();
        hook_all(&mut context);
        context.initialize().unwrap();
        let old_swapchain = context.swapchain().unwrap().handle();
        context.driver().clear_events();

        context.rebuild_device().unwrap();

        let events = context.driver().events();
        let swapchain_gone = position(&events, &format!("destroy_swapchain:{:#x}", old_swapchain.as_raw()));
        assert!(position(&events, "cb:swapchain_destroying") < swapchain_gone);
        assert!(swapchain_gone < position(&events, "cb:device_destroying"));
        assert!(position(&events, "cb:device_destroying") < position(&events, "destroy_device"));
        assert!(position(&events, "create_device") < position(&events, "cb:device_created"));
        assert!(position(&events, "cb:device_created") < position(&events, "create_swapchain"));
        assert!(position(&events, "create_swapchain") < position(&events, "cb:swapchain_created"));

        let swapchain = context.swapchain().unwrap();
        assert_eq!(swapchain.image_count(), swapchain.image_views().len());
        assert_eq!(context.driver().state().live_swapchains, vec![swapchain.handle()]);
    }

    #[test]
    fn rebuild_after_failed_recreate_restores_swapchain() {
        let mut context = context();
        hook_all(&mut context);
        context.initialize().unwrap();
        context.driver().state().view_creation_error = Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(context.recreate_swapchain().is_err());
        assert_eq!(context.swapchain().unwrap().state(), SwapchainState::Recreating);

        context.driver().state().view_creation_error = None;
        context.driver().clear_events();
        context.rebuild_device().unwrap();

        let events = context.driver().events();
        assert!(position(&events, "cb:device_created") < position(&events, "create_swapchain"));
        assert!(position(&events, "create_swapchain") < position(&events, "cb:swapchain_created"));

        let swapchain = context.swapchain().unwrap();
        assert_eq!(swapchain.state(), SwapchainState::Created);
        assert_eq!(swapchain.image_count(), swapchain.image_views().len());
        assert_eq!(context.driver().state().live_swapchains, vec![swapchain.handle()]);
        assert_eq!(
            context.acquire_next_image(vk::Semaphore::null(), vk::Fence::null()).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn drop_releases_in_reverse_creation_order() {
        let mut context = context();
        hook_all(&mut context);
        context.initialize().unwrap();
        let state = context.driver().shared();
        context.driver().clear_events();

        drop(context);

        let state = state.lock();
        let events = &state.events;
        assert!(position(events, "cb:swapchain_destroying") < position(events, "destroy_swapchain"));
        assert!(position(events, "destroy_swapchain") < position(events, "cb:device_destroying"));
        assert!(position(events, "destroy_device") < position(events, "destroy_surface"));
        assert!(state.live_swapchains.is_empty());
        assert!(state.live_views.is_empty());
    }

    #[test]
    fn headless_context_skips_presentation() {
        let driver = MockDriver::with_families(vec![
            MockFamily::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
        ]);
        let mut context = GraphicsContext::new(driver, None, ContextSettings::default());
        context.initialize().unwrap();

        assert_eq!(context.driver().events(), vec!["create_device families=[0]"]);
        assert!(context.queues().presentation.is_none());
        assert!(!context
            .device()
            .extensions()
            .contains(ash::extensions::khr::Swapchain::name()));
        assert!(matches!(
            context.acquire_next_image(vk::Semaphore::null(), vk::Fence::null()),
            Err(GraphicsError::NoSurface)
        ));
    }

    #[test]
    fn missing_presentation_family_fails_initialization() {
        let driver = MockDriver::with_families(vec![MockFamily::new(vk::QueueFlags::GRAPHICS, false)]);
        let settings = ContextSettings {
            enable_compute: false,
            ..Default::default()
        };
        let mut context = GraphicsContext::new(driver, Some(MockDriver::surface()), settings);
        assert!(matches!(context.initialize(), Err(GraphicsError::NoSuitablePhysicalDevice)));
        assert!(!context.device().is_created());
    }

    #[test]
    fn unavailable_device_extensions_are_dropped() {
        let settings = ContextSettings {
            device_extensions: vec!["VK_EXT_made_up".to_string()],
            ..Default::default()
        };
        let mut context = GraphicsContext::new(MockDriver::standard(), Some(MockDriver::surface()), settings);
        context.initialize().unwrap();
        assert_eq!(context.device().extensions().len(), 1);
    }

    #[test]
    fn minimized_resize_is_deferred() {
        let mut context = context();
        context.initialize().unwrap();
        context.driver().state().capabilities.current_extent = vk::Extent2D { width: 0, height: 0 };
        assert_eq!(context.resize(0, 0).unwrap(), RecreateOutcome::Deferred);
        assert_eq!(
            context.acquire_next_image(vk::Semaphore::null(), vk::Fence::null()).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn submission_and_fence_helpers_report_results() {
        let mut context = context();
        let err = context.submit_graphics(&[], vk::Fence::null()).into_result().unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::Vk {
                operation: "vkQueueSubmit",
                result: vk::Result::ERROR_INITIALIZATION_FAILED
            }
        ));

        context.initialize().unwrap();
        let submit = vk::SubmitInfo::default();
        context.submit_graphics(&[submit], vk::Fence::null()).into_result().unwrap();
        context.submit_compute(&[submit], vk::Fence::null()).into_result().unwrap();
        assert_eq!(context.driver().state().submits, 2);

        let fence = vk::Fence::from_raw(0x77);
        assert!(context.wait_for_fence(fence).is_success());
        assert!(context.reset_fence(fence).is_success());
        context.wait_idle().ignore();
    }
}
