// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, and
// rebuilds it when the surface changes size or goes stale.
//
// Recreation order: idle the graphics/presentation queues, swapchain-destroy
// callbacks, old image views, new swapchain (old one passed as
// `old_swapchain`), new views, swapchain-create callbacks. The old swapchain
// handle itself is retired and only destroyed on the next acquire.

use ash::vk;

use super::callbacks::{CallbackRegistry, LifecycleEvent};
use super::device::QueueSet;
use super::driver::Driver;
use super::error::{GraphicsError, GraphicsResult, VkResultExt};

/// Format tried first when the caller has no preference.
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Created,
    Recreating,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Recreated,
    /// The surface has a zero-sized extent (e.g. minimized window); nothing changed.
    Deferred,
}

/// Caller preferences that shape every (re)creation.
#[derive(Debug, Clone, Copy)]
pub struct PresentationPreferences {
    /// `false` asks for a non-blocking present mode when available.
    pub limit_frame_rate: bool,
    pub surface_format: Option<vk::SurfaceFormatKHR>,
    /// Used only when the surface leaves the extent up to the swapchain.
    pub window_extent: vk::Extent2D,
    pub flags: vk::SwapchainCreateFlagsKHR,
}

impl Default for PresentationPreferences {
    fn default() -> Self {
        Self {
            limit_frame_rate: true,
            surface_format: None,
            window_extent: vk::Extent2D { width: 1280, height: 720 },
            flags: vk::SwapchainCreateFlagsKHR::empty(),
        }
    }
}

/// Snapshot of the parameters a swapchain was created with.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub surface: vk::SurfaceKHR,
    pub flags: vk::SwapchainCreateFlagsKHR,
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl SwapchainSettings {
    pub fn resolve(
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        preferences: &PresentationPreferences,
    ) -> GraphicsResult<Self> {
        Ok(Self {
            surface,
            flags: preferences.flags,
            min_image_count: choose_image_count(capabilities),
            surface_format: resolve_surface_format(formats, preferences.surface_format)?,
            extent: choose_extent(capabilities, preferences.window_extent),
            usage: choose_usage(capabilities),
            pre_transform: capabilities.current_transform,
            composite_alpha: choose_composite_alpha(capabilities),
            present_mode: choose_present_mode(present_modes, preferences.limit_frame_rate)?,
        })
    }

    fn create_info(&self, old_swapchain: vk::SwapchainKHR) -> vk::SwapchainCreateInfoKHR {
        vk::SwapchainCreateInfoKHR::builder()
            .flags(self.flags)
            .surface(self.surface)
            .min_image_count(self.min_image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(self.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(self.pre_transform)
            .composite_alpha(self.composite_alpha)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain)
            .build()
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        image_count.min(capabilities.max_image_count)
    } else {
        image_count
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// INHERIT when supported, otherwise the lowest supported bit.
pub fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    let supported = capabilities.supported_composite_alpha;
    if supported.contains(vk::CompositeAlphaFlagsKHR::INHERIT) {
        return vk::CompositeAlphaFlagsKHR::INHERIT;
    }
    (0..4)
        .map(|bit| vk::CompositeAlphaFlagsKHR::from_raw(1 << bit))
        .find(|&flag| supported.contains(flag))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub fn choose_usage(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    let supported = capabilities.supported_usage_flags;
    let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    if supported.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if supported.contains(vk::ImageUsageFlags::TRANSFER_DST) {
        usage |= vk::ImageUsageFlags::TRANSFER_DST;
    } else {
        log::warn!("Swapchain images do not support TRANSFER_DST usage");
    }
    usage
}

/// Exact match, then any format in the requested colour space, then the
/// first pair the driver reports.
pub fn resolve_surface_format(
    available: &[vk::SurfaceFormatKHR],
    requested: Option<vk::SurfaceFormatKHR>,
) -> GraphicsResult<vk::SurfaceFormatKHR> {
    let first = *available.first().ok_or(GraphicsError::NoSurfaceFormats)?;
    let requested = requested.unwrap_or(DEFAULT_SURFACE_FORMAT);

    let exact = available
        .iter()
        .find(|f| f.format == requested.format && f.color_space == requested.color_space);
    if let Some(found) = exact {
        return Ok(*found);
    }

    if let Some(found) = available.iter().find(|f| f.color_space == requested.color_space) {
        if requested.format != vk::Format::UNDEFINED {
            log::info!(
                "Surface format {:?} unavailable, using {:?} in {:?}",
                requested.format,
                found.format,
                found.color_space
            );
        }
        return Ok(*found);
    }

    log::warn!(
        "No surface format in {:?}, falling back to {:?} / {:?}",
        requested.color_space,
        first.format,
        first.color_space
    );
    Ok(first)
}

/// MAILBOX when frame rate is not limited and the driver offers it, else FIFO.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    limit_frame_rate: bool,
) -> GraphicsResult<vk::PresentModeKHR> {
    if present_modes.is_empty() {
        return Err(GraphicsError::NoPresentModes);
    }
    if !limit_frame_rate && present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return Ok(vk::PresentModeKHR::MAILBOX);
    }
    Ok(vk::PresentModeKHR::FIFO)
}

pub struct SwapchainManager {
    state: SwapchainState,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    /// Previous swapchain, destroyed on the next acquire.
    retired: Option<vk::SwapchainKHR>,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    settings: Option<SwapchainSettings>,
    available_formats: Vec<vk::SurfaceFormatKHR>,
    preferences: PresentationPreferences,
}

impl SwapchainManager {
    pub fn new(surface: vk::SurfaceKHR, preferences: PresentationPreferences) -> Self {
        Self {
            state: SwapchainState::Uninitialized,
            surface,
            handle: vk::SwapchainKHR::null(),
            retired: None,
            images: Vec::new(),
            image_views: Vec::new(),
            settings: None,
            available_formats: Vec::new(),
            preferences,
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn retired(&self) -> Option<vk::SwapchainKHR> {
        self.retired
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Parameters of the current (or last) swapchain.
    pub fn settings(&self) -> Option<&SwapchainSettings> {
        self.settings.as_ref()
    }

    pub fn preferences(&self) -> &PresentationPreferences {
        &self.preferences
    }

    pub fn set_window_extent(&mut self, extent: vk::Extent2D) {
        self.preferences.window_extent = extent;
    }

    pub fn set_limit_frame_rate(&mut self, limit: bool) {
        self.preferences.limit_frame_rate = limit;
    }

    /// Surface formats, queried once and cached.
    pub fn surface_formats<D: Driver>(
        &mut self,
        driver: &D,
        physical_device: vk::PhysicalDevice,
    ) -> GraphicsResult<&[vk::SurfaceFormatKHR]> {
        if self.available_formats.is_empty() {
            let formats = driver
                .surface_formats(physical_device, self.surface)
                .during("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            if formats.is_empty() {
                log::error!("Failed to find any supported surface format");
                return Err(GraphicsError::NoSurfaceFormats);
            }
            self.available_formats = formats;
        }
        Ok(&self.available_formats)
    }

    fn resolve_settings<D: Driver>(
        &mut self,
        driver: &D,
        physical_device: vk::PhysicalDevice,
        capabilities: &vk::SurfaceCapabilitiesKHR,
    ) -> GraphicsResult<SwapchainSettings> {
        self.surface_formats(driver, physical_device)?;
        let present_modes = driver
            .surface_present_modes(physical_device, self.surface)
            .during("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        SwapchainSettings::resolve(
            self.surface,
            capabilities,
            &self.available_formats,
            &present_modes,
            &self.preferences,
        )
    }

    pub fn create<D: Driver>(
        &mut self,
        driver: &D,
        callbacks: &mut CallbackRegistry<D>,
        physical_device: vk::PhysicalDevice,
    ) -> GraphicsResult<()> {
        if self.state == SwapchainState::Created {
            log::warn!("Swapchain already exists, skipping creation");
            return Ok(());
        }

        let capabilities = driver
            .surface_capabilities(physical_device, self.surface)
            .during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let settings = self.resolve_settings(driver, physical_device, &capabilities)?;

        self.install(driver, settings, vk::SwapchainKHR::null())?;
        callbacks.dispatch(LifecycleEvent::SwapchainCreated, driver);
        Ok(())
    }

    /// Rebuild the swapchain for the surface's current extent.
    pub fn recreate<D: Driver>(
        &mut self,
        driver: &D,
        callbacks: &mut CallbackRegistry<D>,
        physical_device: vk::PhysicalDevice,
        queues: &QueueSet,
    ) -> GraphicsResult<RecreateOutcome> {
        if !matches!(self.state, SwapchainState::Created | SwapchainState::Recreating) {
            return Err(GraphicsError::NotInitialized("Swapchain"));
        }

        let capabilities = driver
            .surface_capabilities(physical_device, self.surface)
            .during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        if capabilities.current_extent.width == 0 || capabilities.current_extent.height == 0 {
            log::debug!("Surface extent is zero, deferring swapchain recreation");
            return Ok(RecreateOutcome::Deferred);
        }

        for queue in queues.presentation_related() {
            driver.queue_wait_idle(queue).during("vkQueueWaitIdle")?;
        }

        // Anything retired earlier is unreferenced now that the queues are idle.
        if let Some(older) = self.retired.take() {
            driver.destroy_swapchain(older);
        }

        let announced = self.state == SwapchainState::Created;
        self.state = SwapchainState::Recreating;
        if announced {
            callbacks.dispatch(LifecycleEvent::SwapchainDestroying, driver);
        }
        self.destroy_views(driver);

        let old_swapchain = std::mem::replace(&mut self.handle, vk::SwapchainKHR::null());
        if old_swapchain != vk::SwapchainKHR::null() {
            self.retired = Some(old_swapchain);
        }

        let settings = self.resolve_settings(driver, physical_device, &capabilities)?;
        self.install(driver, settings, old_swapchain)?;

        callbacks.dispatch(LifecycleEvent::SwapchainCreated, driver);
        Ok(RecreateOutcome::Recreated)
    }

    /// Create swapchain, images and views; leaves nothing behind on failure.
    fn install<D: Driver>(
        &mut self,
        driver: &D,
        settings: SwapchainSettings,
        old_swapchain: vk::SwapchainKHR,
    ) -> GraphicsResult<()> {
        let create_info = settings.create_info(old_swapchain);
        let swapchain = driver
            .create_swapchain(&create_info)
            .during("vkCreateSwapchainKHR")?;

        let images = match driver.swapchain_images(swapchain).during("vkGetSwapchainImagesKHR") {
            Ok(images) => images,
            Err(e) => {
                driver.destroy_swapchain(swapchain);
                return Err(e);
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(settings.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            match driver.create_image_view(&create_info).during("vkCreateImageView") {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views.drain(..) {
                        driver.destroy_image_view(view);
                    }
                    driver.destroy_swapchain(swapchain);
                    return Err(e);
                }
            }
        }

        log::info!(
            "Created swapchain {}x{} with {} images ({:?} / {:?}, {:?})",
            settings.extent.width,
            settings.extent.height,
            images.len(),
            settings.surface_format.format,
            settings.surface_format.color_space,
            settings.present_mode
        );

        self.handle = swapchain;
        self.images = images;
        self.image_views = image_views;
        self.preferences.surface_format = Some(settings.surface_format);
        self.settings = Some(settings);
        self.state = SwapchainState::Created;
        Ok(())
    }

    fn destroy_views<D: Driver>(&mut self, driver: &D) {
        for view in self.image_views.drain(..) {
            driver.destroy_image_view(view);
        }
        self.images.clear();
    }

    /// Free the previous swapchain if one is still pending.
    pub fn release_retired<D: Driver>(&mut self, driver: &D) {
        if let Some(retired) = self.retired.take() {
            if retired != self.handle {
                log::debug!("Destroying retired swapchain {:?}", retired);
                driver.destroy_swapchain(retired);
            }
        }
    }

    /// Acquire the next image, recreating the swapchain while it is stale.
    ///
    /// Returns `Ok(None)` while the surface has a zero-sized extent.
    pub fn acquire_next_image<D: Driver>(
        &mut self,
        driver: &D,
        callbacks: &mut CallbackRegistry<D>,
        physical_device: vk::PhysicalDevice,
        queues: &QueueSet,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> GraphicsResult<Option<u32>> {
        self.release_retired(driver);

        match self.state {
            SwapchainState::Created => {}
            SwapchainState::Recreating => {
                if self.recreate(driver, callbacks, physical_device, queues)? == RecreateOutcome::Deferred {
                    return Ok(None);
                }
            }
            SwapchainState::Uninitialized | SwapchainState::Destroyed => {
                return Err(GraphicsError::NotInitialized("Swapchain"));
            }
        }

        loop {
            match driver.acquire_next_image(self.handle, u64::MAX, semaphore, fence) {
                Ok((index, false)) => return Ok(Some(index)),
                Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("Swapchain stale on acquire, recreating");
                    if self.recreate(driver, callbacks, physical_device, queues)? == RecreateOutcome::Deferred {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    log::error!("Failed to acquire the next image: {:?}", e);
                    return Err(GraphicsError::vk("vkAcquireNextImageKHR", e));
                }
            }
        }
    }

    /// Present `image_index`; a stale swapchain is recreated afterwards.
    pub fn present<D: Driver>(
        &mut self,
        driver: &D,
        callbacks: &mut CallbackRegistry<D>,
        physical_device: vk::PhysicalDevice,
        queues: &QueueSet,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> GraphicsResult<()> {
        let queue = queues
            .presentation
            .ok_or(GraphicsError::NotInitialized("Presentation queue"))?;

        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match driver.queue_present(queue.handle, &present_info) {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain stale on present, recreating");
                self.recreate(driver, callbacks, physical_device, queues)?;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to present image {}: {:?}", image_index, e);
                Err(GraphicsError::vk("vkQueuePresentKHR", e))
            }
        }
    }

    /// Switch to `surface_format` (format `UNDEFINED` means any format in the
    /// colour space). A live swapchain is recreated with it.
    pub fn set_surface_format<D: Driver>(
        &mut self,
        driver: &D,
        callbacks: &mut CallbackRegistry<D>,
        physical_device: vk::PhysicalDevice,
        queues: &QueueSet,
        surface_format: vk::SurfaceFormatKHR,
    ) -> GraphicsResult<()> {
        let available = self.surface_formats(driver, physical_device)?;
        let chosen = available
            .iter()
            .find(|f| {
                f.color_space == surface_format.color_space
                    && (surface_format.format == vk::Format::UNDEFINED || f.format == surface_format.format)
            })
            .copied()
            .ok_or(GraphicsError::FormatNotSupported {
                format: surface_format.format,
                color_space: surface_format.color_space,
            })?;

        self.preferences.surface_format = Some(chosen);
        if self.state == SwapchainState::Created {
            self.recreate(driver, callbacks, physical_device, queues)?;
        }
        Ok(())
    }

    /// Tear down swapchain, views and any retired handle. Settings and
    /// preferences are kept so the swapchain can be created again.
    pub fn destroy<D: Driver>(&mut self, driver: &D, callbacks: &mut CallbackRegistry<D>) {
        if self.state == SwapchainState::Created {
            callbacks.dispatch(LifecycleEvent::SwapchainDestroying, driver);
        }
        self.destroy_views(driver);
        if self.handle != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
        if let Some(retired) = self.retired.take() {
            driver.destroy_swapchain(retired);
        }
        if self.state != SwapchainState::Uninitialized {
            self.state = SwapchainState::Destroyed;
        }
    }

    /// Allow `create` after `destroy`, e.g. once a new device exists.
    pub fn reset(&mut self) {
        if self.state == SwapchainState::Destroyed {
            self.state = SwapchainState::Uninitialized;
        }
    }
}
