// Physical device selection and queue family resolution
//
// Queue family results are cached per physical device. A slot that was
// searched and not found stays "not found", so asking again for the same
// capability fails without touching the driver.

use ash::vk;
use std::collections::HashMap;
use std::ffi::{CStr, CString};

use super::driver::Driver;
use super::error::{GraphicsError, GraphicsResult, VkResultExt};

/// Which queue capabilities a device must offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub graphics: bool,
    pub compute: bool,
    /// Presentation is required whenever a surface is bound.
    pub surface: Option<vk::SurfaceKHR>,
}

impl QueueRequest {
    pub fn new(graphics: bool, compute: bool, surface: Option<vk::SurfaceKHR>) -> Self {
        Self {
            graphics,
            compute,
            surface,
        }
    }

    fn presentation(&self) -> bool {
        self.surface.is_some()
    }
}

/// Cached state of one capability slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilySlot {
    #[default]
    Unsearched,
    NotFound,
    Found(u32),
}

impl FamilySlot {
    fn index(self) -> Option<u32> {
        match self {
            Self::Found(index) => Some(index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FamilyCombination {
    pub graphics: FamilySlot,
    pub presentation: FamilySlot,
    pub compute: FamilySlot,
}

/// Resolved family indices; `None` for capabilities that were not requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub presentation: Option<u32>,
    pub compute: Option<u32>,
}

impl QueueFamilyIndices {
    /// Distinct families, in graphics, presentation, compute order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for family in [self.graphics, self.presentation, self.compute].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Scan the queue families of one device.
///
/// Per family, in enumeration order: a family with graphics, compute and
/// presentation wins outright. A graphics+compute family claims both slots
/// unless they already share one. Otherwise the first family offering a
/// capability fills that capability's empty slot.
pub fn scan_queue_families<D: Driver>(
    driver: &D,
    physical_device: vk::PhysicalDevice,
    request: &QueueRequest,
) -> GraphicsResult<[Option<u32>; 3]> {
    let families = driver.queue_family_properties(physical_device);

    let mut graphics: Option<u32> = None;
    let mut presentation: Option<u32> = None;
    let mut compute: Option<u32> = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let supports_graphics = request.graphics && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_compute = request.compute && family.queue_flags.contains(vk::QueueFlags::COMPUTE);
        let supports_presentation = match request.surface {
            Some(surface) => driver
                .surface_support(physical_device, index, surface)
                .during("vkGetPhysicalDeviceSurfaceSupportKHR")?,
            None => false,
        };

        if supports_graphics && supports_compute {
            if supports_presentation {
                graphics = Some(index);
                presentation = Some(index);
                compute = Some(index);
                break;
            }
            if graphics != compute || graphics.is_none() {
                graphics = Some(index);
                compute = Some(index);
            }
            if request.surface.is_none() {
                break;
            }
        }
        if supports_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if supports_presentation && presentation.is_none() {
            presentation = Some(index);
        }
        if supports_compute && compute.is_none() {
            compute = Some(index);
        }
    }

    Ok([graphics, presentation, compute])
}

/// Properties captured when a device is selected.
#[derive(Debug, Clone, Copy)]
pub struct SelectedPhysicalDevice {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
}

impl SelectedPhysicalDevice {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Debug, Default)]
pub struct PhysicalDeviceSelector {
    available: Vec<vk::PhysicalDevice>,
    cache: HashMap<vk::PhysicalDevice, FamilyCombination>,
    selected: Option<SelectedPhysicalDevice>,
}

impl PhysicalDeviceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate the devices the driver exposes.
    pub fn enumerate<D: Driver>(&mut self, driver: &D) -> GraphicsResult<&[vk::PhysicalDevice]> {
        let devices = driver
            .enumerate_physical_devices()
            .during("vkEnumeratePhysicalDevices")?;
        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(GraphicsError::NoPhysicalDevice);
        }
        log::info!("Found {} physical device(s)", devices.len());
        self.available = devices;
        Ok(&self.available)
    }

    pub fn available(&self) -> &[vk::PhysicalDevice] {
        &self.available
    }

    pub fn selected(&self) -> Option<&SelectedPhysicalDevice> {
        self.selected.as_ref()
    }

    pub fn cached(&self, physical_device: vk::PhysicalDevice) -> Option<&FamilyCombination> {
        self.cache.get(&physical_device)
    }

    /// Resolve queue families for `physical_device`, scanning at most once per
    /// capability.
    pub fn resolve<D: Driver>(
        &mut self,
        driver: &D,
        physical_device: vk::PhysicalDevice,
        request: &QueueRequest,
    ) -> GraphicsResult<QueueFamilyIndices> {
        let cached = self.cache.entry(physical_device).or_default();

        let wants = [request.graphics, request.presentation(), request.compute];
        let slots = [cached.graphics, cached.presentation, cached.compute];
        const NAMES: [&str; 3] = ["graphics", "presentation", "compute"];

        if let Some(i) = (0..3).find(|&i| wants[i] && slots[i] == FamilySlot::NotFound) {
            log::debug!("Queue family cache: {} known missing on {:?}", NAMES[i], physical_device);
            return Err(GraphicsError::QueueFamilyNotFound {
                device: physical_device,
                missing: NAMES[i],
            });
        }

        if (0..3).any(|i| wants[i] && slots[i] == FamilySlot::Unsearched) {
            let found = scan_queue_families(driver, physical_device, request)?;
            let to_slot = |index: Option<u32>| index.map_or(FamilySlot::NotFound, FamilySlot::Found);
            if request.graphics {
                cached.graphics = to_slot(found[0]);
            }
            if request.presentation() {
                cached.presentation = to_slot(found[1]);
            }
            if request.compute {
                cached.compute = to_slot(found[2]);
            }

            let slots = [cached.graphics, cached.presentation, cached.compute];
            if let Some(i) = (0..3).find(|&i| wants[i] && slots[i] == FamilySlot::NotFound) {
                log::warn!("No {} queue family on {:?}", NAMES[i], physical_device);
                return Err(GraphicsError::QueueFamilyNotFound {
                    device: physical_device,
                    missing: NAMES[i],
                });
            }
        } else {
            log::debug!("Queue family cache hit for {:?}", physical_device);
        }

        Ok(QueueFamilyIndices {
            graphics: request.graphics.then(|| cached.graphics.index()).flatten(),
            presentation: request.presentation().then(|| cached.presentation.index()).flatten(),
            compute: request.compute.then(|| cached.compute.index()).flatten(),
        })
    }

    /// Select the device at `index` in enumeration order.
    pub fn determine<D: Driver>(
        &mut self,
        driver: &D,
        index: usize,
        request: &QueueRequest,
    ) -> GraphicsResult<&SelectedPhysicalDevice> {
        if self.available.is_empty() {
            self.enumerate(driver)?;
        }
        let handle = *self.available.get(index).ok_or(GraphicsError::PhysicalDeviceIndex {
            index,
            count: self.available.len(),
        })?;
        let queue_families = self.resolve(driver, handle, request)?;
        Ok(self.select(driver, handle, queue_families))
    }

    /// Pick the best device whose queue families resolve: discrete GPUs first,
    /// then integrated, then anything else.
    pub fn pick_best<D: Driver>(
        &mut self,
        driver: &D,
        request: &QueueRequest,
    ) -> GraphicsResult<&SelectedPhysicalDevice> {
        if self.available.is_empty() {
            self.enumerate(driver)?;
        }

        let mut best: Option<(vk::PhysicalDevice, QueueFamilyIndices)> = None;
        let mut best_score = 0;

        for handle in self.available.clone() {
            let queue_families = match self.resolve(driver, handle, request) {
                Ok(families) => families,
                Err(GraphicsError::QueueFamilyNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            let props = driver.physical_device_properties(handle);
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((handle, queue_families));
            }
        }

        let (handle, queue_families) = best.ok_or(GraphicsError::NoSuitablePhysicalDevice)?;
        Ok(self.select(driver, handle, queue_families))
    }

    fn select<D: Driver>(
        &mut self,
        driver: &D,
        handle: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
    ) -> &SelectedPhysicalDevice {
        let selected = SelectedPhysicalDevice {
            handle,
            properties: driver.physical_device_properties(handle),
            memory_properties: driver.physical_device_memory_properties(handle),
            queue_families,
        };
        log::info!("Selected GPU: {}", selected.name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(selected.properties.api_version),
            vk::api_version_minor(selected.properties.api_version),
            vk::api_version_patch(selected.properties.api_version)
        );
        log::info!("Queue families: {:?}", queue_families);
        self.selected.insert(selected)
    }
}

/// Requested device extensions the physical device does not offer.
pub fn check_device_extensions<D: Driver>(
    driver: &D,
    physical_device: vk::PhysicalDevice,
    requested: &super::instance::NameList,
) -> GraphicsResult<Vec<CString>> {
    let available = driver
        .device_extension_names(physical_device)
        .during("vkEnumerateDeviceExtensionProperties")?;
    Ok(requested.missing_from(&available))
}
