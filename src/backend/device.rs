// Logical device - creation, queues, teardown
//
// Responsibilities:
// - Logical device creation from resolved queue families
// - Queue handle retrieval
// - Device-destroy callbacks before teardown, device-create callbacks after creation

use ash::vk;
use std::ffi::CStr;

use super::callbacks::{CallbackRegistry, LifecycleEvent};
use super::driver::{DeviceDesc, Driver};
use super::error::{GraphicsError, GraphicsResult, VkResultExt};
use super::instance::NameList;
use super::physical::SelectedPhysicalDevice;
use super::result::CheckedResult;

/// A queue handle together with the family it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSet {
    pub graphics: Option<Queue>,
    pub presentation: Option<Queue>,
    pub compute: Option<Queue>,
}

impl QueueSet {
    /// Graphics and presentation queues, without duplicates.
    pub fn presentation_related(&self) -> Vec<vk::Queue> {
        let mut queues = Vec::with_capacity(2);
        for queue in [self.graphics, self.presentation].into_iter().flatten() {
            if !queues.contains(&queue.handle) {
                queues.push(queue.handle);
            }
        }
        queues
    }
}

#[derive(Debug)]
pub struct LogicalDeviceManager {
    handle: Option<vk::Device>,
    extensions: NameList,
    flags: vk::DeviceCreateFlags,
    queues: QueueSet,
}

impl Default for LogicalDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalDeviceManager {
    pub fn new() -> Self {
        Self {
            handle: None,
            extensions: NameList::new(),
            flags: vk::DeviceCreateFlags::empty(),
            queues: QueueSet::default(),
        }
    }

    /// Add a device extension; takes effect on the next creation.
    pub fn add_extension(&mut self, name: &CStr) -> bool {
        self.extensions.push(name)
    }

    pub fn set_extensions(&mut self, names: NameList) {
        self.extensions = names;
    }

    pub fn extensions(&self) -> &NameList {
        &self.extensions
    }

    pub fn set_flags(&mut self, flags: vk::DeviceCreateFlags) {
        self.flags = flags;
    }

    pub fn handle(&self) -> Option<vk::Device> {
        self.handle
    }

    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn create<D: Driver>(
        &mut self,
        driver: &mut D,
        callbacks: &mut CallbackRegistry<D>,
        physical: &SelectedPhysicalDevice,
    ) -> GraphicsResult<()> {
        if self.handle.is_some() {
            log::warn!("Logical device already exists, skipping creation");
            return Ok(());
        }

        let families = physical.queue_families;
        if families.presentation.is_some() {
            self.extensions.push(ash::extensions::khr::Swapchain::name());
        }

        let desc = DeviceDesc {
            queue_families: families.unique(),
            extensions: self.extensions.to_vec(),
            flags: self.flags,
        };
        log::info!(
            "Creating logical device on {} (families {:?}, {} extension(s))",
            physical.name(),
            desc.queue_families,
            desc.extensions.len()
        );

        let handle = driver
            .create_device(physical.handle, &desc)
            .during("vkCreateDevice")?;

        let fetch = |family: Option<u32>| {
            family.map(|family| Queue {
                family,
                handle: driver.device_queue(family, 0),
            })
        };
        self.queues = QueueSet {
            graphics: fetch(families.graphics),
            presentation: fetch(families.presentation),
            compute: fetch(families.compute),
        };
        self.handle = Some(handle);

        callbacks.dispatch(LifecycleEvent::DeviceCreated, driver);
        Ok(())
    }

    /// Wait for the device to go idle, notify owners, then destroy it.
    pub fn destroy<D: Driver>(&mut self, driver: &mut D, callbacks: &mut CallbackRegistry<D>) -> GraphicsResult<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        log::info!("Destroying logical device...");

        match driver.device_wait_idle() {
            Ok(()) | Err(vk::Result::ERROR_DEVICE_LOST) => {}
            Err(e) => return Err(GraphicsError::vk("vkDeviceWaitIdle", e)),
        }

        callbacks.dispatch(LifecycleEvent::DeviceDestroying, driver);
        driver.destroy_device();
        self.handle = None;
        self.queues = QueueSet::default();
        Ok(())
    }

    /// Destroy the device and create a fresh one on the same physical device.
    pub fn recreate<D: Driver>(
        &mut self,
        driver: &mut D,
        callbacks: &mut CallbackRegistry<D>,
        physical: &SelectedPhysicalDevice,
    ) -> GraphicsResult<()> {
        self.destroy(driver, callbacks)?;
        self.create(driver, callbacks, physical)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle<D: Driver>(&self, driver: &D) -> CheckedResult {
        if self.handle.is_none() {
            return CheckedResult::success();
        }
        CheckedResult::from_vk("vkDeviceWaitIdle", driver.device_wait_idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDriver, MockFamily};
    use crate::backend::physical::{PhysicalDeviceSelector, QueueRequest};

    fn selected(driver: &MockDriver) -> SelectedPhysicalDevice {
        let mut selector = PhysicalDeviceSelector::new();
        *selector
            .determine(driver, 0, &QueueRequest::new(true, true, Some(MockDriver::surface())))
            .unwrap()
    }

    fn record_validity(registry: &mut CallbackRegistry<MockDriver>) {
        registry.on_device_created(|d: &MockDriver| {
            let valid = d.device_handle().is_some();
            d.record(format!("cb:device_created valid={}", valid));
        });
        registry.on_device_destroying(|d: &MockDriver| {
            let valid = d.device_handle().is_some();
            d.record(format!("cb:device_destroying valid={}", valid));
        });
    }

    #[test]
    fn create_fetches_one_queue_per_family() {
        let mut driver = MockDriver::with_families(vec![
            MockFamily::new(vk::QueueFlags::GRAPHICS, true),
            MockFamily::new(vk::QueueFlags::COMPUTE, false),
        ]);
        let physical = selected(&driver);
        let mut callbacks = CallbackRegistry::new();
        let mut manager = LogicalDeviceManager::new();

        manager.create(&mut driver, &mut callbacks, &physical).unwrap();

        let queues = manager.queues();
        assert_eq!(queues.graphics.unwrap().family, 0);
        assert_eq!(queues.presentation, queues.graphics);
        assert_eq!(queues.compute.unwrap().family, 1);
        assert_eq!(queues.presentation_related().len(), 1);
        assert!(manager.extensions().contains(ash::extensions::khr::Swapchain::name()));
        assert_eq!(driver.events(), vec!["create_device families=[0, 1]"]);
    }

    #[test]
    fn rebuild_notifies_around_handle_validity() {
        let mut driver = MockDriver::standard();
        let physical = selected(&driver);
        let mut callbacks = CallbackRegistry::new();
        record_validity(&mut callbacks);
        let mut manager = LogicalDeviceManager::new();

        manager.create(&mut driver, &mut callbacks, &physical).unwrap();
        let first = manager.handle().unwrap();
        driver.clear_events();

        manager.recreate(&mut driver, &mut callbacks, &physical).unwrap();

        assert_ne!(manager.handle().unwrap(), first);
        assert_eq!(
            driver.events(),
            vec![
                "device_wait_idle",
                "cb:device_destroying valid=true",
                "destroy_device",
                "create_device families=[0]",
                "cb:device_created valid=true",
            ]
        );
    }

    #[test]
    fn destroy_without_device_is_noop() {
        let mut driver = MockDriver::standard();
        let mut callbacks = CallbackRegistry::new();
        record_validity(&mut callbacks);
        let mut manager = LogicalDeviceManager::new();

        manager.destroy(&mut driver, &mut callbacks).unwrap();
        assert!(driver.events().is_empty());
        manager.wait_idle(&driver).into_result().unwrap();
    }

    #[test]
    fn second_create_is_ignored() {
        let mut driver = MockDriver::standard();
        let physical = selected(&driver);
        let mut callbacks = CallbackRegistry::new();
        let mut manager = LogicalDeviceManager::new();

        manager.create(&mut driver, &mut callbacks, &physical).unwrap();
        let handle = manager.handle();
        manager.create(&mut driver, &mut callbacks, &physical).unwrap();
        assert_eq!(manager.handle(), handle);
    }
}
