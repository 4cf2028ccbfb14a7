// Lifecycle callbacks
//
// Subsystems that own GPU resources (pipelines, command pools, framebuffers)
// hook device and swapchain events here. The core only ever holds the
// closures, never the resources behind them.
//
// Ordering: create callbacks run in registration order, destroy callbacks run
// in reverse registration order, so the last subsystem set up is the first one
// torn down.

use std::fmt;

/// Which lifecycle event a callback is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    DeviceCreated,
    DeviceDestroying,
    SwapchainCreated,
    SwapchainDestroying,
}

type Callback<D> = Box<dyn FnMut(&D)>;

/// Four independent append-only callback lists.
///
/// Callbacks receive the driver so they can reach the live device.
pub struct CallbackRegistry<D> {
    device_create: Vec<Callback<D>>,
    device_destroy: Vec<Callback<D>>,
    swapchain_create: Vec<Callback<D>>,
    swapchain_destroy: Vec<Callback<D>>,
}

impl<D> Default for CallbackRegistry<D> {
    fn default() -> Self {
        Self {
            device_create: Vec::new(),
            device_destroy: Vec::new(),
            swapchain_create: Vec::new(),
            swapchain_destroy: Vec::new(),
        }
    }
}

impl<D> CallbackRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_device_created<F: FnMut(&D) + 'static>(&mut self, callback: F) {
        self.device_create.push(Box::new(callback));
    }

    pub fn on_device_destroying<F: FnMut(&D) + 'static>(&mut self, callback: F) {
        self.device_destroy.push(Box::new(callback));
    }

    pub fn on_swapchain_created<F: FnMut(&D) + 'static>(&mut self, callback: F) {
        self.swapchain_create.push(Box::new(callback));
    }

    pub fn on_swapchain_destroying<F: FnMut(&D) + 'static>(&mut self, callback: F) {
        self.swapchain_destroy.push(Box::new(callback));
    }

    pub fn count(&self, event: LifecycleEvent) -> usize {
        match event {
            LifecycleEvent::DeviceCreated => self.device_create.len(),
            LifecycleEvent::DeviceDestroying => self.device_destroy.len(),
            LifecycleEvent::SwapchainCreated => self.swapchain_create.len(),
            LifecycleEvent::SwapchainDestroying => self.swapchain_destroy.len(),
        }
    }

    pub fn dispatch(&mut self, event: LifecycleEvent, driver: &D) {
        log::debug!("Dispatching {:?} to {} callback(s)", event, self.count(event));
        match event {
            LifecycleEvent::DeviceCreated => self.device_create.iter_mut().for_each(|cb| cb(driver)),
            LifecycleEvent::DeviceDestroying => self.device_destroy.iter_mut().rev().for_each(|cb| cb(driver)),
            LifecycleEvent::SwapchainCreated => self.swapchain_create.iter_mut().for_each(|cb| cb(driver)),
            LifecycleEvent::SwapchainDestroying => {
                self.swapchain_destroy.iter_mut().rev().for_each(|cb| cb(driver))
            }
        }
    }
}

impl<D> fmt::Debug for CallbackRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("device_create", &self.device_create.len())
            .field("device_destroy", &self.device_destroy.len())
            .field("swapchain_create", &self.swapchain_create.len())
            .field("swapchain_destroy", &self.swapchain_destroy.len())
            .finish()
    }
}
