// Synchronization primitives
//
// Per-frame semaphores and fence for acquire -> submit -> present.
// They belong to the logical device: destroy them from a device-destroy
// callback or before the context goes away.

use ash::vk;

use super::driver::Driver;
use super::error::{GraphicsResult, VkResultExt};

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<D: Driver>(driver: &D) -> GraphicsResult<Self> {
        let image_available = driver.create_semaphore().during("vkCreateSemaphore")?;
        let render_finished = match driver.create_semaphore().during("vkCreateSemaphore") {
            Ok(semaphore) => semaphore,
            Err(e) => {
                driver.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the first frame does not wait forever.
        let in_flight_fence = match driver.create_fence(true).during("vkCreateFence") {
            Ok(fence) => fence,
            Err(e) => {
                driver.destroy_semaphore(image_available);
                driver.destroy_semaphore(render_finished);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy<D: Driver>(&self, driver: &D) {
        driver.destroy_semaphore(self.image_available);
        driver.destroy_semaphore(self.render_finished);
        driver.destroy_fence(self.in_flight_fence);
    }
}

/// A ring of `FrameSync`s, advanced once per rendered frame.
#[derive(Debug, Default)]
pub struct FramesInFlight {
    frames: Vec<FrameSync>,
    current: usize,
}

impl FramesInFlight {
    pub fn new<D: Driver>(driver: &D, count: usize) -> GraphicsResult<Self> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count.max(1) {
            match FrameSync::new(driver) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    frames.iter().for_each(|f| f.destroy(driver));
                    return Err(e);
                }
            }
        }
        Ok(Self { frames, current: 0 })
    }

    pub fn current(&self) -> Option<&FrameSync> {
        self.frames.get(self.current)
    }

    pub fn advance(&mut self) {
        if !self.frames.is_empty() {
            self.current = (self.current + 1) % self.frames.len();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn destroy<D: Driver>(&mut self, driver: &D) {
        for frame in self.frames.drain(..) {
            frame.destroy(driver);
        }
        self.current = 0;
    }
}

/// The frame fence that last submitted work for each swapchain image.
///
/// With more images than frames in flight, an image can come back while the
/// frame that used it is still running on another sync slot.
#[derive(Debug, Default)]
pub struct ImagesInFlight {
    fences: Vec<vk::Fence>,
}

impl ImagesInFlight {
    /// Forget every fence and track `image_count` images.
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, vk::Fence::null());
    }

    pub fn clear(&mut self) {
        self.fences.clear();
    }

    /// Mark `image_index` as owned by `fence`. Returns the fence to wait on
    /// first when another frame still holds the image.
    pub fn claim(&mut self, image_index: usize, fence: vk::Fence) -> Option<vk::Fence> {
        let slot = self.fences.get_mut(image_index)?;
        let previous = std::mem::replace(slot, fence);
        (previous != vk::Fence::null() && previous != fence).then_some(previous)
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use ash::vk::Handle;

    #[test]
    fn frames_cycle_and_release() {
        let driver = MockDriver::standard();
        let mut frames = FramesInFlight::new(&driver, 2).unwrap();
        assert_eq!(frames.len(), 2);

        let first = frames.current().unwrap().in_flight_fence;
        frames.advance();
        assert_ne!(frames.current().unwrap().in_flight_fence, first);
        frames.advance();
        assert_eq!(frames.current().unwrap().in_flight_fence, first);

        frames.destroy(&driver);
        assert!(frames.is_empty());
        assert!(frames.current().is_none());
    }

    #[test]
    fn frame_handles_are_distinct() {
        let driver = MockDriver::standard();
        let frame = FrameSync::new(&driver).unwrap();
        assert_ne!(frame.image_available, frame.render_finished);
    }

    #[test]
    fn images_report_the_frame_still_using_them() {
        let first = vk::Fence::from_raw(0x10);
        let second = vk::Fence::from_raw(0x20);
        let mut images = ImagesInFlight::default();
        images.reset(3);
        assert_eq!(images.len(), 3);

        assert_eq!(images.claim(0, first), None);
        assert_eq!(images.claim(1, second), None);
        // Image 0 comes back while the other frame slot is current.
        assert_eq!(images.claim(0, second), Some(first));
        // Same slot again: the caller already waited on its own fence.
        assert_eq!(images.claim(0, second), None);
        assert_eq!(images.claim(7, first), None);

        images.reset(2);
        assert_eq!(images.claim(1, first), None);
        images.clear();
        assert!(images.is_empty());
    }
}
