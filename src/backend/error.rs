// Error taxonomy for the device/presentation core
//
// Native failures carry the name of the call that produced them so a log line
// is enough to locate the problem.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{operation} failed: {result}")]
    Vk {
        operation: &'static str,
        result: vk::Result,
    },

    #[error("Queue family not found on {device:?} (missing: {missing})")]
    QueueFamilyNotFound {
        device: vk::PhysicalDevice,
        missing: &'static str,
    },

    #[error("No Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("Physical device index {index} out of range ({count} available)")]
    PhysicalDeviceIndex { index: usize, count: usize },

    #[error("No suitable GPU found")]
    NoSuitablePhysicalDevice,

    #[error("Surface reports no supported formats")]
    NoSurfaceFormats,

    #[error("Surface reports no present modes")]
    NoPresentModes,

    #[error("Surface format {format:?} / {color_space:?} is not supported")]
    FormatNotSupported {
        format: vk::Format,
        color_space: vk::ColorSpaceKHR,
    },

    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    #[error("No presentation surface was supplied")]
    NoSurface,

    #[error("Invalid layer or extension name {0:?}")]
    InvalidName(String),

    #[error("Unobserved Vulkan result: {0}")]
    Unobserved(vk::Result),
}

impl GraphicsError {
    pub fn vk(operation: &'static str, result: vk::Result) -> Self {
        Self::Vk { operation, result }
    }

    /// Failures that leave no usable device or surface behind.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Loading(_)
                | Self::NoPhysicalDevice
                | Self::NoSuitablePhysicalDevice
                | Self::NoSurfaceFormats
                | Self::NoPresentModes
        )
    }

    /// The native result code, when the error came from the driver.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vk { result, .. } | Self::Unobserved(result) => Some(*result),
            _ => None,
        }
    }
}

pub type GraphicsResult<T> = std::result::Result<T, GraphicsError>;

/// Attach the failing call's name to a native result.
pub(crate) trait VkResultExt<T> {
    fn during(self, operation: &'static str) -> GraphicsResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn during(self, operation: &'static str) -> GraphicsResult<T> {
        self.map_err(|result| {
            log::error!("{} failed: {:?}", operation, result);
            GraphicsError::vk(operation, result)
        })
    }
}
