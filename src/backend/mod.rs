// Backend module - Vulkan device and presentation lifecycle
//
// Design: managers hold state only; the driver and the callback registry are
// passed in explicitly, and `GraphicsContext` owns all of them.

pub mod callbacks;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod instance;
pub mod physical;
pub mod result;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use callbacks::{CallbackRegistry, LifecycleEvent};
pub use context::{ContextSettings, GraphicsContext, SurfaceProvider};
pub use device::{LogicalDeviceManager, Queue, QueueSet};
pub use driver::{AshDriver, Driver};
pub use error::{GraphicsError, GraphicsResult};
pub use instance::{InstanceBuilder, InstanceContext, NameList};
pub use physical::{PhysicalDeviceSelector, QueueFamilyIndices, QueueRequest, SelectedPhysicalDevice};
pub use result::{clear_escalation_handler, set_escalation_handler, CheckedResult};
pub use swapchain::{PresentationPreferences, RecreateOutcome, SwapchainManager, SwapchainSettings, SwapchainState};
pub use sync::{FrameSync, FramesInFlight, ImagesInFlight};
