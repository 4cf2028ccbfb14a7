//! Vulkan device and presentation lifecycle.
//!
//! `backend::GraphicsContext` selects a GPU and its queue families, owns the
//! logical device and swapchain, and rebuilds both on demand. Renderer code
//! hooks the rebuilds through `backend::CallbackRegistry`.

pub mod backend;
pub mod config;
pub mod window;
