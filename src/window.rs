// Window glue - winit window attributes and surface handoff
//
// The core never creates windows. This module turns the window settings into
// winit attributes and lends the window's raw handles to ash-window so the
// context can create its surface.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::monitor::{MonitorHandle, VideoModeHandle};
use winit::window::{Fullscreen, Window, WindowAttributes};

use crate::backend::context::{ContextSettings, SurfaceProvider};
use crate::backend::error::{GraphicsError, GraphicsResult};
use crate::backend::instance::InstanceContext;

/// Exclusive fullscreen at the monitor's native resolution, or borderless
/// when the monitor does not report a matching video mode.
pub fn native_fullscreen(monitor: Option<MonitorHandle>) -> Fullscreen {
    match monitor.as_ref().and_then(native_video_mode) {
        Some(mode) => {
            log::info!(
                "Fullscreen video mode {}x{} @ {} mHz",
                mode.size().width,
                mode.size().height,
                mode.refresh_rate_millihertz()
            );
            Fullscreen::Exclusive(mode)
        }
        None => Fullscreen::Borderless(monitor),
    }
}

fn native_video_mode(monitor: &MonitorHandle) -> Option<VideoModeHandle> {
    let native = monitor.size();
    monitor
        .video_modes()
        .filter(|mode| mode.size() == native)
        .max_by_key(|mode| (mode.bit_depth(), mode.refresh_rate_millihertz()))
}

pub fn window_attributes(
    event_loop: &ActiveEventLoop,
    title: &str,
    settings: &ContextSettings,
) -> WindowAttributes {
    let extent = settings.presentation.window_extent;
    let mut attributes = WindowAttributes::default()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(extent.width, extent.height))
        .with_resizable(settings.resizable);

    if settings.fullscreen {
        attributes = attributes.with_fullscreen(Some(native_fullscreen(event_loop.primary_monitor())));
    }
    attributes
}

/// Surface handoff for a winit window.
pub struct WindowSurface<'a> {
    window: &'a Window,
}

impl<'a> WindowSurface<'a> {
    pub fn new(window: &'a Window) -> Self {
        Self { window }
    }
}

impl SurfaceProvider for WindowSurface<'_> {
    fn required_extensions(&self) -> GraphicsResult<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.window.raw_display_handle())
            .map_err(|e| GraphicsError::vk("ash_window::enumerate_required_extensions", e))?;
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect())
    }

    fn create_surface(&self, instance: &InstanceContext) -> GraphicsResult<vk::SurfaceKHR> {
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.instance(),
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .map_err(|e| GraphicsError::vk("ash_window::create_surface", e))?;
        log::info!("Created window surface");
        Ok(surface)
    }
}
