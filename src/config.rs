// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys take their defaults and a broken
// file falls back to defaults with a warning.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::context::ContextSettings;
use crate::backend::swapchain::PresentationPreferences;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Uses the monitor's native resolution.
    pub fullscreen: bool,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkbase".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// `false` allows MAILBOX presentation when the driver offers it.
    pub limit_frame_rate: bool,
    pub surface_format: Option<SurfaceFormatConfig>,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            limit_frame_rate: true,
            surface_format: None,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Requested surface format, e.g. `{ format = "B8G8R8A8_SRGB", color_space = "SRGB_NONLINEAR" }`.
/// Leaving out `format` accepts any format in the colour space.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SurfaceFormatConfig {
    pub format: Option<String>,
    pub color_space: String,
}

impl Default for SurfaceFormatConfig {
    fn default() -> Self {
        Self {
            format: None,
            color_space: "SRGB_NONLINEAR".to_string(),
        }
    }
}

/// Device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enable_compute: bool,
    /// Enumeration index; picks the best GPU when unset.
    pub preferred_device_index: Option<usize>,
    pub extensions: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enable_compute: true,
            preferred_device_index: None,
            extensions: Vec::new(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds.
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

fn parse_format(name: &str) -> Option<vk::Format> {
    let format = match name.to_uppercase().as_str() {
        "UNDEFINED" | "ANY" => vk::Format::UNDEFINED,
        "R8G8B8A8_UNORM" => vk::Format::R8G8B8A8_UNORM,
        "R8G8B8A8_SRGB" => vk::Format::R8G8B8A8_SRGB,
        "B8G8R8A8_UNORM" => vk::Format::B8G8R8A8_UNORM,
        "B8G8R8A8_SRGB" => vk::Format::B8G8R8A8_SRGB,
        "A2B10G10R10_UNORM_PACK32" => vk::Format::A2B10G10R10_UNORM_PACK32,
        "A2R10G10B10_UNORM_PACK32" => vk::Format::A2R10G10B10_UNORM_PACK32,
        "R16G16B16A16_SFLOAT" => vk::Format::R16G16B16A16_SFLOAT,
        _ => return None,
    };
    Some(format)
}

fn parse_color_space(name: &str) -> Option<vk::ColorSpaceKHR> {
    let color_space = match name.to_uppercase().as_str() {
        "SRGB_NONLINEAR" => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        "EXTENDED_SRGB_LINEAR" => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        "DISPLAY_P3_NONLINEAR" => vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        "HDR10_ST2084" => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        "BT2020_LINEAR" => vk::ColorSpaceKHR::BT2020_LINEAR_EXT,
        _ => return None,
    };
    Some(color_space)
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// The configured surface format hint, if it names a known format.
    pub fn requested_surface_format(&self) -> Option<vk::SurfaceFormatKHR> {
        let requested = self.graphics.surface_format.as_ref()?;

        let Some(color_space) = parse_color_space(&requested.color_space) else {
            log::warn!(
                "Unknown color space '{}', ignoring surface format hint",
                requested.color_space
            );
            return None;
        };
        let format = match requested.format.as_deref() {
            None => vk::Format::UNDEFINED,
            Some(name) => match parse_format(name) {
                Some(format) => format,
                None => {
                    log::warn!("Unknown surface format '{}', ignoring surface format hint", name);
                    return None;
                }
            },
        };

        Some(vk::SurfaceFormatKHR { format, color_space })
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }

    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            app_name: self.window.title.clone(),
            validation: self.debug.validation_layers,
            fullscreen: self.window.fullscreen,
            resizable: self.window.resizable,
            enable_compute: self.device.enable_compute,
            device_index: self.device.preferred_device_index,
            device_extensions: self.device.extensions.clone(),
            presentation: PresentationPreferences {
                limit_frame_rate: self.graphics.limit_frame_rate,
                surface_format: self.requested_surface_format(),
                window_extent: vk::Extent2D {
                    width: self.window.width,
                    height: self.window.height,
                },
                flags: vk::SwapchainCreateFlagsKHR::empty(),
            },
        }
    }
}
