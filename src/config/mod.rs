//! Configuration management for carafe
//!
//! Settings come from three layers applied in order: an optional TOML file,
//! the `SOMMELIER_*` environment understood by existing launchers, and the
//! command line. `finalize` clamps numeric ranges and checks everything
//! that can be rejected before the relay touches a device.

use crate::error::RelayError;
use crate::geometry::{MAX_SCALE, MIN_SCALE};
use crate::output::DEFAULT_DPI_BUCKETS;
use crate::seat::{parse_accelerators, Accelerator};
use crate::transport::{DataDriver, ShmDriver};
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub mod cli;

pub use cli::Cli;

pub const MIN_DPI: i32 = 72;
pub const MAX_DPI: i32 = 9600;

/// Main configuration struct containing all relay settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    /// Guest socket and host connection
    #[serde(default)]
    pub display: DisplayConfig,

    /// Buffer and data transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// Scale factor and DPI buckets
    #[serde(default)]
    pub scale: ScaleConfig,

    /// Xwayland launch and window manager
    #[serde(default)]
    pub xwayland: XwaylandConfig,

    /// Host window appearance and input
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Socket name under `$XDG_RUNTIME_DIR` in master mode
    pub socket: String,

    /// Host display to connect to; `WAYLAND_DISPLAY` when unset
    pub host_display: Option<String>,

    /// Command prefix for peers forked in master mode
    pub peer_cmd_prefix: Option<String>,

    /// Socket path notified when the relay is ready
    pub sd_notify: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Shared-memory driver; derived from the devices when unset
    pub shm_driver: Option<ShmDriver>,

    /// Data transfer driver; derived from the devices when unset
    pub data_driver: Option<DataDriver>,

    pub virtwl_device: Option<PathBuf>,

    pub drm_device: Option<PathBuf>,

    /// Let Xwayland accelerate X11 clients with glamor
    pub glamor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScaleConfig {
    pub scale: f64,

    /// DPI buckets output metrics snap to; empty means the defaults under Xwayland
    pub dpi: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XwaylandConfig {
    pub enabled: bool,

    /// Xwayland executable
    pub path: String,

    /// X display number; Xwayland picks one when unset
    pub display: Option<u32>,

    pub cmd_prefix: Option<String>,

    /// Terminate Xwayland when the program exits
    pub exit_with_child: bool,

    /// Own CLIPBOARD_MANAGER and bridge the X clipboard
    pub clipboard_manager: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WindowConfig {
    pub application_id: Option<String>,

    /// `#rrggbb`
    pub frame_color: Option<String>,

    /// Comma separated, e.g. `<Control><Alt>Delete,<Alt>Tab`
    pub accelerators: Option<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            socket: "wayland-0".to_string(),
            host_display: None,
            peer_cmd_prefix: None,
            sd_notify: None,
        }
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            dpi: Vec::new(),
        }
    }
}

impl Default for XwaylandConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "Xwayland".to_string(),
            display: None,
            cmd_prefix: None,
            exit_with_child: true,
            clipboard_manager: true,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let expanded_path = if let Ok(rest) = path.strip_prefix("~") {
            let home = std::env::var("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(rest)
        } else {
            path.to_path_buf()
        };

        let content = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/carafe/carafe.toml`, falling back to `~/.config`
    pub fn default_path() -> Option<PathBuf> {
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
        };
        Some(base.join("carafe").join("carafe.toml"))
    }

    /// Loads the default file when it exists, otherwise the defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks values that cannot be repaired by clamping
    pub fn validate(&self) -> Result<()> {
        if !self.scale.scale.is_finite() || self.scale.scale <= 0.0 {
            anyhow::bail!("Invalid scale: {}", self.scale.scale);
        }

        if let Some(color) = &self.window.frame_color {
            parse_frame_color(color)?;
        }

        if let Some(list) = &self.window.accelerators {
            parse_accelerators(list)?;
        }

        if self.display.socket.is_empty() || self.display.socket.contains('/') {
            anyhow::bail!("Invalid socket name: {:?}", self.display.socket);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Overrides settings from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overrides settings from `SOMMELIER_*` variables found by `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("SOMMELIER_{}", name));

        if let Some(display) = var("DISPLAY") {
            self.display.host_display = Some(display);
        }
        if let Some(scale) = var("SCALE") {
            self.scale.scale = scale
                .trim()
                .parse()
                .map_err(|_| RelayError::Config(format!("SOMMELIER_SCALE={:?} is not a number", scale)))?;
        }
        if let Some(dpi) = var("DPI") {
            self.scale.dpi = parse_dpi(&dpi)?;
        }
        if let Some(manager) = var("CLIPBOARD_MANAGER") {
            self.xwayland.clipboard_manager = manager != "0";
        }
        if let Some(color) = var("FRAME_COLOR") {
            self.window.frame_color = Some(color);
        }
        if let Some(device) = var("VIRTWL_DEVICE") {
            self.transport.virtwl_device = Some(PathBuf::from(device));
        }
        if let Some(device) = var("DRM_DEVICE") {
            self.transport.drm_device = Some(PathBuf::from(device));
        }
        if let Some(glamor) = var("GLAMOR") {
            self.transport.glamor = glamor != "0";
        }
        if let Some(driver) = var("SHM_DRIVER") {
            self.transport.shm_driver = Some(driver.parse()?);
        }
        if let Some(driver) = var("DATA_DRIVER") {
            self.transport.data_driver = Some(driver.parse()?);
        }
        if let Some(prefix) = var("PEER_CMD_PREFIX") {
            self.display.peer_cmd_prefix = Some(prefix);
        }
        if let Some(prefix) = var("XWAYLAND_CMD_PREFIX") {
            self.xwayland.cmd_prefix = Some(prefix);
        }
        if let Some(accelerators) = var("ACCELERATORS") {
            self.window.accelerators = Some(accelerators);
        }
        if let Some(path) = var("XWAYLAND_PATH") {
            self.xwayland.path = path;
        }

        Ok(())
    }

    /// Clamps ranges, fills Xwayland defaults and validates
    pub fn finalize(mut self) -> Result<Self> {
        self.validate()?;

        self.scale.scale = self.scale.scale.clamp(MIN_SCALE, MAX_SCALE);
        for dpi in &mut self.scale.dpi {
            *dpi = (*dpi).clamp(MIN_DPI, MAX_DPI);
        }
        if self.scale.dpi.is_empty() && self.xwayland.enabled {
            self.scale.dpi = DEFAULT_DPI_BUCKETS.to_vec();
        }

        self.shm_driver()?;
        self.data_driver()?;

        debug!("⚙️ Effective configuration: {:?}", self);
        Ok(self)
    }

    /// Effective shared-memory driver
    pub fn shm_driver(&self) -> Result<ShmDriver> {
        let transport = &self.transport;
        match transport.shm_driver {
            Some(ShmDriver::Dmabuf) if transport.drm_device.is_none() => {
                Err(RelayError::Config("need drm device for dmabuf driver".into()).into())
            }
            Some(ShmDriver::Virtwl | ShmDriver::VirtwlDmabuf) if transport.virtwl_device.is_none() => {
                Err(RelayError::Config("need device for virtwl driver".into()).into())
            }
            Some(driver) => Ok(driver),
            None if transport.drm_device.is_some() => Ok(ShmDriver::Dmabuf),
            None if transport.virtwl_device.is_some() => Ok(ShmDriver::VirtwlDmabuf),
            None => Ok(ShmDriver::Noop),
        }
    }

    /// Effective data transfer driver
    pub fn data_driver(&self) -> Result<DataDriver> {
        let transport = &self.transport;
        match transport.data_driver {
            Some(DataDriver::Virtwl) if transport.virtwl_device.is_none() => {
                Err(RelayError::Config("need device for virtwl driver".into()).into())
            }
            Some(driver) => Ok(driver),
            None if transport.virtwl_device.is_some() => Ok(DataDriver::Virtwl),
            None => Ok(DataDriver::Noop),
        }
    }

    /// Frame color as `0xAARRGGBB`
    pub fn frame_color(&self) -> Result<Option<u32>> {
        self.window
            .frame_color
            .as_deref()
            .map(parse_frame_color)
            .transpose()
            .map_err(Into::into)
    }

    pub fn accelerators(&self) -> Result<Vec<Accelerator>> {
        match &self.window.accelerators {
            Some(list) => Ok(parse_accelerators(list)?),
            None => Ok(Vec::new()),
        }
    }

    /// Whether the clipboard bridge runs
    pub fn clipboard_manager(&self) -> bool {
        self.xwayland.enabled && self.xwayland.clipboard_manager
    }
}

/// Parses `#rrggbb` into an opaque `0xffrrggbb`
pub fn parse_frame_color(color: &str) -> Result<u32, RelayError> {
    let invalid = || RelayError::Config(format!("invalid frame color {:?}", color));
    let hex = color.strip_prefix('#').ok_or_else(invalid)?;
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let rgb = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
    Ok(0xff00_0000 | rgb)
}

/// Parses a comma separated DPI list
pub fn parse_dpi(list: &str) -> Result<Vec<i32>, RelayError> {
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<i32>()
                .map_err(|_| RelayError::Config(format!("invalid DPI value {:?}", token)))
        })
        .collect()
}

#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod tests;
