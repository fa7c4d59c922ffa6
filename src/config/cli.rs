//! Command line interface

use super::{parse_dpi, RelayConfig};
use crate::transport::{DataDriver, ShmDriver};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "carafe")]
#[command(about = "Nested Wayland relay with an embedded X11 window manager")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log every relayed protocol message
    #[arg(long)]
    pub trace_protocol: bool,

    /// Listen on a socket and fork a relay per connection
    #[arg(long)]
    pub master: bool,

    /// Socket name for master mode
    #[arg(long, value_name = "SOCKET")]
    pub socket: Option<String>,

    /// Host display to connect to
    #[arg(long, value_name = "DISPLAY")]
    pub display: Option<String>,

    #[arg(long, value_name = "DRIVER")]
    pub shm_driver: Option<ShmDriver>,

    #[arg(long, value_name = "DRIVER")]
    pub data_driver: Option<DataDriver>,

    /// Pid of the peer a master forked this relay for
    #[arg(long, value_name = "PID")]
    pub peer_pid: Option<i32>,

    #[arg(long, value_name = "PREFIX")]
    pub peer_cmd_prefix: Option<String>,

    #[arg(long, value_name = "PREFIX")]
    pub xwayland_cmd_prefix: Option<String>,

    /// Serve an already connected guest client on this fd
    #[arg(long, value_name = "FD")]
    pub client_fd: Option<i32>,

    #[arg(long, value_name = "SCALE")]
    pub scale: Option<f64>,

    /// DPI buckets, e.g. 72,96,160
    #[arg(long, value_name = "DPI[,DPI...]")]
    pub dpi: Option<String>,

    /// Host reserved accelerators, e.g. <Control><Alt>Delete
    #[arg(long, value_name = "ACCELERATORS")]
    pub accelerators: Option<String>,

    /// Forced application id for every toplevel
    #[arg(long, value_name = "ID")]
    pub application_id: Option<String>,

    /// Run Xwayland and the window manager
    #[arg(short = 'X')]
    pub xwayland: bool,

    /// X display number, implies -X
    #[arg(long, value_name = "N")]
    pub x_display: Option<u32>,

    #[arg(long, value_name = "PATH")]
    pub xwayland_path: Option<String>,

    /// Keep running after the program exits
    #[arg(long)]
    pub no_exit_with_child: bool,

    /// Notify this socket once ready
    #[arg(long, value_name = "SOCKET")]
    pub sd_notify: Option<String>,

    #[arg(long)]
    pub no_clipboard_manager: bool,

    /// Frame color as #rrggbb
    #[arg(long, value_name = "COLOR")]
    pub frame_color: Option<String>,

    #[arg(long, value_name = "DEVICE")]
    pub virtwl_device: Option<PathBuf>,

    #[arg(long, value_name = "DEVICE")]
    pub drm_device: Option<PathBuf>,

    /// Let Xwayland use glamor
    #[arg(long)]
    pub glamor: bool,

    /// Program to run and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub program: Vec<String>,
}

impl Cli {
    /// Applies command line overrides on top of file and environment
    pub fn apply(&self, config: &mut RelayConfig) -> Result<()> {
        if let Some(socket) = &self.socket {
            config.display.socket = socket.clone();
        }
        if let Some(display) = &self.display {
            config.display.host_display = Some(display.clone());
        }
        if let Some(prefix) = &self.peer_cmd_prefix {
            config.display.peer_cmd_prefix = Some(prefix.clone());
        }
        if let Some(path) = &self.sd_notify {
            config.display.sd_notify = Some(path.clone());
        }

        if let Some(driver) = self.shm_driver {
            config.transport.shm_driver = Some(driver);
        }
        if let Some(driver) = self.data_driver {
            config.transport.data_driver = Some(driver);
        }
        if let Some(device) = &self.virtwl_device {
            config.transport.virtwl_device = Some(device.clone());
        }
        if let Some(device) = &self.drm_device {
            config.transport.drm_device = Some(device.clone());
        }
        if self.glamor {
            config.transport.glamor = true;
        }

        if let Some(scale) = self.scale {
            config.scale.scale = scale;
        }
        if let Some(dpi) = &self.dpi {
            config.scale.dpi = parse_dpi(dpi)?;
        }

        if self.xwayland || self.x_display.is_some() {
            config.xwayland.enabled = true;
        }
        if let Some(display) = self.x_display {
            config.xwayland.display = Some(display);
        }
        if let Some(path) = &self.xwayland_path {
            config.xwayland.path = path.clone();
        }
        if let Some(prefix) = &self.xwayland_cmd_prefix {
            config.xwayland.cmd_prefix = Some(prefix.clone());
        }
        if self.no_exit_with_child {
            config.xwayland.exit_with_child = false;
        }
        if self.no_clipboard_manager {
            config.xwayland.clipboard_manager = false;
        }

        if let Some(id) = &self.application_id {
            config.window.application_id = Some(id.clone());
        }
        if let Some(color) = &self.frame_color {
            config.window.frame_color = Some(color.clone());
        }
        if let Some(accelerators) = &self.accelerators {
            config.window.accelerators = Some(accelerators.clone());
        }

        Ok(())
    }

    /// File, then environment, then command line
    pub fn resolve(&self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::load_default()?,
        };
        config.apply_env()?;
        self.apply(&mut config)?;
        config.finalize()
    }

    /// Flags a master forwards to each forked peer
    pub fn peer_args(&self, config: &RelayConfig) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(display) = &config.display.host_display {
            args.push(format!("--display={}", display));
        }
        if self.scale.is_some() {
            args.push(format!("--scale={}", config.scale.scale));
        }
        if let Some(accelerators) = &config.window.accelerators {
            args.push(format!("--accelerators={}", accelerators));
        }
        if let Some(device) = &config.transport.virtwl_device {
            args.push(format!("--virtwl-device={}", device.display()));
        }
        if let Some(device) = &config.transport.drm_device {
            args.push(format!("--drm-device={}", device.display()));
        }
        if let Some(driver) = config.transport.shm_driver {
            args.push(format!("--shm-driver={}", driver));
        }
        if let Some(driver) = config.transport.data_driver {
            args.push(format!("--data-driver={}", driver));
        }
        args
    }
}
