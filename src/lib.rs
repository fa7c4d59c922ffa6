//! # Carafe
//!
//! A nested Wayland relay. Carafe is a display server to the programs it
//! runs (the guest) and a client of another display server (the host); it
//! forwards every request and event between the two, rewriting scale,
//! buffers and object identities on the way.
//!
//! ## Architecture
//!
//! - `transport`: guest buffers made visible to the host (passthrough,
//!   dma-buf, or a virtualization channel device)
//! - `proxy` and `registry`: object pairing, argument translation and the
//!   host global policy
//! - `relay`: the protocol engine tying the above to both connections
//! - `window` and `surface`: X window state and relayed surface contents
//! - `xwm`: the embedded X11 window manager for Xwayland
//! - `clipboard`: X selections bridged to Wayland data devices
//! - `server` and `xwayland`: the event loop and child processes
//! - `config`: file, environment and command line settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use carafe::config::RelayConfig;
//! use carafe::server::{self, Launch};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::default().finalize()?;
//!     let launch = Launch {
//!         program: vec!["weston-terminal".into()],
//!         ..Launch::default()
//!     };
//!     std::process::exit(server::run(&config, launch)?);
//! }
//! ```

pub mod clipboard;
pub mod config;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod output;
pub mod protocols;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod seat;
pub mod server;
pub mod surface;
pub mod transport;
pub mod window;
pub mod xwayland;
pub mod xwm;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::Relay;

pub use anyhow::{Context, Error, Result};

/// Version string with build metadata, as printed by `--version`
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_COMMIT"),
    " ",
    env!("BUILD_DATE"),
    " ",
    env!("TARGET_TRIPLE"),
    ")"
);
