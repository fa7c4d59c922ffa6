//! Memory and buffer transport
//!
//! Guest clients draw into `wl_shm` buffers. Depending on where the relay
//! runs, the host compositor may or may not be able to read that memory
//! directly, so one of several backends is chosen at startup:
//!
//! - **noop**: guest shm fds are passed straight through to the host.
//! - **dmabuf**: contents are copied into linear GPU buffers allocated with
//!   gbm and imported on the host through linux-dmabuf.
//! - **virtwl** / **virtwl-dmabuf**: contents are copied into memory
//!   allocated from the virtio-wayland channel device.
//!
//! Copying backends keep a small pool of [`pool::OutputBuffer`]s per surface
//! and only copy damaged rectangles on commit.

pub mod channel;
pub mod damage;
pub mod dmabuf;
pub mod mmap;
pub mod pool;

use anyhow::{bail, Context, Result};
use drm::buffer::DrmFourcc;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

pub use damage::Region;
pub use mmap::{AccessSync, BufferView, Mmap, SharedMmap};
pub use pool::{BufferHandle, BufferState, OutputBuffer, OutputBufferPool};

/// How guest shared memory reaches the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShmDriver {
    #[default]
    Noop,
    Dmabuf,
    Virtwl,
    VirtwlDmabuf,
}

impl ShmDriver {
    /// Whether guest shm contents are copied into relay-owned output buffers
    pub fn copies(&self) -> bool {
        !matches!(self, ShmDriver::Noop)
    }
}

impl FromStr for ShmDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "noop" => ShmDriver::Noop,
            "dmabuf" => ShmDriver::Dmabuf,
            "virtwl" => ShmDriver::Virtwl,
            "virtwl-dmabuf" => ShmDriver::VirtwlDmabuf,
            other => bail!("unknown shm driver '{}'", other),
        })
    }
}

impl fmt::Display for ShmDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShmDriver::Noop => "noop",
            ShmDriver::Dmabuf => "dmabuf",
            ShmDriver::Virtwl => "virtwl",
            ShmDriver::VirtwlDmabuf => "virtwl-dmabuf",
        })
    }
}

/// How clipboard pipes are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DataDriver {
    #[default]
    Noop,
    Virtwl,
}

impl FromStr for DataDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "noop" => DataDriver::Noop,
            "virtwl" => DataDriver::Virtwl,
            other => bail!("unknown data driver '{}'", other),
        })
    }
}

impl fmt::Display for DataDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataDriver::Noop => "noop",
            DataDriver::Virtwl => "virtwl",
        })
    }
}

/// `wl_shm` pixel formats the relay knows how to copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
}

impl ShmFormat {
    /// Decodes the wire value of `wl_shm.format`
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => ShmFormat::Argb8888,
            1 => ShmFormat::Xrgb8888,
            0x3432_4241 => ShmFormat::Abgr8888,
            0x3432_4258 => ShmFormat::Xbgr8888,
            0x3631_4752 => ShmFormat::Rgb565,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
            other => other.fourcc() as u32,
        }
    }

    pub fn fourcc(self) -> DrmFourcc {
        match self {
            ShmFormat::Argb8888 => DrmFourcc::Argb8888,
            ShmFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
            ShmFormat::Abgr8888 => DrmFourcc::Abgr8888,
            ShmFormat::Xbgr8888 => DrmFourcc::Xbgr8888,
            ShmFormat::Rgb565 => DrmFourcc::Rgb565,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ShmFormat::Rgb565 => 2,
            _ => 4,
        }
    }
}

/// Geometry of an output buffer to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: ShmFormat,
    /// Row stride of the guest buffer being mirrored
    pub stride: u32,
}

impl BufferDesc {
    pub fn size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// How the host should import a freshly allocated buffer
#[derive(Debug)]
pub enum HostImport {
    /// Create a `wl_shm` pool over `fd` and a buffer at offset 0
    Shm { fd: OwnedFd, size: usize, stride: u32 },
    /// Import a single-plane dma-buf through linux-dmabuf `create_immed`
    Dmabuf {
        fd: OwnedFd,
        stride: u32,
        offset: u32,
        modifier: u64,
    },
}

/// A relay-owned buffer: CPU mapping plus host import description
#[derive(Debug)]
pub struct Allocation {
    pub mmap: Mmap,
    pub import: HostImport,
}

/// Backend contract shared by every shm driver
#[cfg_attr(test, mockall::automock)]
pub trait BufferBackend {
    fn name(&self) -> &'static str;

    /// Allocates an output buffer the host can read
    fn allocate(&mut self, desc: &BufferDesc) -> Result<Allocation>;

    /// Maps guest memory handed over in a `wl_shm.create_pool` request
    fn import(&mut self, fd: OwnedFd, size: usize) -> Result<Mmap> {
        Mmap::new(fd, size, 0, 0, 0, AccessSync::None)
    }

    /// Returns an output buffer's memory to the backend
    fn release(&mut self, mmap: Mmap) {
        drop(mmap);
    }
}

/// Backend for the noop driver; guest memory is never copied
#[derive(Debug, Default)]
pub struct Passthrough;

impl BufferBackend for Passthrough {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn allocate(&mut self, desc: &BufferDesc) -> Result<Allocation> {
        bail!(
            "passthrough transport cannot allocate a {}x{} output buffer",
            desc.width,
            desc.height
        )
    }
}

/// Opens the backend for `driver`.
///
/// `dmabuf` needs a render node; the channel drivers need the channel
/// device the host connection may already be using.
pub fn open_backend(
    driver: ShmDriver,
    drm_device: Option<&Path>,
    channel: Option<Rc<channel::ChannelDevice>>,
) -> Result<Box<dyn BufferBackend>> {
    let backend: Box<dyn BufferBackend> = match driver {
        ShmDriver::Noop => Box::new(Passthrough),
        ShmDriver::Dmabuf => {
            let path = drm_device.context("the dmabuf driver needs a DRM device")?;
            Box::new(dmabuf::DmabufBackend::new(dmabuf::Card::open(path)?)?)
        }
        ShmDriver::Virtwl | ShmDriver::VirtwlDmabuf => {
            let device = channel.context("the virtwl drivers need a channel device")?;
            Box::new(channel::ChannelBackend::new(
                device,
                driver == ShmDriver::VirtwlDmabuf,
            ))
        }
    };
    info!("📦 Buffer transport: {}", backend.name());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_driver_parse() {
        assert_eq!("noop".parse::<ShmDriver>().unwrap(), ShmDriver::Noop);
        assert_eq!(
            "virtwl-dmabuf".parse::<ShmDriver>().unwrap(),
            ShmDriver::VirtwlDmabuf
        );
        assert!("vulkan".parse::<ShmDriver>().is_err());
        assert!(!ShmDriver::Noop.copies());
        assert!(ShmDriver::Dmabuf.copies());
    }

    #[test]
    fn test_format_wire_round_trip() {
        for format in [
            ShmFormat::Argb8888,
            ShmFormat::Xrgb8888,
            ShmFormat::Abgr8888,
            ShmFormat::Xbgr8888,
            ShmFormat::Rgb565,
        ] {
            assert_eq!(ShmFormat::from_wire(format.to_wire()), Some(format));
        }
        assert_eq!(ShmFormat::from_wire(0xdead_beef), None);
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(ShmFormat::Rgb565.bytes_per_pixel(), 2);
        assert_eq!(ShmFormat::Xbgr8888.bytes_per_pixel(), 4);
        assert_eq!(ShmFormat::Argb8888.fourcc() as u32, 0x3432_5241);
    }

    #[test]
    fn test_passthrough_refuses_allocation() {
        let mut backend = Passthrough;
        let desc = BufferDesc {
            width: 4,
            height: 4,
            format: ShmFormat::Argb8888,
            stride: 16,
        };
        assert!(backend.allocate(&desc).is_err());
    }

    #[test]
    fn test_open_backend_checks_devices() {
        assert_eq!(open_backend(ShmDriver::Noop, None, None).unwrap().name(), "noop");
        assert!(open_backend(ShmDriver::Dmabuf, None, None).is_err());
        assert!(open_backend(ShmDriver::Virtwl, None, None).is_err());
    }
}
