//! GPU buffer backend
//!
//! Output buffers are linear, scanout-capable buffer objects allocated with
//! gbm on a DRM render node. The exported dma-buf fd is mapped for CPU copies
//! (bracketed with `DMA_BUF_IOCTL_SYNC`) and imported on the host through
//! linux-dmabuf.

use super::mmap::{AccessSync, Mmap};
use super::{Allocation, BufferBackend, BufferDesc, HostImport};
use anyhow::{anyhow, Context, Result};
use gbm::{BufferObjectFlags, Device as GbmDevice};
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

/// An opened DRM device node
#[derive(Debug)]
pub struct Card {
    file: File,
    path: PathBuf,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for Card {}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
        })
    }
}

/// Allocates output buffers from a gbm device
pub struct DmabufBackend {
    gbm: GbmDevice<Card>,
}

impl DmabufBackend {
    pub fn new(card: Card) -> Result<Self> {
        match drm::Device::get_driver(&card) {
            Ok(driver) => info!(
                "🎮 GPU buffer transport on {} ({})",
                card.path().display(),
                driver.name().to_string_lossy()
            ),
            Err(e) => warn!("Could not query DRM driver of {}: {}", card.path().display(), e),
        }
        let gbm = GbmDevice::new(card).context("couldn't get display device")?;
        Ok(Self { gbm })
    }
}

impl BufferBackend for DmabufBackend {
    fn name(&self) -> &'static str {
        "dmabuf"
    }

    fn allocate(&mut self, desc: &BufferDesc) -> Result<Allocation> {
        let bo = self
            .gbm
            .create_buffer_object::<()>(
                desc.width,
                desc.height,
                desc.format.fourcc(),
                BufferObjectFlags::SCANOUT | BufferObjectFlags::LINEAR,
            )
            .with_context(|| {
                format!("gbm allocation of {}x{} {:?}", desc.width, desc.height, desc.format)
            })?;
        let stride = bo.stride();
        let fd = bo.fd().map_err(|e| anyhow!("exporting gbm buffer: {}", e))?;
        let size = stride as usize * desc.height as usize;

        let mmap = Mmap::new(
            fd.try_clone()?,
            size,
            0,
            stride as usize,
            desc.format.bytes_per_pixel(),
            AccessSync::DmaBuf,
        )?;
        Ok(Allocation {
            mmap,
            import: HostImport::Dmabuf {
                fd,
                stride,
                offset: 0,
                modifier: 0,
            },
        })
    }
}
