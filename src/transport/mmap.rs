//! Shared memory mappings backing guest and output buffers
//!
//! A [`Mmap`] owns the file descriptor and the mapping of one memory region.
//! Guest `wl_shm` pools hand out buffers that all point into the same region,
//! so mappings are shared through [`SharedMmap`] (`Rc<Mmap>`): every buffer
//! created from a pool holds a strong reference and the region is unmapped
//! when the last one goes away.
//!
//! GPU buffers need CPU cache maintenance around every CPU access. That is
//! expressed as an [`AccessSync`] mode on the mapping, applied by
//! [`Mmap::begin_access`] / [`Mmap::end_access`].

use crate::geometry::Rect;
use anyhow::{Context, Result};
use log::{debug, warn};
use memmap2::{MmapOptions, MmapRaw};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

/// A mapping shared between every buffer descriptor created from it
pub type SharedMmap = Rc<Mmap>;

/// `DMA_BUF_IOCTL_SYNC` = `_IOW('b', 0, struct dma_buf_sync)`
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

/// Cache maintenance applied around CPU access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSync {
    /// Plain shared memory; nothing to do
    None,
    /// dma-buf; bracket access with `DMA_BUF_IOCTL_SYNC`
    DmaBuf,
}

/// One mapped memory region
pub struct Mmap {
    fd: OwnedFd,
    map: MmapRaw,
    size: usize,
    offset: usize,
    stride: usize,
    bpp: usize,
    sync: AccessSync,
    on_release: Option<Box<dyn FnOnce()>>,
}

impl fmt::Debug for Mmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mmap")
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("stride", &self.stride)
            .field("bpp", &self.bpp)
            .field("sync", &self.sync)
            .finish()
    }
}

impl Mmap {
    /// Maps `size` bytes of `fd` read-write.
    ///
    /// `offset` and `stride` describe where pixel data starts and how far
    /// apart rows are; `bpp` is bytes per pixel.
    pub fn new(
        fd: OwnedFd,
        size: usize,
        offset: usize,
        stride: usize,
        bpp: usize,
        sync: AccessSync,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("refusing to map an empty region");
        }
        // SAFETY: the mapping is only ever accessed through raw pointers with
        // explicit bounds checks; other processes may write to it concurrently.
        let map = unsafe { MmapOptions::new().len(size).map_raw(&fd) }
            .with_context(|| format!("mmap of {} bytes on fd {}", size, fd.as_raw_fd()))?;
        debug!(
            "🗺️ Mapped fd {} ({} bytes, stride {}, bpp {})",
            fd.as_raw_fd(),
            size,
            stride,
            bpp
        );
        Ok(Self {
            fd,
            map,
            size,
            offset,
            stride,
            bpp,
            sync,
            on_release: None,
        })
    }

    /// Registers a hook that runs once when the region is finally released
    pub fn with_release_hook(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn into_shared(self) -> SharedMmap {
        Rc::new(self)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn bpp(&self) -> usize {
        self.bpp
    }

    pub fn sync(&self) -> AccessSync {
        self.sync
    }

    /// Pixel layout the mapping was created with
    pub fn layout(&self) -> BufferView {
        BufferView {
            offset: self.offset,
            stride: self.stride,
            bpp: self.bpp,
        }
    }

    /// Starts a CPU access window
    pub fn begin_access(&self) {
        if self.sync == AccessSync::DmaBuf {
            self.dmabuf_sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW);
        }
    }

    /// Ends a CPU access window
    pub fn end_access(&self) {
        if self.sync == AccessSync::DmaBuf {
            self.dmabuf_sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW);
        }
    }

    fn dmabuf_sync(&self, flags: u64) {
        let sync = DmaBufSync { flags };
        // SAFETY: DMA_BUF_IOCTL_SYNC reads one `struct dma_buf_sync` from the pointer.
        let rv = unsafe { libc::ioctl(self.fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC as _, &sync) };
        if rv != 0 {
            warn!(
                "DMA_BUF_IOCTL_SYNC({:#x}) failed on fd {}: {}",
                flags,
                self.fd.as_raw_fd(),
                std::io::Error::last_os_error()
            );
        }
    }

    /// Copies the pixels of `rect` from `src` into this mapping.
    ///
    /// Both sides are addressed as `offset + y * stride + x * bpp` using their
    /// own layouts. `rect` must already be clipped to non-negative
    /// coordinates; rows falling outside either mapping are skipped.
    pub fn copy_rect_from(
        &self,
        src: &Mmap,
        src_layout: &BufferView,
        dst_layout: &BufferView,
        rect: &Rect,
    ) {
        if rect.is_empty() || rect.x < 0 || rect.y < 0 {
            return;
        }
        let (x, y) = (rect.x as usize, rect.y as usize);
        let row_bytes = rect.width as usize * src_layout.bpp;
        let src_base = src.map.as_ptr();
        let dst_base = self.map.as_mut_ptr();
        for row in y..y + rect.height as usize {
            let s = src_layout.offset + row * src_layout.stride + x * src_layout.bpp;
            let d = dst_layout.offset + row * dst_layout.stride + x * dst_layout.bpp;
            if s + row_bytes > src.size || d + row_bytes > self.size {
                warn!("damage row {} outside mapping, skipping", row);
                continue;
            }
            // SAFETY: both ranges were bounds-checked against their mappings.
            unsafe {
                std::ptr::copy_nonoverlapping(src_base.add(s), dst_base.add(d), row_bytes);
            }
        }
    }

    /// Reads the whole mapping into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        // SAFETY: `out` has exactly `size` bytes and the mapping is `size` long.
        unsafe { std::ptr::copy_nonoverlapping(self.map.as_ptr(), out.as_mut_ptr(), self.size) };
        out
    }

    /// Writes `data` at byte offset `at`, clipped to the mapping
    pub fn write_at(&self, at: usize, data: &[u8]) {
        if at >= self.size {
            return;
        }
        let len = data.len().min(self.size - at);
        // SAFETY: `at + len <= size`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(at), len) };
    }

    pub fn dup_fd(&self) -> Result<OwnedFd> {
        self.fd.try_clone().context("dup mapping fd")
    }
}

impl AsFd for Mmap {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        debug!("🧹 Releasing mapping of fd {} ({} bytes)", self.fd.as_raw_fd(), self.size);
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

/// Pixel layout of one buffer inside a (possibly shared) mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub offset: usize,
    pub stride: usize,
    pub bpp: usize,
}
