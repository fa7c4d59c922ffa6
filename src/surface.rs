//! Relayed surface contents
//!
//! Under a copying shm driver every surface owns a pool of output buffers.
//! Attaching a guest shm buffer selects (or allocates) the output buffer
//! that will mirror it; damage accumulates on every output buffer; commit
//! copies the damaged area of guest memory into the selected buffer.
//! Buffers that are not shm backed (dma-buf imports, or everything under
//! the noop driver) bypass the pool.

use crate::geometry::{Rect, Scale};
use crate::transport::{
    BufferDesc, BufferHandle, BufferView, Mmap, OutputBuffer, OutputBufferPool, SharedMmap,
    ShmFormat,
};
use anyhow::Result;
use log::trace;

/// A guest `wl_buffer` created from a locally mapped shm pool
#[derive(Debug, Clone)]
pub struct ShmBuffer {
    pub mmap: SharedMmap,
    pub view: BufferView,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: ShmFormat,
}

impl ShmBuffer {
    pub fn desc(&self) -> BufferDesc {
        BufferDesc {
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.stride,
        }
    }
}

/// What the guest attached
#[derive(Debug, Clone, Copy)]
pub enum Attached<'a> {
    /// Shm memory the relay must copy
    Shm(&'a ShmBuffer),
    /// A buffer the host reads directly
    Direct { width: u32, height: u32 },
    None,
}

/// Result of [`SurfaceContents::attach`]
#[derive(Debug)]
pub struct AttachOutcome<H> {
    /// Output buffer to attach on the host, if the contents are copied
    pub output: Option<H>,
    pub allocated: bool,
    /// Output buffers dropped while looking for a match
    pub evicted: Vec<OutputBuffer<H>>,
}

/// Contents state of one relayed surface
pub struct SurfaceContents<H> {
    pool: OutputBufferPool<H>,
    current: Option<BufferHandle>,
    shm: Option<(SharedMmap, BufferView)>,
    pub width: u32,
    pub height: u32,
    /// `wl_surface.set_buffer_scale` as requested by the guest
    pub buffer_scale: i32,
}

impl<H> Default for SurfaceContents<H> {
    fn default() -> Self {
        Self {
            pool: OutputBufferPool::default(),
            current: None,
            shm: None,
            width: 0,
            height: 0,
            buffer_scale: 1,
        }
    }
}

impl<H: PartialEq + Clone> SurfaceContents<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_contents(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pool(&self) -> &OutputBufferPool<H> {
        &self.pool
    }

    /// Handles `wl_surface.attach`.
    ///
    /// `allocate` is only called when a shm buffer is attached and no
    /// released output buffer of the same geometry exists.
    pub fn attach<F>(&mut self, buffer: Attached<'_>, allocate: F) -> Result<AttachOutcome<H>>
    where
        F: FnOnce(&BufferDesc) -> Result<(H, Mmap)>,
    {
        self.current = None;
        self.shm = None;

        let shm = match buffer {
            Attached::Shm(shm) => {
                self.width = shm.width;
                self.height = shm.height;
                shm
            }
            Attached::Direct { width, height } => {
                self.width = width;
                self.height = height;
                return Ok(AttachOutcome {
                    output: None,
                    allocated: false,
                    evicted: Vec::new(),
                });
            }
            Attached::None => {
                return Ok(AttachOutcome {
                    output: None,
                    allocated: false,
                    evicted: Vec::new(),
                })
            }
        };

        let desc = shm.desc();
        let acquired = self.pool.acquire(&desc, || allocate(&desc))?;
        self.current = Some(acquired.handle);
        self.shm = Some((shm.mmap.clone(), shm.view));
        let output = self.pool.get(acquired.handle).map(|b| b.host.clone());
        Ok(AttachOutcome {
            output,
            allocated: acquired.allocated,
            evicted: acquired.evicted,
        })
    }

    /// Handles `wl_surface.damage` in surface coordinates
    pub fn damage(&mut self, rect: Rect) {
        self.pool.damage_all(rect);
    }

    /// Copies pending damage into the attached output buffer.
    ///
    /// Returns the rectangles copied, in buffer pixels. The guest buffer's
    /// mapping is dropped afterwards; the guest may reuse it.
    pub fn commit(&mut self) -> Vec<Rect> {
        let (Some(handle), Some((mmap, view))) = (self.current, self.shm.take()) else {
            return Vec::new();
        };
        let copied = self.pool.refresh(
            handle,
            &mmap,
            &view,
            (self.width, self.height),
            self.buffer_scale as f64,
        );
        trace!("📋 Copied {} damage rect(s)", copied.len());
        copied
    }

    /// Whether a shm buffer is attached and waiting for commit
    pub fn has_pending_copy(&self) -> bool {
        self.shm.is_some()
    }

    /// Host `wl_buffer.release` for one of our output buffers
    pub fn release_host(&mut self, host: &H) -> bool {
        self.pool.release_host(host)
    }

    /// Whether `host` is one of this surface's output buffers
    pub fn owns(&self, host: &H) -> bool {
        self.pool.iter().any(|b| &b.host == host)
    }

    /// Surface destruction: every output buffer goes
    pub fn drain(&mut self) -> Vec<OutputBuffer<H>> {
        self.current = None;
        self.shm = None;
        self.pool.drain()
    }

    /// Viewport destination in host units for the current contents
    pub fn viewport_destination(&self, scale: &Scale) -> Option<(i32, i32)> {
        if !self.has_contents() {
            return None;
        }
        let divisor = scale.factor() * self.buffer_scale as f64;
        Some((
            (self.width as f64 / divisor).ceil() as i32,
            (self.height as f64 / divisor).ceil() as i32,
        ))
    }

    /// Buffer scale to forward when no viewport is available
    pub fn host_buffer_scale(&self, scale: &Scale) -> i32 {
        scale.buffer_scale() * self.buffer_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AccessSync, Allocation, BufferBackend, HostImport, MockBufferBackend,
    };
    use std::os::fd::OwnedFd;

    fn mapping(size: usize, stride: usize) -> Mmap {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size as u64).unwrap();
        Mmap::new(OwnedFd::from(file), size, 0, stride, 4, AccessSync::None).unwrap()
    }

    fn guest_buffer(width: u32, height: u32) -> ShmBuffer {
        let stride = width * 4;
        let mmap = mapping((stride * height) as usize, stride as usize).into_shared();
        ShmBuffer {
            view: mmap.layout(),
            mmap,
            width,
            height,
            stride,
            format: ShmFormat::Argb8888,
        }
    }

    fn backend_expecting(allocations: usize) -> MockBufferBackend {
        let mut backend = MockBufferBackend::new();
        backend
            .expect_allocate()
            .times(allocations)
            .returning(|desc| {
                let mmap = mapping(desc.size(), desc.stride as usize);
                let fd = mmap.dup_fd()?;
                Ok(Allocation {
                    mmap,
                    import: HostImport::Shm {
                        fd,
                        size: desc.size(),
                        stride: desc.stride,
                    },
                })
            });
        backend
    }

    fn attach(
        contents: &mut SurfaceContents<u32>,
        backend: &mut MockBufferBackend,
        buffer: &ShmBuffer,
        next_host: u32,
    ) -> AttachOutcome<u32> {
        contents
            .attach(Attached::Shm(buffer), |desc| {
                let allocation = backend.allocate(desc)?;
                Ok((next_host, allocation.mmap))
            })
            .unwrap()
    }

    #[test]
    fn test_partial_damage_scenario() {
        let mut backend = backend_expecting(1);
        let mut contents = SurfaceContents::new();
        let guest = guest_buffer(100, 100);
        guest.mmap.write_at(0, &vec![0xAA; 100 * 100 * 4]);

        // First frame: one allocation, fully copied
        let outcome = attach(&mut contents, &mut backend, &guest, 7);
        assert!(outcome.allocated);
        assert_eq!(outcome.output, Some(7));
        assert_eq!(contents.commit(), vec![Rect::new(0, 0, 100, 100)]);
        assert!(contents.release_host(&7));

        // Second frame: only the damaged 50x50 rect is copied
        guest.mmap.write_at(0, &vec![0xBB; 100 * 100 * 4]);
        let outcome = attach(&mut contents, &mut backend, &guest, 8);
        assert!(!outcome.allocated);
        assert_eq!(outcome.output, Some(7));
        contents.damage(Rect::new(0, 0, 50, 50));
        assert_eq!(contents.commit(), vec![Rect::new(0, 0, 50, 50)]);

        let output = contents.pool().iter().next().unwrap().mmap.to_vec();
        assert!(output[..200].iter().all(|b| *b == 0xBB));
        assert!(output[200..400].iter().all(|b| *b == 0xAA));
        assert!(output[49 * 400..49 * 400 + 200].iter().all(|b| *b == 0xBB));
        assert!(output[50 * 400..50 * 400 + 200].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn test_busy_output_forces_second_allocation() {
        let mut backend = backend_expecting(2);
        let mut contents = SurfaceContents::new();
        let guest = guest_buffer(16, 16);

        attach(&mut contents, &mut backend, &guest, 1);
        contents.commit();
        // Host still holds buffer 1
        let outcome = attach(&mut contents, &mut backend, &guest, 2);
        assert!(outcome.allocated);
        assert_eq!(outcome.output, Some(2));
        assert_eq!(contents.pool().len(), 2);
    }

    #[test]
    fn test_resize_evicts_released_buffers() {
        let mut backend = backend_expecting(2);
        let mut contents = SurfaceContents::new();
        attach(&mut contents, &mut backend, &guest_buffer(16, 16), 1);
        contents.commit();
        contents.release_host(&1);

        let outcome = attach(&mut contents, &mut backend, &guest_buffer(32, 16), 2);
        assert!(outcome.allocated);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].host, 1);
        assert!(!contents.owns(&1));
    }

    #[test]
    fn test_direct_buffers_bypass_pool() {
        let mut contents: SurfaceContents<u32> = SurfaceContents::new();
        let outcome = contents
            .attach(Attached::Direct { width: 640, height: 480 }, |_| {
                panic!("direct buffers are never copied")
            })
            .unwrap();
        assert!(outcome.output.is_none());
        assert!(contents.has_contents());
        assert!(contents.commit().is_empty());
    }

    #[test]
    fn test_host_size_helpers() {
        let mut contents: SurfaceContents<u32> = SurfaceContents::new();
        assert_eq!(contents.viewport_destination(&Scale::new(1.5, true)), None);
        contents
            .attach(Attached::Direct { width: 101, height: 50 }, |_| unreachable!())
            .unwrap();
        assert_eq!(
            contents.viewport_destination(&Scale::new(1.5, true)),
            Some((68, 34))
        );
        contents.buffer_scale = 2;
        assert_eq!(contents.host_buffer_scale(&Scale::new(2.0, false)), 4);
        assert_eq!(
            contents.viewport_destination(&Scale::new(2.0, true)),
            Some((26, 13))
        );
    }
}
