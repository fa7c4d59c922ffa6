//! Per-surface output buffer pool
//!
//! Output buffers live in an arena addressed by [`BufferHandle`]s
//! (index + generation), so a stale handle held across an eviction can never
//! alias a newer buffer. Whether a buffer may be written (`Released`) or is
//! still being read by the host (`Busy`) is a field on the buffer itself.

use super::damage::Region;
use super::mmap::{BufferView, Mmap};
use super::{BufferDesc, ShmFormat};
use crate::geometry::Rect;
use anyhow::Result;
use log::{debug, trace};

/// Host ownership state of an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The host is done with it; contents may be refreshed
    Released,
    /// Attached and committed; the host may still read it
    Busy,
}

/// Generation-checked reference into an [`OutputBufferPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

/// A host buffer mirroring guest shared memory
#[derive(Debug)]
pub struct OutputBuffer<H> {
    pub width: u32,
    pub height: u32,
    pub format: ShmFormat,
    /// Host-side `wl_buffer`
    pub host: H,
    pub mmap: Mmap,
    /// Area that is stale relative to guest memory, in surface coordinates
    pub damage: Region,
    pub state: BufferState,
    stamp: u64,
}

impl<H> OutputBuffer<H> {
    fn matches(&self, desc: &BufferDesc) -> bool {
        self.width == desc.width && self.height == desc.height && self.format == desc.format
    }
}

struct Slot<H> {
    generation: u32,
    buffer: Option<OutputBuffer<H>>,
}

/// Result of [`OutputBufferPool::acquire`]
#[derive(Debug)]
pub struct Acquired<H> {
    pub handle: BufferHandle,
    /// Whether a new buffer had to be allocated
    pub allocated: bool,
    /// Released buffers dropped because they no longer match
    pub evicted: Vec<OutputBuffer<H>>,
}

/// Output buffers belonging to one surface
pub struct OutputBufferPool<H> {
    slots: Vec<Slot<H>>,
    free: Vec<u32>,
    clock: u64,
}

impl<H> Default for OutputBufferPool<H> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            clock: 0,
        }
    }
}

impl<H: PartialEq> OutputBufferPool<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, state: BufferState) -> usize {
        self.iter().filter(|b| b.state == state).count()
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&OutputBuffer<H>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.buffer.as_ref())
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Option<&mut OutputBuffer<H>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.buffer.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputBuffer<H>> {
        self.slots.iter().filter_map(|slot| slot.buffer.as_ref())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn handles_by_recency(&self, state: BufferState) -> Vec<BufferHandle> {
        let mut found: Vec<(u64, BufferHandle)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let buffer = slot.buffer.as_ref()?;
                (buffer.state == state).then_some((
                    buffer.stamp,
                    BufferHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                ))
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, handle)| handle).collect()
    }

    fn insert(&mut self, buffer: OutputBuffer<H>) -> BufferHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.buffer = Some(buffer);
            BufferHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                buffer: Some(buffer),
            });
            BufferHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Removes a buffer, invalidating every handle to it
    pub fn remove(&mut self, handle: BufferHandle) -> Option<OutputBuffer<H>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let buffer = slot.buffer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(buffer)
    }

    /// Picks the output buffer for a newly attached guest buffer.
    ///
    /// Released buffers are scanned most recent first; each one that does not
    /// match `desc` is evicted until a match is found. When nothing matches,
    /// `allocate` creates a new buffer which starts out fully damaged.
    pub fn acquire<F>(&mut self, desc: &BufferDesc, allocate: F) -> Result<Acquired<H>>
    where
        F: FnOnce() -> Result<(H, Mmap)>,
    {
        let mut evicted = Vec::new();
        for handle in self.handles_by_recency(BufferState::Released) {
            let matches = self.get(handle).map(|b| b.matches(desc)).unwrap_or(false);
            if matches {
                trace!("♻️ Reusing released output buffer {:?}", handle);
                return Ok(Acquired {
                    handle,
                    allocated: false,
                    evicted,
                });
            }
            if let Some(stale) = self.remove(handle) {
                debug!(
                    "🗑️ Evicting stale {}x{} output buffer",
                    stale.width, stale.height
                );
                evicted.push(stale);
            }
        }

        let (host, mmap) = allocate()?;
        let stamp = self.tick();
        let handle = self.insert(OutputBuffer {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            host,
            mmap,
            damage: Region::full(),
            state: BufferState::Released,
            stamp,
        });
        debug!(
            "🆕 Allocated {}x{} {:?} output buffer",
            desc.width, desc.height, desc.format
        );
        Ok(Acquired {
            handle,
            allocated: true,
            evicted,
        })
    }

    /// Adds surface damage to every buffer, busy or released
    pub fn damage_all(&mut self, rect: Rect) {
        for slot in &mut self.slots {
            if let Some(buffer) = slot.buffer.as_mut() {
                buffer.damage.add(rect);
            }
        }
    }

    /// Brings a buffer up to date with guest memory and marks it busy.
    ///
    /// Each damage rectangle is scaled by `contents_scale` into buffer
    /// pixels, clipped to `contents` and copied row by row inside a CPU
    /// access window. Returns the rectangles that were copied.
    pub fn refresh(
        &mut self,
        handle: BufferHandle,
        src: &Mmap,
        src_layout: &BufferView,
        contents: (u32, u32),
        contents_scale: f64,
    ) -> Vec<Rect> {
        let Some(buffer) = self.get_mut(handle) else {
            return Vec::new();
        };
        let bounds = Rect::new(0, 0, contents.0 as i32, contents.1 as i32);
        let dst_layout = buffer.mmap.layout();
        let mut copied = Vec::new();

        buffer.mmap.begin_access();
        for rect in buffer.damage.rects() {
            let x1 = (rect.x as f64 * contents_scale) as i32;
            let y1 = (rect.y as f64 * contents_scale) as i32;
            let x2 = (rect.x2() as f64 * contents_scale + 0.5) as i32;
            let y2 = (rect.y2() as f64 * contents_scale + 0.5) as i32;
            if let Some(clipped) = Rect::from_corners(x1, y1, x2, y2).intersection(&bounds) {
                buffer
                    .mmap
                    .copy_rect_from(src, src_layout, &dst_layout, &clipped);
                copied.push(clipped);
            }
        }
        buffer.mmap.end_access();

        buffer.damage.clear();
        buffer.state = BufferState::Busy;
        copied
    }

    /// Host `wl_buffer.release`: the buffer may be refreshed again
    pub fn release_host(&mut self, host: &H) -> bool {
        let stamp = self.tick();
        for slot in &mut self.slots {
            if let Some(buffer) = slot.buffer.as_mut() {
                if &buffer.host == host {
                    buffer.state = BufferState::Released;
                    buffer.stamp = stamp;
                    return true;
                }
            }
        }
        false
    }

    /// Empties the pool, returning every buffer for destruction
    pub fn drain(&mut self) -> Vec<OutputBuffer<H>> {
        let handles: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.buffer.is_some())
            .map(|(index, slot)| BufferHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }
}
