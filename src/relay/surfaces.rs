//! Surfaces, shm pools and buffer copies

use super::{arg_int, arg_object, Relay, Role};
use crate::error::RelayError;
use crate::geometry::Rect;
use crate::proxy::{GuestId, HostId, ObjectKind};
use crate::registry::InternalGlobal;
use crate::relay::{GuestMessage, HostConnection};
use crate::surface::{Attached, ShmBuffer, SurfaceContents};
use crate::transport::{BufferBackend, BufferDesc, HostImport, Mmap, ShmFormat};
use anyhow::{anyhow, Context, Result};
use log::{debug, trace};
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use wayland_backend::protocol::Argument;
use wayland_backend::server::ClientId;

/// `wl_shm.error`
const SHM_ERROR_INVALID_FORMAT: u32 = 0;
const SHM_ERROR_INVALID_STRIDE: u32 = 1;
const SHM_ERROR_INVALID_FD: u32 = 2;

pub(crate) struct SurfaceState {
    pub contents: SurfaceContents<HostId>,
    pub client: ClientId,
    /// Set once the guest gave the surface a role of its own
    pub has_role: bool,
    pub viewport: Option<HostId>,
    /// Guest buffer released on the next commit, its contents having been
    /// copied already
    pub copied_buffer: Option<GuestId>,
    /// Serial of the last input event delivered to the surface
    pub last_event_serial: u32,
}

impl Relay {
    pub(super) fn compositor_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        let created = self.forward_request(msg)?;
        if request != "create_surface" {
            return Ok(());
        }
        let Some((guest, host)) = created else {
            return Ok(());
        };
        let client = self
            .handle
            .get_client(guest.clone())
            .map_err(|_| anyhow!("surface {} has no client", guest))?;

        let viewport = match self.internal.get(&InternalGlobal::Viewporter) {
            Some(viewporter) => {
                let viewport = self.host.send(
                    viewporter,
                    "get_viewport",
                    vec![Argument::NewId(HostId::null()), Argument::Object(host)],
                )?;
                if let Some(viewport) = &viewport {
                    self.objects.insert_internal(viewport.clone(), Role::Viewport);
                }
                viewport
            }
            None => None,
        };

        self.surfaces.insert(
            guest,
            SurfaceState {
                contents: SurfaceContents::new(),
                client,
                has_role: false,
                viewport,
                copied_buffer: None,
                last_event_serial: 0,
            },
        );
        Ok(())
    }

    pub(super) fn surface_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        match request {
            "attach" => self.surface_attach(msg),
            "damage" => self.surface_damage(msg),
            "commit" => self.surface_commit(msg.sender_id),
            "set_buffer_scale" => {
                if let Some(state) = self.surfaces.get_mut(&msg.sender_id) {
                    state.contents.buffer_scale = arg_int(&msg.args, 0).max(1);
                }
                Ok(())
            }
            _ => self.forward(msg),
        }
    }

    fn surface_attach(&mut self, msg: GuestMessage) -> Result<()> {
        let surface = msg.sender_id.clone();
        let buffer = arg_object(&msg.args, 0).filter(|id: &GuestId| !id.is_null());
        let dx = self.scale.to_host(arg_int(&msg.args, 1));
        let dy = self.scale.to_host(arg_int(&msg.args, 2));
        let Some(host_surface) = self.objects.host_of(&surface) else {
            return Ok(());
        };
        let Some(state) = self.surfaces.get_mut(&surface) else {
            return Ok(());
        };
        state.copied_buffer = None;

        let shm = buffer.as_ref().and_then(|buffer| self.shm_buffers.get(buffer));
        let (host_buffer, evicted) = match (&buffer, shm) {
            (Some(buffer), Some(shm)) => {
                let (host, transport, internal) = (&self.host, &mut self.transport, &self.internal);
                let outcome = state.contents.attach(Attached::Shm(shm), |desc| {
                    allocate_output(host, transport.as_mut(), internal, desc)
                })?;
                state.copied_buffer = Some(buffer.clone());
                if let (Some(output), true) = (&outcome.output, outcome.allocated) {
                    self.objects.insert_internal(output.clone(), Role::OutputBuffer);
                }
                (outcome.output, outcome.evicted)
            }
            (Some(buffer), None) => {
                let (width, height) = self.direct_buffers.get(buffer).copied().unwrap_or((0, 0));
                state
                    .contents
                    .attach(Attached::Direct { width, height }, |_| direct_allocation())?;
                (self.objects.host_of(buffer), Vec::new())
            }
            (None, _) => {
                state.contents.attach(Attached::None, |_| direct_allocation())?;
                (None, Vec::new())
            }
        };
        let is_x = self.x_client.as_ref() == Some(&state.client);
        let contents = (state.contents.width, state.contents.height);

        for buffer in evicted {
            self.destroy_output_buffer(buffer.host, buffer.mmap);
        }
        self.host.send(
            &host_surface,
            "attach",
            vec![
                Argument::Object(host_buffer.unwrap_or_else(HostId::null)),
                Argument::Int(dx),
                Argument::Int(dy),
            ],
        )?;

        if is_x {
            let id = surface.protocol_id();
            self.with_xwm(|x, shell| x.xwm.surface_attached(&mut x.conn, shell, id, contents));
        }
        Ok(())
    }

    fn surface_damage(&mut self, msg: GuestMessage) -> Result<()> {
        let rect = Rect::new(
            arg_int(&msg.args, 0),
            arg_int(&msg.args, 1),
            arg_int(&msg.args, 2),
            arg_int(&msg.args, 3),
        );
        if let Some(state) = self.surfaces.get_mut(&msg.sender_id) {
            state.contents.damage(rect);
        }
        let Some(host) = self.objects.host_of(&msg.sender_id) else {
            return Ok(());
        };
        let damage = self.scale.damage_to_host(rect);
        self.host.send(
            &host,
            "damage",
            vec![
                Argument::Int(damage.x),
                Argument::Int(damage.y),
                Argument::Int(damage.width),
                Argument::Int(damage.height),
            ],
        )?;
        Ok(())
    }

    fn surface_commit(&mut self, surface: GuestId) -> Result<()> {
        let Some(host_surface) = self.objects.host_of(&surface) else {
            return Ok(());
        };
        let Some(state) = self.surfaces.get_mut(&surface) else {
            return Ok(());
        };
        let copied = state.contents.commit();
        if !copied.is_empty() {
            trace!("Copied {} damage rects for {}", copied.len(), surface);
        }
        let release = state.copied_buffer.take();

        match &state.viewport {
            Some(viewport) => {
                let (width, height) = state.contents.viewport_destination(&self.scale).unwrap_or((-1, -1));
                self.host.send(
                    viewport,
                    "set_destination",
                    vec![Argument::Int(width), Argument::Int(height)],
                )?;
            }
            None => {
                let buffer_scale = state.contents.host_buffer_scale(&self.scale);
                self.host
                    .send(&host_surface, "set_buffer_scale", vec![Argument::Int(buffer_scale)])?;
            }
        }

        let held = !state.has_role && self.x_client.as_ref() == Some(&state.client);
        let has_contents = state.contents.has_contents();
        if let Some(buffer) = release {
            self.send_guest(&buffer, "release", Vec::new());
        }

        let commit = if held {
            let id = surface.protocol_id();
            self.with_xwm(|x, _| x.xwm.surface_committed(id, has_contents))
                .unwrap_or(true)
        } else {
            true
        };
        if commit {
            self.host.send(&host_surface, "commit", Vec::new())?;
        } else {
            trace!("Holding back commit of {} until its window is mapped", surface);
        }
        Ok(())
    }

    pub(super) fn surface_destroyed(&mut self, surface: &GuestId) {
        let Some(mut state) = self.surfaces.remove(surface) else {
            return;
        };
        for buffer in state.contents.drain() {
            self.destroy_output_buffer(buffer.host, buffer.mmap);
        }
        if let Some(viewport) = state.viewport.take() {
            self.destroy_host(&viewport);
            self.objects.remove_host(&viewport);
        }
        if self.is_x_client(&state.client) {
            let id = surface.protocol_id();
            self.with_xwm(|x, shell| x.xwm.surface_destroyed(&mut x.conn, shell, id));
        }
    }

    fn destroy_output_buffer(&mut self, host: HostId, mmap: Mmap) {
        self.destroy_host(&host);
        self.objects.remove_host(&host);
        self.transport.release(mmap);
    }

    pub(super) fn output_buffer_released(&mut self, host: &HostId) {
        let released = self
            .surfaces
            .values_mut()
            .any(|state| state.contents.release_host(host));
        if !released {
            debug!("Release of an output buffer no surface owns");
        }
    }

    pub(super) fn shm_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        if request != "create_pool" || !self.options.shm_driver.copies() {
            return self.forward(msg);
        }
        let shm = msg.sender_id.clone();
        let version = self.guest_version(&shm);
        let mut args = msg.args.into_iter();
        let (Some(Argument::NewId(pool)), Some(Argument::Fd(fd)), Some(Argument::Int(size))) =
            (args.next(), args.next(), args.next())
        else {
            return Err(RelayError::protocol("wl_shm", "malformed create_pool").into());
        };
        if size <= 0 {
            self.post_error(&shm, SHM_ERROR_INVALID_FD, "pool size must be positive");
            return Ok(());
        }

        let mmap = match self.transport.import(fd, size as usize) {
            Ok(mmap) => mmap.into_shared(),
            Err(e) => {
                self.post_error(&shm, SHM_ERROR_INVALID_FD, &format!("cannot map pool: {:#}", e));
                return Ok(());
            }
        };
        self.objects.insert_local(pool.clone(), ObjectKind::ShmPool, version);
        self.shm_pools.insert(pool, mmap);
        Ok(())
    }

    pub(super) fn shm_pool_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        let pool = msg.sender_id.clone();
        if self.objects.host_of(&pool).is_some() {
            // The host reads these buffers itself; only their size matters
            let size = (arg_int(&msg.args, 2).max(0) as u32, arg_int(&msg.args, 3).max(0) as u32);
            let created = self.forward_request(msg)?;
            if let (Some((buffer, _)), "create_buffer") = (created, request) {
                self.direct_buffers.insert(buffer, size);
            }
            return Ok(());
        }

        match request {
            "create_buffer" => self.create_shm_buffer(pool, msg),
            "resize" => {
                let size = arg_int(&msg.args, 0);
                let Some(current) = self.shm_pools.get(&pool) else {
                    return Ok(());
                };
                if size <= 0 || size as usize <= current.size() {
                    return Ok(());
                }
                let fd = current.dup_fd()?;
                let mmap = self.transport.import(fd, size as usize)?.into_shared();
                self.shm_pools.insert(pool, mmap);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn create_shm_buffer(&mut self, pool: GuestId, msg: GuestMessage) -> Result<()> {
        let Some(mmap) = self.shm_pools.get(&pool).cloned() else {
            return Ok(());
        };
        let Some(buffer) = arg_object(&msg.args, 0) else {
            return Err(RelayError::protocol("wl_shm_pool", "create_buffer without a new id").into());
        };
        let offset = arg_int(&msg.args, 1);
        let width = arg_int(&msg.args, 2);
        let height = arg_int(&msg.args, 3);
        let stride = arg_int(&msg.args, 4);
        let Some(format) = ShmFormat::from_wire(super::arg_uint(&msg.args, 5)) else {
            self.post_error(&pool, SHM_ERROR_INVALID_FORMAT, "unsupported format");
            return Ok(());
        };

        let bpp = format.bytes_per_pixel();
        let fits = offset >= 0
            && width > 0
            && height > 0
            && stride as i64 >= width as i64 * bpp as i64
            && offset as i64 + stride as i64 * height as i64 <= mmap.size() as i64;
        if !fits {
            self.post_error(&pool, SHM_ERROR_INVALID_STRIDE, "buffer does not fit the pool");
            return Ok(());
        }

        let version = self.guest_version(&buffer);
        self.objects.insert_local(buffer.clone(), ObjectKind::Buffer, version);
        let view = crate::transport::BufferView {
            offset: offset as usize,
            stride: stride as usize,
            bpp,
        };
        self.shm_buffers.insert(
            buffer,
            ShmBuffer {
                mmap,
                view,
                width: width as u32,
                height: height as u32,
                stride: stride as u32,
                format,
            },
        );
        Ok(())
    }
}

fn direct_allocation() -> Result<(HostId, Mmap)> {
    Err(anyhow!("direct buffers are never copied"))
}

/// Allocates a host buffer for copies of a guest shm buffer
fn allocate_output(
    host: &HostConnection,
    transport: &mut dyn BufferBackend,
    internal: &HashMap<InternalGlobal, HostId>,
    desc: &BufferDesc,
) -> Result<(HostId, Mmap)> {
    let allocation = transport.allocate(desc)?;
    let buffer = match &allocation.import {
        HostImport::Shm { fd, size, stride } => {
            let shm = internal.get(&InternalGlobal::Shm).context("no host wl_shm")?;
            let pool = host
                .send(
                    shm,
                    "create_pool",
                    vec![
                        Argument::NewId(HostId::null()),
                        Argument::Fd(fd.as_raw_fd()),
                        Argument::Int(*size as i32),
                    ],
                )?
                .context("wl_shm.create_pool created nothing")?;
            let buffer = host.send(
                &pool,
                "create_buffer",
                vec![
                    Argument::NewId(HostId::null()),
                    Argument::Int(0),
                    Argument::Int(desc.width as i32),
                    Argument::Int(desc.height as i32),
                    Argument::Int(*stride as i32),
                    Argument::Uint(desc.format.to_wire()),
                ],
            )?;
            host.send(&pool, "destroy", Vec::new())?;
            buffer
        }
        HostImport::Dmabuf {
            fd,
            stride,
            offset,
            modifier,
        } => {
            let dmabuf = internal
                .get(&InternalGlobal::LinuxDmabuf)
                .context("no host zwp_linux_dmabuf_v1")?;
            let params = host
                .send(dmabuf, "create_params", vec![Argument::NewId(HostId::null())])?
                .context("create_params created nothing")?;
            host.send(
                &params,
                "add",
                vec![
                    Argument::Fd(fd.as_raw_fd()),
                    Argument::Uint(0),
                    Argument::Uint(*offset),
                    Argument::Uint(*stride),
                    Argument::Uint((*modifier >> 32) as u32),
                    Argument::Uint(*modifier as u32),
                ],
            )?;
            let buffer = host.send(
                &params,
                "create_immed",
                vec![
                    Argument::NewId(HostId::null()),
                    Argument::Int(desc.width as i32),
                    Argument::Int(desc.height as i32),
                    Argument::Uint(desc.format.fourcc() as u32),
                    Argument::Uint(0),
                ],
            )?;
            host.send(&params, "destroy", Vec::new())?;
            buffer
        }
    };
    let buffer = buffer.context("host buffer creation created nothing")?;
    debug!(
        "Allocated {}x{} output buffer through {}",
        desc.width,
        desc.height,
        transport.name()
    );
    Ok((buffer, allocation.mmap))
}
