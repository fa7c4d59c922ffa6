//! Guest-facing globals the relay implements on top of host ones:
//! `gtk_shell1` over the aura shell and `wl_drm` over linux-dmabuf

use super::{arg_int, arg_object, arg_str, arg_uint, opt_str_arg, str_arg, GuestMessage, Relay, Role};
use crate::proxy::{GuestId, HostId, ObjectKind};
use crate::registry::InternalGlobal;
use crate::transport::ShmFormat;
use anyhow::{Context, Result};
use log::{debug, trace};
use wayland_backend::protocol::Argument;
use wayland_backend::server::ClientId;

/// `wl_drm.capability.prime`
const DRM_CAPABILITY_PRIME: u32 = 1;
/// `wl_drm.error.invalid_name`
const DRM_ERROR_INVALID_NAME: u32 = 2;

impl Relay {
    pub(super) fn gtk_shell_request(&mut self, client: ClientId, msg: GuestMessage, request: &str) -> Result<()> {
        match request {
            "get_gtk_surface" => {
                let (Some(gtk_surface), Some(surface)) = (arg_object(&msg.args, 0), arg_object(&msg.args, 1)) else {
                    return Ok(());
                };
                let version = self.guest_version(&gtk_surface);
                self.objects.insert_local(gtk_surface.clone(), ObjectKind::GtkSurface, version);

                let aura = match (
                    self.internal.get(&InternalGlobal::AuraShell),
                    self.objects.host_of(&surface),
                ) {
                    (Some(shell), Some(host_surface)) => self.host.send(
                        shell,
                        "get_aura_surface",
                        vec![Argument::NewId(HostId::null()), Argument::Object(host_surface)],
                    )?,
                    _ => None,
                };
                if let Some(aura) = &aura {
                    self.objects.insert_internal(aura.clone(), Role::AuraSurface);
                    if let Some(startup_id) = &self.gtk_startup_id {
                        self.host
                            .send(aura, "set_startup_id", vec![str_arg(startup_id)])?;
                    }
                    if let Some(app_id) = &self.options.application_id {
                        self.host.send(aura, "set_application_id", vec![str_arg(app_id)])?;
                    }
                }
                debug!("gtk surface for client {:?}", client);
                self.gtk_surfaces.insert(gtk_surface, aura);
            }
            "set_startup_id" => {
                self.gtk_startup_id = arg_str(&msg.args, 0);
                for aura in self.gtk_surfaces.values().flatten() {
                    self.host.send(
                        aura,
                        "set_startup_id",
                        vec![opt_str_arg(self.gtk_startup_id.as_deref())],
                    )?;
                }
            }
            "system_bell" => trace!("System bell"),
            _ => {}
        }
        Ok(())
    }

    pub(super) fn gtk_surface_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        let Some(Some(aura)) = self.gtk_surfaces.get(&msg.sender_id) else {
            return Ok(());
        };
        match request {
            "set_dbus_properties" if self.options.application_id.is_none() => {
                if let Some(app_id) = arg_str(&msg.args, 0) {
                    self.host.send(aura, "set_application_id", vec![str_arg(&app_id)])?;
                }
            }
            "present" => trace!("gtk present at {}", arg_uint(&msg.args, 0)),
            _ => {}
        }
        Ok(())
    }

    pub(super) fn gtk_surface_destroyed(&mut self, gtk_surface: &GuestId) {
        if let Some(Some(aura)) = self.gtk_surfaces.remove(gtk_surface) {
            self.objects.remove_host(&aura);
        }
    }

    pub(super) fn drm_bound(&mut self, guest: &GuestId) {
        let device = self
            .options
            .drm_device
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        self.send_guest(guest, "device", vec![str_arg(&device)]);
        for format in [ShmFormat::Argb8888, ShmFormat::Xrgb8888] {
            self.send_guest(guest, "format", vec![Argument::Uint(format.fourcc() as u32)]);
        }
        self.send_guest(guest, "capabilities", vec![Argument::Uint(DRM_CAPABILITY_PRIME)]);
    }

    pub(super) fn drm_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        let drm = msg.sender_id.clone();
        match request {
            "authenticate" => self.send_guest(&drm, "authenticated", Vec::new()),
            "create_prime_buffer" => return self.create_prime_buffer(msg),
            "create_buffer" | "create_planar_buffer" => {
                self.post_error(&drm, DRM_ERROR_INVALID_NAME, "only prime buffers are supported")
            }
            _ => {}
        }
        Ok(())
    }

    /// `wl_drm.create_prime_buffer` becomes a single-plane linux-dmabuf
    /// import on the host
    fn create_prime_buffer(&mut self, msg: GuestMessage) -> Result<()> {
        let Some(buffer) = arg_object(&msg.args, 0) else {
            return Ok(());
        };
        let Some(Argument::Fd(fd)) = msg.args.get(1) else {
            return Ok(());
        };
        let (width, height) = (arg_int(&msg.args, 2), arg_int(&msg.args, 3));
        let format = arg_uint(&msg.args, 4);
        let (offset, stride) = (arg_int(&msg.args, 5), arg_int(&msg.args, 6));

        let dmabuf = self
            .internal
            .get(&InternalGlobal::LinuxDmabuf)
            .context("wl_drm without a host zwp_linux_dmabuf_v1")?;
        let params = self
            .host
            .send(dmabuf, "create_params", vec![Argument::NewId(HostId::null())])?
            .context("create_params created nothing")?;
        self.host.send(
            &params,
            "add",
            vec![
                Argument::Fd(std::os::fd::AsRawFd::as_raw_fd(fd)),
                Argument::Uint(0),
                Argument::Uint(offset as u32),
                Argument::Uint(stride as u32),
                Argument::Uint(0),
                Argument::Uint(0),
            ],
        )?;
        let host_buffer = self
            .host
            .send(
                &params,
                "create_immed",
                vec![
                    Argument::NewId(HostId::null()),
                    Argument::Int(width),
                    Argument::Int(height),
                    Argument::Uint(format),
                    Argument::Uint(0),
                ],
            )?
            .context("create_immed created nothing")?;
        self.host.send(&params, "destroy", Vec::new())?;

        let version = self.guest_version(&buffer);
        self.objects.pair(buffer.clone(), ObjectKind::Buffer, version, host_buffer);
        self.direct_buffers
            .insert(buffer, (width.max(0) as u32, height.max(0) as u32));
        Ok(())
    }
}
