//! Host shell objects for X windows, and X event dispatch

use super::surfaces::SurfaceState;
use super::{arg_array, arg_int, arg_uint, opt_str_arg, str_arg, HostConnection, HostMessage, Relay, Role};
use crate::clipboard::{Clipboard, SelectionRequest};
use crate::geometry::Rect;
use crate::proxy::{destructor, GuestId, HostId, ObjectTable};
use crate::registry::InternalGlobal;
use crate::relay::data::HostDataDevice;
use crate::relay::host::HostArgs;
use crate::window::{Positioner, Shell, ShellRequest, SurfaceInfo};
use crate::xwm::x11::XConnection;
use crate::xwm::{ConfigureRequest, WindowChanges, Xwm, XwmOptions};
use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use wayland_backend::protocol::Argument;
use wayland_backend::server::ClientId;
use x11rb::protocol::xproto::{ConfigWindow, ConfigureRequestEvent, Property as PropertyState};
use x11rb::protocol::Event;

/// `xdg_positioner.anchor.top_left`
const POSITIONER_ANCHOR_TOP_LEFT: u32 = 5;
/// `xdg_positioner.gravity.bottom_right`
const POSITIONER_GRAVITY_BOTTOM_RIGHT: u32 = 8;

/// The X side of the relay, present once Xwayland is up
pub struct XState {
    pub conn: XConnection,
    pub xwm: Xwm<HostId>,
    pub clipboard: Option<Clipboard<HostDataDevice>>,
}

/// [`Shell`] over the host connection
pub(crate) struct HostShell<'a> {
    host: &'a HostConnection,
    objects: &'a mut ObjectTable<GuestId, HostId, Role>,
    surfaces: &'a HashMap<GuestId, SurfaceState>,
    internal: &'a HashMap<InternalGlobal, HostId>,
    x_client: Option<&'a ClientId>,
}

impl HostShell<'_> {
    /// Xwayland's surface with protocol id `surface_id`
    fn guest_surface(&self, surface_id: u32) -> Option<(&GuestId, &SurfaceState)> {
        self.surfaces
            .iter()
            .find(|(id, state)| id.protocol_id() == surface_id && Some(&state.client) == self.x_client)
    }

    fn host_surface(&self, surface_id: u32) -> Option<HostId> {
        let (guest, _) = self.guest_surface(surface_id)?;
        self.objects.host_of(guest)
    }

    fn create(&mut self, target: &HostId, request: &str, args: HostArgs, role: Role) -> Option<HostId> {
        match self.host.send(target, request, args) {
            Ok(Some(id)) => {
                self.objects.insert_internal(id.clone(), role);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Shell request {} failed: {:#}", request, e);
                None
            }
        }
    }

    fn request(&self, target: &HostId, request: &str, args: HostArgs) {
        if let Err(e) = self.host.send(target, request, args) {
            warn!("Shell request {} failed: {:#}", request, e);
        }
    }

    fn seat(&self) -> Option<HostId> {
        self.internal.get(&InternalGlobal::Seat).cloned()
    }
}

impl Shell for HostShell<'_> {
    type Ref = HostId;

    fn surface(&self, surface_id: u32) -> Option<SurfaceInfo> {
        let (_, state) = self.guest_surface(surface_id)?;
        Some(SurfaceInfo {
            contents: (state.contents.width, state.contents.height),
            last_event_serial: state.last_event_serial,
        })
    }

    fn has_aura(&self) -> bool {
        self.internal.contains_key(&InternalGlobal::AuraShell)
    }

    fn get_xdg_surface(&mut self, window: u32, surface_id: u32) -> Option<HostId> {
        let wm_base = self.internal.get(&InternalGlobal::XdgWmBase)?.clone();
        let surface = self.host_surface(surface_id)?;
        self.create(
            &wm_base,
            "get_xdg_surface",
            vec![Argument::NewId(HostId::null()), Argument::Object(surface)],
            Role::XdgSurface { window },
        )
    }

    fn get_toplevel(&mut self, window: u32, xdg_surface: &HostId) -> Option<HostId> {
        self.create(
            xdg_surface,
            "get_toplevel",
            vec![Argument::NewId(HostId::null())],
            Role::Toplevel { window },
        )
    }

    fn get_popup(
        &mut self,
        window: u32,
        xdg_surface: &HostId,
        parent: &HostId,
        positioner: Positioner,
    ) -> Option<HostId> {
        let wm_base = self.internal.get(&InternalGlobal::XdgWmBase)?.clone();
        let object = self.create(
            &wm_base,
            "create_positioner",
            vec![Argument::NewId(HostId::null())],
            Role::Positioner,
        )?;
        let rect = positioner.anchor_rect;
        self.request(
            &object,
            "set_size",
            vec![Argument::Int(positioner.size.0), Argument::Int(positioner.size.1)],
        );
        self.request(
            &object,
            "set_anchor_rect",
            vec![
                Argument::Int(rect.x),
                Argument::Int(rect.y),
                Argument::Int(rect.width),
                Argument::Int(rect.height),
            ],
        );
        self.request(&object, "set_anchor", vec![Argument::Uint(POSITIONER_ANCHOR_TOP_LEFT)]);
        self.request(&object, "set_gravity", vec![Argument::Uint(POSITIONER_GRAVITY_BOTTOM_RIGHT)]);

        let popup = self.create(
            xdg_surface,
            "get_popup",
            vec![
                Argument::NewId(HostId::null()),
                Argument::Object(parent.clone()),
                Argument::Object(object.clone()),
            ],
            Role::Popup { window },
        );
        self.request(&object, "destroy", Vec::new());
        self.objects.remove_host(&object);
        popup
    }

    fn get_aura_surface(&mut self, surface_id: u32) -> Option<HostId> {
        let aura_shell = self.internal.get(&InternalGlobal::AuraShell)?.clone();
        let surface = self.host_surface(surface_id)?;
        self.create(
            &aura_shell,
            "get_aura_surface",
            vec![Argument::NewId(HostId::null()), Argument::Object(surface)],
            Role::AuraSurface,
        )
    }

    fn send(&mut self, request: ShellRequest<HostId>) {
        match request {
            ShellRequest::Destroy(object) => {
                if let Some(interface) = self.host.interface(&object) {
                    if let Some(opcode) = destructor(interface, self.host.version(&object)) {
                        if let Err(e) = self.host.send_raw(&object, opcode, Vec::new(), None) {
                            debug!("Destroying {}: {:#}", interface.name, e);
                        }
                    }
                }
                self.objects.remove_host(&object);
            }
            ShellRequest::SetParent { toplevel, parent } => self.request(
                &toplevel,
                "set_parent",
                vec![Argument::Object(parent.unwrap_or_else(HostId::null))],
            ),
            ShellRequest::SetTitle { toplevel, title } => self.request(&toplevel, "set_title", vec![str_arg(&title)]),
            ShellRequest::SetMinSize { toplevel, width, height } => self.request(
                &toplevel,
                "set_min_size",
                vec![Argument::Int(width), Argument::Int(height)],
            ),
            ShellRequest::SetMaxSize { toplevel, width, height } => self.request(
                &toplevel,
                "set_max_size",
                vec![Argument::Int(width), Argument::Int(height)],
            ),
            ShellRequest::SetFullscreen(toplevel) => self.request(
                &toplevel,
                "set_fullscreen",
                vec![Argument::Object(HostId::null())],
            ),
            ShellRequest::UnsetFullscreen(toplevel) => self.request(&toplevel, "unset_fullscreen", Vec::new()),
            ShellRequest::SetMaximized(toplevel) => self.request(&toplevel, "set_maximized", Vec::new()),
            ShellRequest::UnsetMaximized(toplevel) => self.request(&toplevel, "unset_maximized", Vec::new()),
            ShellRequest::Move { toplevel, serial } => {
                let Some(seat) = self.seat() else {
                    return;
                };
                self.request(&toplevel, "move", vec![Argument::Object(seat), Argument::Uint(serial)]);
            }
            ShellRequest::Resize { toplevel, serial, edge } => {
                let Some(seat) = self.seat() else {
                    return;
                };
                self.request(
                    &toplevel,
                    "resize",
                    vec![Argument::Object(seat), Argument::Uint(serial), Argument::Uint(edge as u32)],
                );
            }
            ShellRequest::AckConfigure { xdg_surface, serial } => {
                self.request(&xdg_surface, "ack_configure", vec![Argument::Uint(serial)])
            }
            ShellRequest::Commit { surface_id } => {
                if let Some(surface) = self.host_surface(surface_id) {
                    self.request(&surface, "commit", Vec::new());
                }
            }
            ShellRequest::SetFrame { aura, frame } => {
                self.request(&aura, "set_frame", vec![Argument::Uint(frame as u32)])
            }
            ShellRequest::SetFrameColors { aura, active, inactive } => self.request(
                &aura,
                "set_frame_colors",
                vec![Argument::Uint(active), Argument::Uint(inactive)],
            ),
            ShellRequest::SetStartupId { aura, startup_id } => {
                self.request(&aura, "set_startup_id", vec![opt_str_arg(startup_id.as_deref())])
            }
            ShellRequest::SetApplicationId { aura, app_id } => {
                self.request(&aura, "set_application_id", vec![str_arg(&app_id)])
            }
            ShellRequest::SetAuraParent { aura, parent, x, y } => self.request(
                &aura,
                "set_parent",
                vec![Argument::Object(parent), Argument::Int(x), Argument::Int(y)],
            ),
        }
    }
}

fn window_changes(event: &ConfigureRequestEvent) -> WindowChanges {
    let mask = u16::from(event.value_mask);
    let has = |flag: ConfigWindow| mask & u16::from(flag) != 0;
    WindowChanges {
        x: has(ConfigWindow::X).then_some(event.x.into()),
        y: has(ConfigWindow::Y).then_some(event.y.into()),
        width: has(ConfigWindow::WIDTH).then_some(event.width.into()),
        height: has(ConfigWindow::HEIGHT).then_some(event.height.into()),
        border_width: has(ConfigWindow::BORDER_WIDTH).then_some(event.border_width.into()),
        sibling: has(ConfigWindow::SIBLING).then_some(event.sibling),
        stack_mode: has(ConfigWindow::STACK_MODE).then_some(event.stack_mode),
    }
}

impl Relay {
    /// Takes over the X connection once Xwayland is running
    pub fn attach_x(&mut self, conn: XConnection) {
        let atoms = conn.atoms();
        // The selection window only exists with the clipboard manager enabled
        let clipboard = conn.selection_window.map(|window| Clipboard::new(atoms, window));
        let xwm = Xwm::new(
            atoms,
            conn.root,
            conn.screen_size,
            self.scale.factor(),
            XwmOptions {
                application_id: self.options.application_id.clone(),
                frame_color: self.options.frame_color,
            },
        );
        info!(
            "🪟 Window manager running on a {}x{} root{}",
            conn.screen_size.0,
            conn.screen_size.1,
            if clipboard.is_some() { " with clipboard bridging" } else { "" }
        );
        self.x = Some(XState { conn, xwm, clipboard });
    }

    pub fn x(&self) -> Option<&XState> {
        self.x.as_ref()
    }

    /// Runs `f` with the X state and a shell over the host connection
    pub(super) fn with_xwm<T>(&mut self, f: impl FnOnce(&mut XState, &mut HostShell<'_>) -> T) -> Option<T> {
        let x = self.x.as_mut()?;
        let mut shell = HostShell {
            host: &self.host,
            objects: &mut self.objects,
            surfaces: &self.surfaces,
            internal: &self.internal,
            x_client: self.x_client.as_ref(),
        };
        Some(f(x, &mut shell))
    }

    pub(super) fn shell_event(&mut self, role: Role, msg: &HostMessage, event: &str) {
        match (role, event) {
            (Role::XdgSurface { window }, "configure") => {
                let serial = arg_uint(&msg.args, 0);
                self.with_xwm(|x, shell| x.xwm.xdg_surface_configure(&mut x.conn, shell, window, serial));
            }
            (Role::Toplevel { window }, "configure") => {
                let (width, height) = (arg_int(&msg.args, 0), arg_int(&msg.args, 1));
                let states = arg_array(&msg.args, 2).to_vec();
                self.with_xwm(|x, _| x.xwm.toplevel_configure(window, width, height, &states));
            }
            (Role::Toplevel { window }, "close") => {
                self.with_xwm(|x, _| x.xwm.toplevel_close(&mut x.conn, window));
            }
            (Role::Popup { window }, "popup_done") => {
                debug!("Popup for X window {:#x} dismissed", window);
            }
            _ => {}
        }
    }

    /// Handles every queued X event
    pub fn dispatch_x(&mut self) -> Result<()> {
        loop {
            let Some(x) = self.x.as_ref() else {
                return Ok(());
            };
            let Some(event) = x.conn.poll_event()? else {
                break;
            };
            self.x_event(event);
        }
        self.sync_data_objects();
        Ok(())
    }

    fn x_event(&mut self, event: Event) {
        let last_serial = self.seat.last_serial();
        self.data.serial = last_serial.unwrap_or(0);
        let Some(XState { conn, xwm, clipboard }) = self.x.as_mut() else {
            return;
        };
        let data = &mut self.data;
        let mut shell = HostShell {
            host: &self.host,
            objects: &mut self.objects,
            surfaces: &self.surfaces,
            internal: &self.internal,
            x_client: self.x_client.as_ref(),
        };

        match event {
            Event::CreateNotify(e) => xwm.create_notify(
                conn,
                e.window,
                Rect::new(e.x.into(), e.y.into(), e.width.into(), e.height.into()),
                e.border_width.into(),
            ),
            Event::DestroyNotify(e) => xwm.destroy_notify(conn, &mut shell, e.window),
            Event::ReparentNotify(e) => {
                xwm.reparent_notify(conn, &mut shell, e.window, e.parent, (e.x.into(), e.y.into()))
            }
            Event::MapRequest(e) => xwm.map_request(conn, e.window),
            Event::UnmapNotify(e) => xwm.unmap_notify(conn, &mut shell, e.window, e.response_type & 0x80 != 0),
            Event::ConfigureRequest(e) => xwm.configure_request(
                conn,
                &mut shell,
                ConfigureRequest {
                    window: e.window,
                    changes: window_changes(&e),
                },
            ),
            Event::ConfigureNotify(e) => xwm.configure_notify(
                conn,
                &mut shell,
                e.window,
                Rect::new(e.x.into(), e.y.into(), e.width.into(), e.height.into()),
                e.border_width.into(),
            ),
            Event::ClientMessage(e) => {
                xwm.client_message(conn, &mut shell, e.window, e.type_, e.data.as_data32(), last_serial)
            }
            Event::PropertyNotify(e) => {
                let deleted = e.state == PropertyState::DELETE;
                if let Some(clipboard) = clipboard {
                    clipboard.property_notify(conn, e.window, e.atom, deleted);
                }
                xwm.property_notify(conn, &mut shell, e.window, e.atom, deleted);
            }
            Event::SelectionNotify(e) => {
                if let Some(clipboard) = clipboard {
                    clipboard.selection_notify(conn, data, e.target, e.property);
                }
            }
            Event::SelectionRequest(e) => {
                if let Some(clipboard) = clipboard {
                    clipboard.selection_request(
                        conn,
                        data,
                        SelectionRequest {
                            time: e.time,
                            requestor: e.requestor,
                            selection: e.selection,
                            target: e.target,
                            property: e.property,
                        },
                    );
                }
            }
            Event::XfixesSelectionNotify(e) => {
                if let Some(clipboard) = clipboard {
                    clipboard.xfixes_selection_notify(conn, data, e.selection, e.owner, e.timestamp);
                }
            }
            Event::Error(e) => debug!("X error: {:?}", e),
            _ => {}
        }
    }

    /// Pushes pending focus changes and flushes the X connection
    pub fn flush_x(&mut self) -> Result<()> {
        let Some(x) = self.x.as_mut() else {
            return Ok(());
        };
        x.xwm.flush_focus(&mut x.conn);
        x.conn.flush()
    }
}
