//! The window manager's connection to Xwayland
//!
//! Xwayland hands the window manager a pre-connected socket (`-wm <fd>`).
//! [`XConnection::connect`] performs the startup sequence on it: take over
//! substructure redirection on the root window, redirect rendering of every
//! top-level window, create the WM check window, claim `WM_S0`, and
//! optionally become the clipboard manager.

use super::{Atoms, Geometry, Property, PropertyData, XOps, XRequest};
use crate::error::RelayError;
use crate::geometry::Rect;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::{self, ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ColormapAlloc, ConfigureNotifyEvent,
    ConfigureWindowAux, ConnectionExt as _, CreateWindowAux, EventMask, Gravity, InputFocus,
    PropMode, SelectionNotifyEvent, WindowClass, CONFIGURE_NOTIFY_EVENT, SELECTION_NOTIFY_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::{DefaultStream, RustConnection};
use x11rb::wrapper::ConnectionExt as _;

/// Name advertised through `_NET_SUPPORTING_WM_CHECK`
pub const WM_NAME: &str = "carafe";

/// Minimum XFixes major version for selection notifications
const XFIXES_MAJOR: u32 = 5;

/// An established window manager connection
pub struct XConnection {
    conn: RustConnection,
    atoms: Atoms,
    pub root: u32,
    pub root_depth: u8,
    pub screen_size: (i32, i32),
    black_pixel: u32,
    /// Visual and colormap per depth, used for frame windows
    visuals: HashMap<u8, (u32, u32)>,
    /// Input-only window carrying the WM check properties
    pub wm_window: u32,
    /// Window owning `CLIPBOARD_MANAGER` and receiving converted selections
    pub selection_window: Option<u32>,
}

impl XConnection {
    pub fn connect(stream: UnixStream, clipboard_manager: bool) -> Result<Self> {
        let (stream, _) = DefaultStream::from_unix_stream(stream).context("wrapping the window manager socket")?;
        let conn = RustConnection::connect_to_stream(stream, 0).context("X connection setup")?;
        let atoms_cookie = Atoms::new(&conn)?;

        let screen = conn
            .setup()
            .roots
            .first()
            .cloned()
            .ok_or_else(|| RelayError::X11("server reported no screens".into()))?;
        let root = screen.root;

        let redirect_root = conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::STRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_REDIRECT,
            ),
        )?;

        if conn.extension_information(xfixes::X11_EXTENSION_NAME)?.is_none() {
            return Err(RelayError::X11("XFixes extension missing".into()).into());
        }
        let xfixes_version = conn.xfixes_query_version(XFIXES_MAJOR, 0)?.reply()?;
        if xfixes_version.major_version < XFIXES_MAJOR {
            return Err(RelayError::X11(format!(
                "XFixes {}.{} is too old",
                xfixes_version.major_version, xfixes_version.minor_version
            ))
            .into());
        }
        if conn.extension_information(composite::X11_EXTENSION_NAME)?.is_none() {
            return Err(RelayError::X11("Composite extension missing".into()).into());
        }
        let redirect_windows = conn.composite_redirect_subwindows(root, composite::Redirect::MANUAL)?;

        redirect_root
            .check()
            .map_err(|_| RelayError::X11("another window manager is running".into()))?;
        redirect_windows.check().context("redirecting top-level windows")?;

        let wm_window = conn.generate_id()?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            wm_window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;

        let atoms = atoms_cookie.reply()?;

        let mut visuals = HashMap::new();
        for depth in &screen.allowed_depths {
            if depth.depth == screen.root_depth {
                visuals.insert(depth.depth, (screen.root_visual, screen.default_colormap));
            } else if let Some(visual) = depth.visuals.first() {
                let colormap = conn.generate_id()?;
                conn.create_colormap(ColormapAlloc::NONE, colormap, root, visual.visual_id)?;
                visuals.insert(depth.depth, (visual.visual_id, colormap));
            }
        }

        let selection_window = if clipboard_manager {
            let window = conn.generate_id()?;
            conn.create_window(
                x11rb::COPY_DEPTH_FROM_PARENT,
                window,
                root,
                0,
                0,
                1,
                1,
                0,
                WindowClass::INPUT_OUTPUT,
                screen.root_visual,
                &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )?;
            conn.set_selection_owner(window, atoms.CLIPBOARD_MANAGER, x11rb::CURRENT_TIME)?;
            conn.xfixes_select_selection_input(
                window,
                atoms.CLIPBOARD,
                SelectionEventMask::SET_SELECTION_OWNER
                    | SelectionEventMask::SELECTION_WINDOW_DESTROY
                    | SelectionEventMask::SELECTION_CLIENT_CLOSE,
            )?;
            Some(window)
        } else {
            None
        };

        conn.change_property32(
            PropMode::REPLACE,
            wm_window,
            atoms._NET_SUPPORTING_WM_CHECK,
            AtomEnum::WINDOW,
            &[wm_window],
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            wm_window,
            atoms._NET_WM_NAME,
            atoms.UTF8_STRING,
            WM_NAME.as_bytes(),
        )?;
        conn.change_property32(
            PropMode::REPLACE,
            root,
            atoms._NET_SUPPORTING_WM_CHECK,
            AtomEnum::WINDOW,
            &[wm_window],
        )?;
        conn.set_selection_owner(wm_window, atoms.WM_S0, x11rb::CURRENT_TIME)?;
        conn.set_input_focus(InputFocus::NONE, x11rb::NONE, x11rb::CURRENT_TIME)?;
        conn.flush()?;

        info!(
            "🧩 Window manager connected: root {:#x}, {}x{}, depth {}, clipboard manager: {}",
            root, screen.width_in_pixels, screen.height_in_pixels, screen.root_depth, clipboard_manager
        );

        Ok(Self {
            conn,
            atoms,
            root,
            root_depth: screen.root_depth,
            screen_size: (screen.width_in_pixels as i32, screen.height_in_pixels as i32),
            black_pixel: screen.black_pixel,
            visuals,
            wm_window,
            selection_window,
        })
    }

    pub fn atoms(&self) -> Atoms {
        self.atoms
    }

    /// A duplicate of the socket for readiness polling
    pub fn poll_fd(&self) -> Result<OwnedFd> {
        Ok(self.conn.stream().as_fd().try_clone_to_owned()?)
    }

    /// Next queued event, without blocking
    pub fn poll_event(&self) -> Result<Option<Event>> {
        Ok(self.conn.poll_for_event()?)
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    fn execute(&self, request: XRequest) -> Result<()> {
        let conn = &self.conn;
        match request {
            XRequest::Configure { window, changes } => {
                let aux = ConfigureWindowAux::new()
                    .x(changes.x)
                    .y(changes.y)
                    .width(changes.width)
                    .height(changes.height)
                    .border_width(changes.border_width)
                    .sibling(changes.sibling)
                    .stack_mode(changes.stack_mode);
                conn.configure_window(window, &aux)?;
            }
            XRequest::SendConfigureNotify {
                window,
                geometry,
                border_width,
            } => {
                let event = ConfigureNotifyEvent {
                    response_type: CONFIGURE_NOTIFY_EVENT,
                    sequence: 0,
                    event: window,
                    window,
                    above_sibling: x11rb::NONE,
                    x: geometry.x as i16,
                    y: geometry.y as i16,
                    width: geometry.width as u16,
                    height: geometry.height as u16,
                    border_width: border_width as u16,
                    override_redirect: false,
                };
                conn.send_event(false, window, EventMask::STRUCTURE_NOTIFY, event)?;
            }
            XRequest::ChangeProperty {
                window,
                property,
                type_,
                data,
            } => match data {
                PropertyData::Bytes(bytes) => {
                    conn.change_property8(PropMode::REPLACE, window, property, type_, &bytes)?;
                }
                PropertyData::Words(words) => {
                    conn.change_property32(PropMode::REPLACE, window, property, type_, &words)?;
                }
            },
            XRequest::DeleteProperty { window, property } => {
                conn.delete_property(window, property)?;
            }
            XRequest::SendClientMessage {
                window,
                type_,
                data,
                mask,
            } => {
                let event = ClientMessageEvent::new(32, window, type_, data);
                conn.send_event(false, window, mask, event)?;
            }
            XRequest::SetInputFocus(window) => {
                conn.set_input_focus(InputFocus::NONE, window.unwrap_or(x11rb::NONE), x11rb::CURRENT_TIME)?;
            }
            XRequest::SelectInput { window, mask } => {
                conn.change_window_attributes(window, &ChangeWindowAttributesAux::new().event_mask(mask))?;
            }
            XRequest::SetNorthWestGravity(window) => {
                conn.change_window_attributes(
                    window,
                    &ChangeWindowAttributesAux::new().win_gravity(Gravity::NORTH_WEST),
                )?;
            }
            XRequest::CreateFrame { frame, depth, geometry } => {
                let depth = if depth == 0 { self.root_depth } else { depth };
                let (visual, colormap) = self
                    .visuals
                    .get(&depth)
                    .or_else(|| self.visuals.get(&self.root_depth))
                    .copied()
                    .ok_or_else(|| RelayError::X11(format!("no visual for depth {}", depth)))?;
                conn.create_window(
                    depth,
                    frame,
                    self.root,
                    geometry.x as i16,
                    geometry.y as i16,
                    geometry.width.max(1) as u16,
                    geometry.height.max(1) as u16,
                    0,
                    WindowClass::INPUT_OUTPUT,
                    visual,
                    &CreateWindowAux::new()
                        .border_pixel(self.black_pixel)
                        .event_mask(EventMask::SUBSTRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_REDIRECT)
                        .colormap(colormap),
                )?;
            }
            XRequest::MapWindow(window) => {
                conn.map_window(window)?;
            }
            XRequest::ReparentWindow { window, parent, x, y } => {
                conn.reparent_window(window, parent, x as i16, y as i16)?;
            }
            XRequest::DestroyWindow(window) => {
                conn.destroy_window(window)?;
            }
            XRequest::ConvertSelection {
                requestor,
                selection,
                target,
                property,
                time,
            } => {
                conn.convert_selection(requestor, selection, target, property, time)?;
            }
            XRequest::SendSelectionNotify {
                requestor,
                selection,
                target,
                property,
                time,
            } => {
                let event = SelectionNotifyEvent {
                    response_type: SELECTION_NOTIFY_EVENT,
                    sequence: 0,
                    time,
                    requestor,
                    selection,
                    target,
                    property,
                };
                conn.send_event(false, requestor, EventMask::NO_EVENT, event)?;
            }
            XRequest::SetSelectionOwner { owner, selection, time } => {
                conn.set_selection_owner(owner, selection, time)?;
            }
        }
        Ok(())
    }
}

impl XOps for XConnection {
    fn generate_id(&mut self) -> Option<u32> {
        match self.conn.generate_id() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("X id allocation failed: {}", e);
                None
            }
        }
    }

    fn send(&mut self, request: XRequest) {
        debug!("X ← {:?}", request);
        if let Err(e) = self.execute(request) {
            warn!("X request failed: {:#}", e);
        }
    }

    fn geometry(&mut self, window: u32) -> Option<Geometry> {
        let reply = self.conn.get_geometry(window).ok()?.reply().ok()?;
        Some(Geometry {
            rect: Rect::new(reply.x as i32, reply.y as i32, reply.width as i32, reply.height as i32),
            border_width: reply.border_width as u32,
            depth: reply.depth,
        })
    }

    fn property(&mut self, window: u32, property: u32, delete: bool, long_length: u32) -> Option<Property> {
        let reply = self
            .conn
            .get_property(delete, window, property, AtomEnum::ANY, 0, long_length)
            .ok()?
            .reply()
            .ok()?;
        if reply.type_ == u32::from(AtomEnum::NONE) {
            return None;
        }
        Some(Property {
            type_: reply.type_,
            format: reply.format,
            value: reply.value,
            bytes_after: reply.bytes_after,
        })
    }

    fn is_ours(&self, window: u32) -> bool {
        let setup = self.conn.setup();
        (window & !setup.resource_id_mask) == setup.resource_id_base
    }
}
