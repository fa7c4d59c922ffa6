//! Embedded X11 window manager
//!
//! Xwayland runs rootless: every top-level X window is shown on the host as
//! its own shell surface. The window manager keeps the [`Window`] table in
//! step with the X event stream and with host shell events, and owns the
//! configure/ack handshake between the two.
//!
//! Handlers here are free of I/O. X side effects go through [`XOps`] and host
//! side effects through [`Shell`], which lets the whole state machine run
//! against fakes in tests. [`x11::XConnection`] is the real X side.

pub mod atoms;
pub mod hints;
pub mod requests;
pub mod x11;

#[cfg(test)]
mod tests;

use crate::geometry::Rect;
use crate::window::{
    decode_states, ResizeEdge, Shell, ShellRequest, Positioner, Window, WmState, P_MAX_SIZE,
    P_MIN_SIZE, US_POSITION, P_POSITION,
};
use log::{debug, info, warn};
use x11rb::protocol::xproto::{AtomEnum, EventMask, StackMode};

pub use atoms::Atoms;
pub use requests::{Geometry, Property, PropertyData, WindowChanges, XOps, XRequest};

/// `WM_STATE` values
pub const WM_STATE_WITHDRAWN: u32 = 0;
pub const WM_STATE_NORMAL: u32 = 1;

/// `_NET_WM_STATE` client message actions
pub const NET_WM_STATE_REMOVE: u32 = 0;
pub const NET_WM_STATE_ADD: u32 = 1;

/// `_NET_WM_MOVERESIZE` direction for a keyboard-less move
pub const NET_WM_MOVERESIZE_MOVE: u32 = 8;

/// Upper bound, in 32-bit units, for property reads
const PROPERTY_LENGTH: u32 = 2048;

/// Window manager settings
#[derive(Debug, Clone, Default)]
pub struct XwmOptions {
    /// Overrides every derived application id
    pub application_id: Option<String>,
    /// Aura frame color for active and inactive frames
    pub frame_color: Option<u32>,
}

/// A `ConfigureRequest` from a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub window: u32,
    pub changes: WindowChanges,
}

/// Window table and focus state
pub struct Xwm<R> {
    pub atoms: Atoms,
    pub root: u32,
    /// Root window size in pixels
    pub screen: (i32, i32),
    /// Guest-to-host coordinate factor
    pub scale: f64,
    options: XwmOptions,
    windows: Vec<Window<R>>,
    host_focus: Option<u32>,
    needs_set_input_focus: bool,
}

impl<R: Clone + PartialEq + std::fmt::Debug> Xwm<R> {
    pub fn new(atoms: Atoms, root: u32, screen: (i32, i32), scale: f64, options: XwmOptions) -> Self {
        info!("🪟 Window manager on root {:#x} ({}x{})", root, screen.0, screen.1);
        Self {
            atoms,
            root,
            screen,
            scale,
            options,
            windows: Vec::new(),
            host_focus: None,
            needs_set_input_focus: false,
        }
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window<R>> {
        self.windows.iter()
    }

    /// Finds a window by its id or its frame's id
    pub fn window(&self, id: u32) -> Option<&Window<R>> {
        self.windows.iter().find(|w| w.is(id))
    }

    pub fn window_mut(&mut self, id: u32) -> Option<&mut Window<R>> {
        self.windows.iter_mut().find(|w| w.is(id))
    }

    fn index(&self, id: u32) -> Option<usize> {
        self.windows.iter().position(|w| w.is(id))
    }

    /// The paired window displayed on a relayed surface
    pub fn window_for_surface(&self, surface_id: u32) -> Option<&Window<R>> {
        self.windows
            .iter()
            .find(|w| !w.unpaired && w.surface_id == surface_id)
    }

    pub fn host_focus(&self) -> Option<u32> {
        self.host_focus
    }

    fn create_window(&mut self, x: &mut impl XOps, id: u32, geometry: Rect, border_width: u32) {
        debug!("New X window {:#x} at {:?}", id, geometry);
        self.windows.push(Window::new(id, geometry, border_width));
        x.send(XRequest::SelectInput {
            window: id,
            mask: EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE,
        });
    }

    fn destroy_window<S: Shell<Ref = R>>(&mut self, x: &mut impl XOps, shell: &mut S, index: usize) {
        let mut window = self.windows.remove(index);
        debug!("Forgetting X window {:#x}", window.id);
        if let Some(frame) = window.frame_id {
            x.send(XRequest::DestroyWindow(frame));
        }
        if self.host_focus == Some(window.id) {
            self.host_focus = None;
            self.needs_set_input_focus = true;
        }
        for object in window.shell.take_all() {
            shell.send(ShellRequest::Destroy(object));
        }
    }

    fn set_wm_state(&self, x: &mut impl XOps, window: u32, state: u32) {
        x.send(XRequest::ChangeProperty {
            window,
            property: self.atoms.WM_STATE,
            type_: self.atoms.WM_STATE,
            data: PropertyData::Words(vec![state, 0]),
        });
    }

    fn send_configure_notify(x: &mut impl XOps, window: &Window<R>) {
        x.send(XRequest::SendConfigureNotify {
            window: window.id,
            geometry: window.geometry(),
            border_width: window.border_width,
        });
    }

    /// Applies the window's `next` configuration and makes it pending
    fn configure_window(&mut self, x: &mut impl XOps, index: usize) {
        let atoms = self.atoms;
        let window = &mut self.windows[index];
        debug_assert_eq!(window.pending.serial, 0);

        let has_geometry = window.next.has_geometry();
        if has_geometry {
            if let Some(frame) = window.frame_id {
                let next = &window.next;
                x.send(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges {
                        x: next.position.map(|p| p.0),
                        y: next.position.map(|p| p.1),
                        width: next.size.map(|s| s.0.max(1) as u32),
                        height: next.size.map(|s| s.1.max(1) as u32),
                        border_width: next.border_width,
                        ..Default::default()
                    },
                });
            }
        }

        let moved = window.promote_next();
        if has_geometry {
            // Origin within the frame, whatever the client's gravity
            x.send(XRequest::Configure {
                window: window.id,
                changes: WindowChanges {
                    x: Some(0),
                    y: Some(0),
                    width: Some(window.width.max(1) as u32),
                    height: Some(window.height.max(1) as u32),
                    border_width: Some(window.border_width),
                    ..Default::default()
                },
            });
            if moved {
                Self::send_configure_notify(x, window);
            }
        }

        if window.managed {
            let states = window
                .pending
                .states
                .iter()
                .map(|s| state_atom(&atoms, *s))
                .collect();
            x.send(XRequest::ChangeProperty {
                window: window.id,
                property: atoms._NET_WM_STATE,
                type_: AtomEnum::ATOM.into(),
                data: PropertyData::Words(states),
            });
        }
    }

    /// Acks the pending configure once the client has caught up with it
    fn process_pending_configure_acks<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        index: usize,
        contents: Option<(u32, u32)>,
    ) -> bool {
        let window = &mut self.windows[index];
        if !window.pending_satisfied(contents) {
            return false;
        }
        if let Some(xdg_surface) = window.shell.xdg_surface.clone() {
            shell.send(ShellRequest::AckConfigure {
                xdg_surface,
                serial: window.pending.serial,
            });
        }
        window.pending.clear();
        if window.next.serial != 0 {
            self.configure_window(x, index);
        }
        true
    }

    /// A paired surface got new contents attached
    pub fn surface_attached<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        surface_id: u32,
        contents: (u32, u32),
    ) {
        let Some(index) = self
            .windows
            .iter()
            .position(|w| !w.unpaired && w.surface_id == surface_id)
        else {
            return;
        };
        while self.process_pending_configure_acks(x, shell, index, Some(contents)) {}
    }

    /// Whether a commit on a role-less paired surface may reach the host.
    ///
    /// Commits are held back until the window has a shell surface; a commit
    /// with contents realizes the window.
    pub fn surface_committed(&mut self, surface_id: u32, has_contents: bool) -> bool {
        let Some(window) = self
            .windows
            .iter_mut()
            .find(|w| !w.unpaired && w.surface_id == surface_id)
        else {
            return false;
        };
        if window.shell.xdg_surface.is_none() {
            return false;
        }
        if has_contents {
            window.realized = true;
        }
        true
    }

    /// A relayed surface was destroyed
    pub fn surface_destroyed<S: Shell<Ref = R>>(&mut self, x: &mut impl XOps, shell: &mut S, surface_id: u32) {
        let ids: Vec<u32> = self
            .windows
            .iter()
            .filter(|w| w.surface_id == surface_id)
            .map(|w| w.id)
            .collect();
        for id in ids {
            if let Some(index) = self.index(id) {
                self.windows[index].surface_id = 0;
                self.window_update(x, shell, index);
            }
        }
    }

    /// Host `xdg_surface.configure`
    pub fn xdg_surface_configure<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        serial: u32,
    ) {
        let Some(index) = self.index(window) else {
            return;
        };
        self.windows[index].next.serial = serial;
        if self.windows[index].pending.serial != 0 {
            return;
        }
        let surface_id = self.windows[index].surface_id;
        let surface = shell.surface(surface_id);
        self.configure_window(x, index);
        let acked = self.process_pending_configure_acks(x, shell, index, surface.map(|s| s.contents));
        if acked && surface.is_some_and(|s| s.has_contents()) {
            shell.send(ShellRequest::Commit { surface_id });
        }
    }

    /// Host `xdg_toplevel.configure`; only managed windows follow the host
    pub fn toplevel_configure(&mut self, window: u32, width: i32, height: i32, states: &[u8]) {
        let (scale, screen) = (self.scale, self.screen);
        let Some(w) = self.window_mut(window) else {
            return;
        };
        if !w.managed {
            return;
        }
        let id = w.id;
        if let Some(activated) = w.apply_toplevel_configure(width, height, &decode_states(states), scale, screen) {
            if activated != (self.host_focus == Some(id)) {
                self.host_focus = activated.then_some(id);
                self.needs_set_input_focus = true;
            }
        }
    }

    /// Host `xdg_toplevel.close`
    pub fn toplevel_close(&self, x: &mut impl XOps, window: u32) {
        x.send(XRequest::SendClientMessage {
            window,
            type_: self.atoms.WM_PROTOCOLS,
            data: [self.atoms.WM_DELETE_WINDOW, 0, 0, 0, 0],
            mask: EventMask::NO_EVENT,
        });
    }

    /// Applies a focus change requested by the host, once per loop iteration
    pub fn flush_focus(&mut self, x: &mut impl XOps) {
        if !self.needs_set_input_focus {
            return;
        }
        self.needs_set_input_focus = false;
        match self.host_focus.and_then(|id| self.window(id)) {
            Some(window) => {
                if !window.managed {
                    return;
                }
                x.send(XRequest::SendClientMessage {
                    window: window.id,
                    type_: self.atoms.WM_PROTOCOLS,
                    data: [self.atoms.WM_TAKE_FOCUS, 0, 0, 0, 0],
                    mask: EventMask::SUBSTRUCTURE_REDIRECT,
                });
                x.send(XRequest::SetInputFocus(Some(window.id)));
            }
            None => x.send(XRequest::SetInputFocus(None)),
        }
    }

    /// Raises the frame showing `focus_surface_id` and lowers the others
    pub fn restack(&self, x: &mut impl XOps, focus_surface_id: u32) {
        for window in self.windows.iter().filter(|w| w.managed && !w.unpaired) {
            let Some(frame) = window.frame_id else {
                continue;
            };
            let mode = if window.surface_id == focus_surface_id {
                StackMode::ABOVE
            } else {
                StackMode::BELOW
            };
            x.send(XRequest::Configure {
                window: frame,
                changes: WindowChanges::stack(mode),
            });
        }
    }

    /// Rebuilds the host shell objects of a window after a pairing or
    /// placement change
    fn window_update<S: Shell<Ref = R>>(&mut self, x: &mut impl XOps, shell: &mut S, index: usize) {
        let surface = {
            let window = &mut self.windows[index];
            let surface = if window.surface_id != 0 {
                shell.surface(window.surface_id)
            } else {
                None
            };
            if surface.is_some() {
                window.unpaired = false;
            } else if window.surface_id == 0 {
                window.unpaired = true;
            }
            surface
        };

        let Some(surface) = surface else {
            let window = &mut self.windows[index];
            for object in window.shell.take_all() {
                shell.send(ShellRequest::Destroy(object));
            }
            window.realized = false;
            return;
        };

        let parent = self.find_parent(shell, index);
        let scale = self.scale;
        let has_aura = shell.has_aura();
        let (frame_color, forced_app_id) = (self.options.frame_color, self.options.application_id.clone());

        let window = &mut self.windows[index];
        if window.depth == 0 {
            if let Some(geometry) = x.geometry(window.id) {
                window.depth = geometry.depth;
            }
        }

        if window.shell.xdg_surface.is_none() {
            window.shell.xdg_surface = shell.get_xdg_surface(window.id, window.surface_id);
        }
        let Some(xdg_surface) = window.shell.xdg_surface.clone() else {
            warn!("No xdg_surface for X window {:#x}", window.id);
            return;
        };

        if has_aura {
            if window.shell.aura.is_none() {
                window.shell.aura = shell.get_aura_surface(window.surface_id);
            }
            if let Some(aura) = window.shell.aura.clone() {
                shell.send(ShellRequest::SetFrame {
                    aura: aura.clone(),
                    frame: window.frame_type(),
                });
                if let Some(color) = frame_color {
                    shell.send(ShellRequest::SetFrameColors {
                        aura: aura.clone(),
                        active: color,
                        inactive: color,
                    });
                }
                shell.send(ShellRequest::SetStartupId {
                    aura: aura.clone(),
                    startup_id: window.startup_id.clone(),
                });
                shell.send(ShellRequest::SetApplicationId {
                    aura,
                    app_id: window.application_id(forced_app_id.as_deref()),
                });
            }
        }

        let parent_info = parent.map(|p| {
            let p = &self.windows[p];
            (p.x, p.y, p.shell.toplevel.clone(), p.shell.xdg_surface.clone(), p.shell.aura.clone())
        });
        let window = &mut self.windows[index];

        if window.managed || parent_info.is_none() {
            if window.shell.toplevel.is_none() {
                window.shell.toplevel = shell.get_toplevel(window.id, &xdg_surface);
            }
            if let Some(toplevel) = window.shell.toplevel.clone() {
                if let Some((_, _, Some(parent), _, _)) = &parent_info {
                    shell.send(ShellRequest::SetParent {
                        toplevel: toplevel.clone(),
                        parent: Some(parent.clone()),
                    });
                }
                if let Some(name) = &window.name {
                    shell.send(ShellRequest::SetTitle {
                        toplevel: toplevel.clone(),
                        title: name.clone(),
                    });
                }
                let ((min_w, min_h), (max_w, max_h)) = window.size_limits(scale);
                if window.size_flags & P_MIN_SIZE != 0 {
                    shell.send(ShellRequest::SetMinSize {
                        toplevel: toplevel.clone(),
                        width: min_w,
                        height: min_h,
                    });
                }
                if window.size_flags & P_MAX_SIZE != 0 {
                    shell.send(ShellRequest::SetMaxSize {
                        toplevel,
                        width: max_w,
                        height: max_h,
                    });
                }
            }
        } else if window.shell.popup.is_none() {
            if let Some((px, py, _, Some(parent_xdg), _)) = &parent_info {
                let positioner = Positioner {
                    anchor_rect: Rect::new(
                        ((window.x - px) as f64 / scale) as i32,
                        ((window.y - py) as f64 / scale) as i32,
                        1,
                        1,
                    ),
                    size: (
                        ((window.width as f64 / scale) as i32).max(1),
                        ((window.height as f64 / scale) as i32).max(1),
                    ),
                };
                window.shell.popup = shell.get_popup(window.id, &xdg_surface, parent_xdg, positioner);
            }
        }

        if window.size_flags & (US_POSITION | P_POSITION) != 0 && has_aura {
            if let (Some(aura), Some((px, py, _, _, Some(parent_aura)))) = (window.shell.aura.clone(), &parent_info) {
                shell.send(ShellRequest::SetAuraParent {
                    aura,
                    parent: parent_aura.clone(),
                    x: ((window.x - px) as f64 / scale) as i32,
                    y: ((window.y - py) as f64 / scale) as i32,
                });
            }
        }

        shell.send(ShellRequest::Commit {
            surface_id: window.surface_id,
        });
        if surface.has_contents() {
            window.realized = true;
        }
    }

    /// Parent for a window's shell surface.
    ///
    /// Managed windows use `WM_TRANSIENT_FOR` when that window has a
    /// toplevel. Unmanaged windows take the realized window that most
    /// recently received input.
    fn find_parent<S: Shell<Ref = R>>(&self, shell: &S, index: usize) -> Option<usize> {
        let window = &self.windows[index];
        if window.managed {
            let transient_for = window.transient_for?;
            let sibling = self
                .windows
                .iter()
                .position(|w| !w.unpaired && w.id == transient_for)?;
            return self.windows[sibling].shell.toplevel.is_some().then_some(sibling);
        }

        let mut parent = None;
        let mut last_serial = 0;
        for (i, sibling) in self.windows.iter().enumerate() {
            if i == index || sibling.unpaired || !sibling.realized {
                continue;
            }
            let Some(info) = shell.surface(sibling.surface_id) else {
                continue;
            };
            if last_serial > info.last_event_serial {
                continue;
            }
            parent = Some(i);
            last_serial = info.last_event_serial;
        }
        parent
    }

    pub fn create_notify(&mut self, x: &mut impl XOps, window: u32, geometry: Rect, border_width: u32) {
        if x.is_ours(window) {
            return;
        }
        self.create_window(x, window, geometry, border_width);
    }

    pub fn destroy_notify<S: Shell<Ref = R>>(&mut self, x: &mut impl XOps, shell: &mut S, window: u32) {
        if x.is_ours(window) {
            return;
        }
        if let Some(index) = self.index(window) {
            self.destroy_window(x, shell, index);
        }
    }

    pub fn reparent_notify<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        parent: u32,
        position: (i32, i32),
    ) {
        if parent == self.root {
            // Unmapped windows we reparent back to root are still tracked
            if self.index(window).is_some() {
                return;
            }
            let (size, border_width) = x
                .geometry(window)
                .map(|g| ((g.rect.width, g.rect.height), g.border_width))
                .unwrap_or(((1, 1), 0));
            self.create_window(
                x,
                window,
                Rect::new(position.0, position.1, size.0, size.1),
                border_width,
            );
            return;
        }
        if x.is_ours(parent) {
            return;
        }
        if let Some(index) = self.index(window) {
            self.destroy_window(x, shell, index);
        }
    }

    pub fn map_request(&mut self, x: &mut impl XOps, window: u32) {
        let Some(index) = self.index(window) else {
            return;
        };
        let atoms = self.atoms;
        let screen = self.screen;

        let w = &mut self.windows[index];
        w.managed = true;
        if w.frame_id.is_none() {
            if let Some(geometry) = x.geometry(w.id) {
                w.x = geometry.rect.x;
                w.y = geometry.rect.y;
                w.width = geometry.rect.width;
                w.height = geometry.rect.height;
                w.depth = geometry.depth;
            }
        }

        w.reset_properties();
        let id = w.id;
        let mut fetch = |atom: u32| x.property(id, atom, false, PROPERTY_LENGTH);

        if let Some(name) = fetch(AtomEnum::WM_NAME.into()) {
            w.name = Some(hints::text(&name));
        }
        if let Some(class) = fetch(AtomEnum::WM_CLASS.into()) {
            w.class = hints::wm_class(&class);
        }
        if let Some(transient_for) = fetch(AtomEnum::WM_TRANSIENT_FOR.into()) {
            w.transient_for = hints::window(&transient_for);
        }
        let size_hints = fetch(AtomEnum::WM_NORMAL_HINTS.into())
            .and_then(|p| hints::SizeHints::parse(&p))
            .unwrap_or_default();
        if let Some(leader) = fetch(atoms.WM_CLIENT_LEADER) {
            w.client_leader = hints::window(&leader);
        }
        if let Some(decorated) = fetch(atoms._MOTIF_WM_HINTS)
            .and_then(|p| hints::MotifHints::parse(&p))
            .and_then(|m| m.decorated())
        {
            w.decorated = decorated;
        }
        if let Some(startup_id) = fetch(atoms._NET_STARTUP_ID) {
            w.startup_id = Some(hints::text(&startup_id));
        }

        // Transients may keep the position the client asked for
        if w.transient_for.is_some() {
            w.size_flags |= size_hints.flags & (US_POSITION | P_POSITION);
        }

        if w.startup_id.is_none() {
            if let Some(leader) = w.client_leader {
                if let Some(startup_id) = x.property(leader, atoms._NET_STARTUP_ID, false, PROPERTY_LENGTH) {
                    w.startup_id = Some(hints::text(&startup_id));
                }
            }
        }

        w.size_flags |= size_hints.flags & (P_MIN_SIZE | P_MAX_SIZE);
        if w.size_flags & P_MIN_SIZE != 0 {
            w.min_size = size_hints.min_size;
        }
        if w.size_flags & P_MAX_SIZE != 0 {
            w.max_size = size_hints.max_size;
        }

        w.border_width = 0;
        w.clamp_to_screen(screen);
        if !w.is_positioned() {
            w.center_on_screen(screen);
        }
        info!(
            "📐 Managing X window {:#x} {:?} ({}x{}+{}+{}, decorated: {})",
            w.id, w.name, w.width, w.height, w.x, w.y, w.decorated
        );

        x.send(XRequest::Configure {
            window: w.id,
            changes: WindowChanges {
                width: Some(w.width.max(1) as u32),
                height: Some(w.height.max(1) as u32),
                border_width: Some(0),
                ..Default::default()
            },
        });
        // Frame extents seen by clients always match the X frame, whatever the host draws
        x.send(XRequest::ChangeProperty {
            window: w.id,
            property: atoms._NET_FRAME_EXTENTS,
            type_: AtomEnum::CARDINAL.into(),
            data: PropertyData::Words(vec![0, 0, 0, 0]),
        });
        x.send(XRequest::SetNorthWestGravity(w.id));

        match w.frame_id {
            None => {
                let Some(frame) = x.generate_id() else {
                    warn!("Out of X ids, cannot frame {:#x}", w.id);
                    return;
                };
                w.frame_id = Some(frame);
                x.send(XRequest::CreateFrame {
                    frame,
                    depth: w.depth,
                    geometry: w.geometry(),
                });
                x.send(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges::stack(StackMode::BELOW),
                });
                x.send(XRequest::ReparentWindow {
                    window: w.id,
                    parent: frame,
                    x: 0,
                    y: 0,
                });
            }
            Some(frame) => {
                let mut changes = WindowChanges::geometry(w.geometry());
                changes.stack_mode = Some(StackMode::BELOW);
                x.send(XRequest::Configure {
                    window: frame,
                    changes,
                });
            }
        }

        let (id, frame) = (w.id, w.frame_id);
        self.set_wm_state(x, id, WM_STATE_NORMAL);
        Self::send_configure_notify(x, &self.windows[index]);
        x.send(XRequest::MapWindow(id));
        if let Some(frame) = frame {
            x.send(XRequest::MapWindow(frame));
        }
    }

    pub fn unmap_notify<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        synthetic: bool,
    ) {
        if x.is_ours(window) || synthetic {
            return;
        }
        let Some(index) = self.index(window) else {
            return;
        };
        let id = self.windows[index].id;
        if self.host_focus == Some(id) {
            self.host_focus = None;
            self.needs_set_input_focus = true;
        }
        if self.windows[index].surface_id != 0 {
            self.windows[index].surface_id = 0;
            self.window_update(x, shell, index);
        }
        self.set_wm_state(x, id, WM_STATE_WITHDRAWN);

        let w = &mut self.windows[index];
        if let Some(frame) = w.frame_id.take() {
            x.send(XRequest::ReparentWindow {
                window: w.id,
                parent: self.root,
                x: w.x,
                y: w.y,
            });
            x.send(XRequest::DestroyWindow(frame));
        }
        // Ready to come back as an override-redirect window
        w.unmanage();
    }

    pub fn configure_request<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        request: ConfigureRequest,
    ) {
        let Some(index) = self.index(request.window) else {
            return;
        };
        let screen = self.screen;
        let w = &mut self.windows[index];
        if !w.managed {
            x.send(XRequest::Configure {
                window: w.id,
                changes: request.changes,
            });
            return;
        }

        // Granting the request means matching contents may never arrive
        if w.shell.toplevel.is_some() {
            if let Some(xdg_surface) = w.shell.xdg_surface.clone() {
                for serial in [w.pending.serial, w.next.serial] {
                    if serial != 0 {
                        shell.send(ShellRequest::AckConfigure {
                            xdg_surface: xdg_surface.clone(),
                            serial,
                        });
                    }
                }
            }
            w.pending.clear();
            w.next.clear();
        }

        let (old_width, old_height) = (w.width, w.height);
        let changes = request.changes;
        if let Some(nx) = changes.x {
            w.x = nx;
        }
        if let Some(ny) = changes.y {
            w.y = ny;
        }
        if w.allow_resize {
            if let Some(width) = changes.width {
                w.width = width as i32;
            }
            if let Some(height) = changes.height {
                w.height = height as i32;
            }
        }

        w.clamp_to_screen(screen);
        if w.is_positioned() {
            self.window_update(x, shell, index);
        } else {
            self.windows[index].center_on_screen(screen);
        }

        let w = &mut self.windows[index];
        if let Some(frame) = w.frame_id {
            x.send(XRequest::Configure {
                window: frame,
                changes: WindowChanges::geometry(w.geometry()),
            });
        }

        // Moves and no-op requests still need a synthetic notify
        if old_width != w.width || old_height != w.height || w.border_width != 0 {
            x.send(XRequest::Configure {
                window: w.id,
                changes: WindowChanges {
                    width: Some(w.width.max(1) as u32),
                    height: Some(w.height.max(1) as u32),
                    border_width: Some(0),
                    ..Default::default()
                },
            });
            w.border_width = 0;
        } else {
            Self::send_configure_notify(x, w);
        }
    }

    pub fn configure_notify<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        geometry: Rect,
        border_width: u32,
    ) {
        if x.is_ours(window) {
            return;
        }

        if window == self.root {
            let size = (geometry.width, geometry.height);
            if size == self.screen {
                return;
            }
            info!("🖥️ Root resized to {}x{}", size.0, size.1);
            self.screen = size;
            for w in self.windows.iter_mut().filter(|w| !w.unpaired) {
                if w.is_positioned() {
                    continue;
                }
                let old = (w.x, w.y);
                w.center_on_screen(size);
                if (w.x, w.y) == old {
                    continue;
                }
                if let Some(frame) = w.frame_id {
                    x.send(XRequest::Configure {
                        window: frame,
                        changes: WindowChanges {
                            x: Some(w.x),
                            y: Some(w.y),
                            ..Default::default()
                        },
                    });
                }
                Self::send_configure_notify(x, w);
            }
            return;
        }

        let Some(index) = self.index(window) else {
            return;
        };
        let w = &mut self.windows[index];
        if w.managed {
            return;
        }
        w.width = geometry.width;
        w.height = geometry.height;
        w.border_width = border_width;
        if (geometry.x, geometry.y) != (w.x, w.y) {
            w.x = geometry.x;
            w.y = geometry.y;
            self.window_update(x, shell, index);
        }
    }

    /// `last_serial` is the default seat's latest input serial, `None`
    /// without a seat
    pub fn client_message<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        type_: u32,
        data: [u32; 5],
        last_serial: Option<u32>,
    ) {
        if type_ == self.atoms.WL_SURFACE_ID {
            let Some(index) = self.windows.iter().position(|w| w.unpaired && w.is(window)) else {
                return;
            };
            debug!("X window {:#x} paired with surface {}", window, data[0]);
            self.windows[index].surface_id = data[0];
            self.window_update(x, shell, index);
        } else if type_ == self.atoms._NET_WM_MOVERESIZE {
            let Some(toplevel) = self.window(window).and_then(|w| w.shell.toplevel.clone()) else {
                return;
            };
            let Some(serial) = last_serial else {
                debug!("Dropping move/resize of {:#x}: no seat serial", window);
                return;
            };
            if data[2] == NET_WM_MOVERESIZE_MOVE {
                shell.send(ShellRequest::Move { toplevel, serial });
            } else if let Some(edge) = ResizeEdge::from_moveresize(data[2]) {
                shell.send(ShellRequest::Resize { toplevel, serial, edge });
            }
        } else if type_ == self.atoms._NET_WM_STATE {
            let Some(toplevel) = self.window(window).and_then(|w| w.shell.toplevel.clone()) else {
                return;
            };
            let action = data[0];
            let changed = |atom: u32| data[1] == atom || data[2] == atom;

            if changed(self.atoms._NET_WM_STATE_FULLSCREEN) {
                match action {
                    NET_WM_STATE_ADD => shell.send(ShellRequest::SetFullscreen(toplevel.clone())),
                    NET_WM_STATE_REMOVE => shell.send(ShellRequest::UnsetFullscreen(toplevel.clone())),
                    _ => {}
                }
            }
            if changed(self.atoms._NET_WM_STATE_MAXIMIZED_VERT) && changed(self.atoms._NET_WM_STATE_MAXIMIZED_HORZ) {
                match action {
                    NET_WM_STATE_ADD => shell.send(ShellRequest::SetMaximized(toplevel)),
                    NET_WM_STATE_REMOVE => shell.send(ShellRequest::UnsetMaximized(toplevel)),
                    _ => {}
                }
            }
        }
    }

    /// Window property changes; selection properties are not handled here
    pub fn property_notify<S: Shell<Ref = R>>(
        &mut self,
        x: &mut impl XOps,
        shell: &mut S,
        window: u32,
        atom: u32,
        deleted: bool,
    ) {
        let scale = self.scale;
        let motif = self.atoms._MOTIF_WM_HINTS;
        let Some(w) = self.windows.iter_mut().find(|w| w.is(window)) else {
            return;
        };
        let id = w.id;

        if atom == u32::from(AtomEnum::WM_NAME) {
            w.name = if deleted {
                None
            } else {
                x.property(id, atom, false, PROPERTY_LENGTH).map(|p| hints::text(&p))
            };
            if let Some(toplevel) = w.shell.toplevel.clone() {
                shell.send(ShellRequest::SetTitle {
                    toplevel,
                    title: w.name.clone().unwrap_or_default(),
                });
            }
        } else if atom == u32::from(AtomEnum::WM_NORMAL_HINTS) {
            w.size_flags &= !(P_MIN_SIZE | P_MAX_SIZE);
            if !deleted {
                let size_hints = x
                    .property(id, atom, false, 18)
                    .and_then(|p| hints::SizeHints::parse(&p))
                    .unwrap_or_default();
                w.size_flags |= size_hints.flags & (P_MIN_SIZE | P_MAX_SIZE);
                if w.size_flags & P_MIN_SIZE != 0 {
                    w.min_size = size_hints.min_size;
                }
                if w.size_flags & P_MAX_SIZE != 0 {
                    w.max_size = size_hints.max_size;
                }
            }
            if let Some(toplevel) = w.shell.toplevel.clone() {
                let ((min_w, min_h), (max_w, max_h)) = w.size_limits(scale);
                shell.send(ShellRequest::SetMinSize {
                    toplevel: toplevel.clone(),
                    width: min_w,
                    height: min_h,
                });
                shell.send(ShellRequest::SetMaxSize {
                    toplevel,
                    width: max_w,
                    height: max_h,
                });
            }
        } else if atom == motif {
            // Managed windows are decorated unless they say otherwise
            w.decorated = w.managed;
            if !deleted {
                if let Some(decorated) = x
                    .property(id, atom, false, 5)
                    .and_then(|p| hints::MotifHints::parse(&p))
                    .and_then(|m| m.decorated())
                {
                    w.decorated = decorated;
                }
            }
            if let Some(aura) = w.shell.aura.clone() {
                shell.send(ShellRequest::SetFrame {
                    aura,
                    frame: w.frame_type(),
                });
            }
        }
    }
}

fn state_atom(atoms: &Atoms, state: WmState) -> u32 {
    match state {
        WmState::Fullscreen => atoms._NET_WM_STATE_FULLSCREEN,
        WmState::MaximizedVert => atoms._NET_WM_STATE_MAXIMIZED_VERT,
        WmState::MaximizedHorz => atoms._NET_WM_STATE_MAXIMIZED_HORZ,
    }
}
