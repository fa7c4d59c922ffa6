//! X11 window state and the shell objects that back it
//!
//! Every window the embedded window manager tracks is a [`Window`]. A window
//! is displayed on the host through a relayed `wl_surface` which Xwayland
//! announces with a `WL_SURFACE_ID` client message; until that happens the
//! window is *unpaired*. Once paired, the window manager builds host shell
//! objects for it (an `xdg_surface` plus a toplevel or popup, and an aura
//! surface when the host has one) through the [`Shell`] trait.
//!
//! Host configure events travel through a two-slot pipeline of [`Config`]
//! snapshots: `next` is computed from the host but not yet applied to the X
//! window, `pending` has been applied and is waiting for the client to draw
//! matching contents. Only one configure is ever in flight.

#[cfg(test)]
mod tests;

use crate::geometry::Rect;
use std::fmt;

/// `WM_NORMAL_HINTS` flags
pub const US_POSITION: u32 = 1 << 0;
pub const US_SIZE: u32 = 1 << 1;
pub const P_POSITION: u32 = 1 << 2;
pub const P_SIZE: u32 = 1 << 3;
pub const P_MIN_SIZE: u32 = 1 << 4;
pub const P_MAX_SIZE: u32 = 1 << 5;

const POSITIONED: u32 = US_POSITION | P_POSITION;

/// `xdg_toplevel.state` wire values
pub const TOPLEVEL_STATE_MAXIMIZED: u32 = 1;
pub const TOPLEVEL_STATE_FULLSCREEN: u32 = 2;
pub const TOPLEVEL_STATE_RESIZING: u32 = 3;
pub const TOPLEVEL_STATE_ACTIVATED: u32 = 4;

/// Prefix of every application id derived from X properties
pub const APPLICATION_ID_PREFIX: &str = "org.chromium.termina";

/// `_NET_WM_STATE` entries the relay reflects from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WmState {
    Fullscreen,
    MaximizedVert,
    MaximizedHorz,
}

/// One configure snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// `xdg_surface.configure` serial, 0 when none
    pub serial: u32,
    /// New frame origin, `None` keeps the current one
    pub position: Option<(i32, i32)>,
    /// New client size, `None` keeps the current one
    pub size: Option<(i32, i32)>,
    pub border_width: Option<u32>,
    pub states: Vec<WmState>,
}

impl Config {
    /// Whether the snapshot changes frame geometry
    pub fn has_geometry(&self) -> bool {
        self.position.is_some() || self.size.is_some() || self.border_width.is_some()
    }

    /// The rectangle this snapshot describes relative to `current`
    pub fn geometry(&self, current: Rect) -> Rect {
        let (x, y) = self.position.unwrap_or((current.x, current.y));
        let (width, height) = self.size.unwrap_or((current.width, current.height));
        Rect::new(x, y, width, height)
    }

    pub fn clear(&mut self) {
        *self = Config::default();
    }
}

/// Aura frame decoration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    None = 0,
    Normal = 1,
    Shadow = 2,
}

/// `xdg_toplevel.resize_edge`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeEdge {
    Top = 1,
    Bottom = 2,
    Left = 4,
    TopLeft = 5,
    BottomLeft = 6,
    Right = 8,
    TopRight = 9,
    BottomRight = 10,
}

impl ResizeEdge {
    /// Maps a `_NET_WM_MOVERESIZE` direction (0..=7) to an edge
    pub fn from_moveresize(direction: u32) -> Option<Self> {
        Some(match direction {
            0 => ResizeEdge::TopLeft,
            1 => ResizeEdge::Top,
            2 => ResizeEdge::TopRight,
            3 => ResizeEdge::Right,
            4 => ResizeEdge::BottomRight,
            5 => ResizeEdge::Bottom,
            6 => ResizeEdge::BottomLeft,
            7 => ResizeEdge::Left,
            _ => return None,
        })
    }
}

/// Popup placement relative to the parent surface, in guest units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positioner {
    pub anchor_rect: Rect,
    pub size: (i32, i32),
}

/// What the window manager needs to know about a relayed surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub contents: (u32, u32),
    pub last_event_serial: u32,
}

impl SurfaceInfo {
    pub fn has_contents(&self) -> bool {
        self.contents.0 != 0 && self.contents.1 != 0
    }
}

/// Requests sent on host shell objects
#[derive(Debug, Clone, PartialEq)]
pub enum ShellRequest<R> {
    Destroy(R),
    SetParent { toplevel: R, parent: Option<R> },
    SetTitle { toplevel: R, title: String },
    SetMinSize { toplevel: R, width: i32, height: i32 },
    SetMaxSize { toplevel: R, width: i32, height: i32 },
    SetFullscreen(R),
    UnsetFullscreen(R),
    SetMaximized(R),
    UnsetMaximized(R),
    Move { toplevel: R, serial: u32 },
    Resize { toplevel: R, serial: u32, edge: ResizeEdge },
    AckConfigure { xdg_surface: R, serial: u32 },
    /// `wl_surface.commit` on the host surface paired with a guest surface id
    Commit { surface_id: u32 },
    SetFrame { aura: R, frame: FrameType },
    SetFrameColors { aura: R, active: u32, inactive: u32 },
    SetStartupId { aura: R, startup_id: Option<String> },
    SetApplicationId { aura: R, app_id: String },
    SetAuraParent { aura: R, parent: R, x: i32, y: i32 },
}

/// Host shell the window manager drives
///
/// `Ref` identifies one host shell object. Events on objects created here
/// are routed back to the window with the id passed at creation.
pub trait Shell {
    type Ref: Clone + PartialEq + fmt::Debug;

    /// Looks up a relayed surface by the id Xwayland announced
    fn surface(&self, surface_id: u32) -> Option<SurfaceInfo>;

    /// Whether the host offers the aura shell
    fn has_aura(&self) -> bool;

    fn get_xdg_surface(&mut self, window: u32, surface_id: u32) -> Option<Self::Ref>;

    fn get_toplevel(&mut self, window: u32, xdg_surface: &Self::Ref) -> Option<Self::Ref>;

    fn get_popup(
        &mut self,
        window: u32,
        xdg_surface: &Self::Ref,
        parent: &Self::Ref,
        positioner: Positioner,
    ) -> Option<Self::Ref>;

    fn get_aura_surface(&mut self, surface_id: u32) -> Option<Self::Ref>;

    fn send(&mut self, request: ShellRequest<Self::Ref>);
}

/// Host shell objects owned by one window
#[derive(Debug, Clone, PartialEq)]
pub struct ShellObjects<R> {
    pub xdg_surface: Option<R>,
    pub toplevel: Option<R>,
    pub popup: Option<R>,
    pub aura: Option<R>,
}

impl<R> Default for ShellObjects<R> {
    fn default() -> Self {
        Self {
            xdg_surface: None,
            toplevel: None,
            popup: None,
            aura: None,
        }
    }
}

impl<R> ShellObjects<R> {
    /// Takes every object in destruction order
    pub fn take_all(&mut self) -> Vec<R> {
        [
            self.aura.take(),
            self.toplevel.take(),
            self.popup.take(),
            self.xdg_surface.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// A top-level X window
#[derive(Debug, Clone)]
pub struct Window<R> {
    pub id: u32,
    pub frame_id: Option<u32>,
    /// Guest `wl_surface` id from `WL_SURFACE_ID`, 0 when unpaired
    pub surface_id: u32,
    pub unpaired: bool,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub border_width: u32,
    pub depth: u8,
    pub managed: bool,
    pub realized: bool,
    pub activated: bool,
    pub allow_resize: bool,
    pub decorated: bool,
    pub transient_for: Option<u32>,
    pub client_leader: Option<u32>,
    pub name: Option<String>,
    pub class: Option<String>,
    pub startup_id: Option<String>,
    pub size_flags: u32,
    pub min_size: (i32, i32),
    pub max_size: (i32, i32),
    pub next: Config,
    pub pending: Config,
    pub shell: ShellObjects<R>,
}

impl<R> Window<R> {
    pub fn new(id: u32, geometry: Rect, border_width: u32) -> Self {
        Self {
            id,
            frame_id: None,
            surface_id: 0,
            unpaired: true,
            x: geometry.x,
            y: geometry.y,
            width: geometry.width,
            height: geometry.height,
            border_width,
            depth: 0,
            managed: false,
            realized: false,
            activated: false,
            allow_resize: true,
            decorated: false,
            transient_for: None,
            client_leader: None,
            name: None,
            class: None,
            startup_id: None,
            size_flags: P_POSITION,
            min_size: (0, 0),
            max_size: (0, 0),
            next: Config::default(),
            pending: Config::default(),
            shell: ShellObjects::default(),
        }
    }

    /// Whether `id` names this window or its frame
    pub fn is(&self, id: u32) -> bool {
        self.id == id || self.frame_id == Some(id)
    }

    pub fn geometry(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Whether the client or user chose the position
    pub fn is_positioned(&self) -> bool {
        self.size_flags & POSITIONED != 0
    }

    /// Size of the contents a client draws for the current configuration
    pub fn expected_contents(&self) -> (u32, u32) {
        let border = 2 * self.border_width as i64;
        (
            (self.width as i64 + border).max(0) as u32,
            (self.height as i64 + border).max(0) as u32,
        )
    }

    /// Shrinks the window to fit the screen
    pub fn clamp_to_screen(&mut self, screen: (i32, i32)) {
        self.width = self.width.min(screen.0);
        self.height = self.height.min(screen.1);
    }

    /// Moves the window to the center of the screen
    pub fn center_on_screen(&mut self, screen: (i32, i32)) {
        self.x = screen.0 / 2 - self.width / 2;
        self.y = screen.1 / 2 - self.height / 2;
    }

    /// Resets the metadata a map request re-reads
    pub fn reset_properties(&mut self) {
        self.name = None;
        self.class = None;
        self.startup_id = None;
        self.transient_for = None;
        self.client_leader = None;
        self.decorated = true;
        self.size_flags = 0;
    }

    /// Returns the window to the state of an unmanaged window
    pub fn unmanage(&mut self) {
        self.managed = false;
        self.decorated = false;
        self.size_flags = P_POSITION;
    }

    pub fn frame_type(&self) -> FrameType {
        if self.decorated {
            FrameType::Normal
        } else if self.depth == 32 {
            FrameType::None
        } else {
            FrameType::Shadow
        }
    }

    /// Application id reported to the host
    pub fn application_id(&self, forced: Option<&str>) -> String {
        if let Some(forced) = forced {
            return forced.to_string();
        }
        match (&self.class, self.client_leader) {
            (Some(class), _) => format!("{}.wmclass.{}", APPLICATION_ID_PREFIX, class),
            (None, Some(leader)) => format!("{}.wmclientleader.{}", APPLICATION_ID_PREFIX, leader),
            (None, None) => format!("{}.xid.{}", APPLICATION_ID_PREFIX, self.id),
        }
    }

    /// Min and max sizes in guest units, `(0, 0)` when unset
    pub fn size_limits(&self, scale: f64) -> ((i32, i32), (i32, i32)) {
        let convert = |flag: u32, (w, h): (i32, i32)| {
            if self.size_flags & flag != 0 {
                ((w as f64 / scale) as i32, (h as f64 / scale) as i32)
            } else {
                (0, 0)
            }
        };
        (convert(P_MIN_SIZE, self.min_size), convert(P_MAX_SIZE, self.max_size))
    }

    /// Folds a host toplevel configure into `next`.
    ///
    /// `width`/`height` are guest units, 0 meaning "client decides".
    /// Returns the new activation state when it changed.
    pub fn apply_toplevel_configure(
        &mut self,
        width: i32,
        height: i32,
        states: &[u32],
        scale: f64,
        screen: (i32, i32),
    ) -> Option<bool> {
        if width != 0 && height != 0 {
            let width = (width as f64 * scale) as i32;
            let height = (height as f64 * scale) as i32;
            self.next.position = if self.is_positioned() {
                None
            } else {
                Some((screen.0 / 2 - width / 2, screen.1 / 2 - height / 2))
            };
            self.next.size = Some((width, height));
            self.next.border_width = Some(0);
        }

        self.allow_resize = true;
        self.next.states.clear();
        let mut activated = false;
        for state in states {
            match *state {
                TOPLEVEL_STATE_FULLSCREEN => {
                    self.allow_resize = false;
                    self.next.states.push(WmState::Fullscreen);
                }
                TOPLEVEL_STATE_MAXIMIZED => {
                    self.allow_resize = false;
                    self.next.states.push(WmState::MaximizedVert);
                    self.next.states.push(WmState::MaximizedHorz);
                }
                TOPLEVEL_STATE_ACTIVATED => activated = true,
                TOPLEVEL_STATE_RESIZING => self.allow_resize = false,
                _ => {}
            }
        }

        if activated != self.activated {
            self.activated = activated;
            Some(activated)
        } else {
            None
        }
    }

    /// Applies `next` to the window geometry, moving it into `pending`.
    ///
    /// Returns whether the origin moved.
    pub fn promote_next(&mut self) -> bool {
        let (x, y) = self.next.position.unwrap_or((self.x, self.y));
        if let Some((width, height)) = self.next.size {
            self.width = width;
            self.height = height;
        }
        if let Some(border_width) = self.next.border_width {
            self.border_width = border_width;
        }
        let moved = x != self.x || y != self.y;
        self.x = x;
        self.y = y;
        self.pending = std::mem::take(&mut self.next);
        moved
    }

    /// Whether the pending configure can be acked given the surface contents
    pub fn pending_satisfied(&self, contents: Option<(u32, u32)>) -> bool {
        if self.pending.serial == 0 {
            return false;
        }
        match contents {
            Some(contents) if self.managed => contents == self.expected_contents(),
            _ => true,
        }
    }
}

/// Decodes the state array of `xdg_toplevel.configure`
pub fn decode_states(array: &[u8]) -> Vec<u32> {
    array
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
