//! The X requests the window manager and selection bridge issue
//!
//! Handlers describe their side effects as [`XRequest`] values sent through
//! an [`XOps`] implementation. The x11rb connection executes them; tests
//! record them.

use crate::geometry::Rect;
use x11rb::protocol::xproto::{EventMask, StackMode};

/// A property value as read from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property type atom
    pub type_: u32,
    pub format: u8,
    pub value: Vec<u8>,
    /// Bytes left on the server after this read
    pub bytes_after: u32,
}

impl Property {
    pub fn from_bytes(type_: u32, value: Vec<u8>) -> Self {
        Self {
            type_,
            format: 8,
            value,
            bytes_after: 0,
        }
    }

    pub fn from_words(type_: u32, words: &[u32]) -> Self {
        Self {
            type_,
            format: 32,
            value: words.iter().flat_map(|w| w.to_ne_bytes()).collect(),
            bytes_after: 0,
        }
    }

    /// The value as 32-bit items
    pub fn words(&self) -> Vec<u32> {
        if self.format != 32 {
            return Vec::new();
        }
        self.value
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Reply of `GetGeometry`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub rect: Rect,
    pub border_width: u32,
    pub depth: u8,
}

/// Data written by `ChangeProperty`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyData {
    Bytes(Vec<u8>),
    Words(Vec<u32>),
}

/// A subset of `ConfigureWindow` values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowChanges {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub border_width: Option<u32>,
    pub sibling: Option<u32>,
    pub stack_mode: Option<StackMode>,
}

impl WindowChanges {
    pub fn geometry(rect: Rect) -> Self {
        Self {
            x: Some(rect.x),
            y: Some(rect.y),
            width: Some(rect.width.max(1) as u32),
            height: Some(rect.height.max(1) as u32),
            ..Default::default()
        }
    }

    pub fn stack(mode: StackMode) -> Self {
        Self {
            stack_mode: Some(mode),
            ..Default::default()
        }
    }
}

/// One side effect on the X server
#[derive(Debug, Clone, PartialEq)]
pub enum XRequest {
    Configure {
        window: u32,
        changes: WindowChanges,
    },
    /// Synthetic `ConfigureNotify` telling a client where its window is
    SendConfigureNotify {
        window: u32,
        geometry: Rect,
        border_width: u32,
    },
    ChangeProperty {
        window: u32,
        property: u32,
        type_: u32,
        data: PropertyData,
    },
    DeleteProperty {
        window: u32,
        property: u32,
    },
    /// 32-bit format client message
    SendClientMessage {
        window: u32,
        type_: u32,
        data: [u32; 5],
        mask: EventMask,
    },
    /// Focus a window (`None` clears focus)
    SetInputFocus(Option<u32>),
    SelectInput {
        window: u32,
        mask: EventMask,
    },
    SetNorthWestGravity(u32),
    /// Input/output window of `depth` (0 = root depth) parented to root
    CreateFrame {
        frame: u32,
        depth: u8,
        geometry: Rect,
    },
    MapWindow(u32),
    ReparentWindow {
        window: u32,
        parent: u32,
        x: i32,
        y: i32,
    },
    DestroyWindow(u32),
    ConvertSelection {
        requestor: u32,
        selection: u32,
        target: u32,
        property: u32,
        time: u32,
    },
    SendSelectionNotify {
        requestor: u32,
        selection: u32,
        target: u32,
        property: u32,
        time: u32,
    },
    SetSelectionOwner {
        owner: u32,
        selection: u32,
        time: u32,
    },
}

/// Access to the X server
pub trait XOps {
    fn generate_id(&mut self) -> Option<u32>;

    /// Queues a request; errors surface asynchronously as X error events
    fn send(&mut self, request: XRequest);

    /// Round trip for a window's geometry and depth
    fn geometry(&mut self, window: u32) -> Option<Geometry>;

    /// Round trip for a property; `None` when unset or on error
    fn property(&mut self, window: u32, property: u32, delete: bool, long_length: u32) -> Option<Property>;

    /// Whether `window` was created by the relay's own connection
    fn is_ours(&self, window: u32) -> bool;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    /// Records requests and answers queries from canned data
    #[derive(Debug, Default)]
    pub struct FakeX {
        pub next_id: u32,
        pub requests: Vec<XRequest>,
        pub geometries: HashMap<u32, Geometry>,
        pub properties: HashMap<(u32, u32), Property>,
        pub ours: Vec<u32>,
    }

    impl FakeX {
        pub fn new() -> Self {
            Self {
                next_id: 0x40_0000,
                ..Default::default()
            }
        }

        pub fn take(&mut self) -> Vec<XRequest> {
            std::mem::take(&mut self.requests)
        }
    }

    impl XOps for FakeX {
        fn generate_id(&mut self) -> Option<u32> {
            self.next_id += 1;
            Some(self.next_id)
        }

        fn send(&mut self, request: XRequest) {
            self.requests.push(request);
        }

        fn geometry(&mut self, window: u32) -> Option<Geometry> {
            self.geometries.get(&window).copied()
        }

        fn property(&mut self, window: u32, property: u32, delete: bool, _long_length: u32) -> Option<Property> {
            if delete {
                self.properties.remove(&(window, property))
            } else {
                self.properties.get(&(window, property)).cloned()
            }
        }

        fn is_ours(&self, window: u32) -> bool {
            self.ours.contains(&window)
        }
    }
}
