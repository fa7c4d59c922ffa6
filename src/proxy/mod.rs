//! Resource proxy engine
//!
//! The relay speaks the wire protocol on two connections at once: it is the
//! server for guest clients and a client of the host compositor. Guest
//! objects and host objects are paired one to one; this module holds the
//! pieces of that pairing that do not depend on the relay's own state.
//!
//! - [`interfaces`]: descriptor lookup and the closed [`ObjectKind`] set
//! - [`table`]: guest ↔ host routing
//! - [`args`]: argument translation and coordinate rewriting

pub mod args;
pub mod interfaces;
pub mod table;

pub use args::{rescale, translate, Direction, Translated, Unresolved, WireId};
pub use interfaces::{destructor, lookup, ObjectKind};
pub use table::{GuestEntry, HostRoute, ObjectTable};

/// Object id on the host connection
pub type HostId = wayland_backend::client::ObjectId;

/// Object id on a guest connection
pub type GuestId = wayland_backend::server::ObjectId;
