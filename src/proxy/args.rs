//! Message argument translation and coordinate rewriting
//!
//! Forwarding a message means rebuilding its argument list for the other
//! connection: object references are swapped for their counterparts, new
//! object ids become placeholders (requests) or freshly created objects
//! (events), and file descriptors are kept alive until the message has been
//! queued. Length- and position-valued arguments are then rescaled.

use crate::geometry::Scale;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use wayland_backend::protocol::Argument;

/// Object id types the translator can produce placeholders for
pub trait WireId: Clone {
    fn null_id() -> Self;
    fn is_null_id(&self) -> bool;
}

impl WireId for wayland_backend::client::ObjectId {
    fn null_id() -> Self {
        wayland_backend::client::ObjectId::null()
    }

    fn is_null_id(&self) -> bool {
        self.is_null()
    }
}

impl WireId for wayland_backend::server::ObjectId {
    fn null_id() -> Self {
        wayland_backend::server::ObjectId::null()
    }

    fn is_null_id(&self) -> bool {
        self.is_null()
    }
}

/// An argument list rebuilt for the other connection
#[derive(Debug)]
pub struct Translated<A, B> {
    pub args: Vec<Argument<B, RawFd>>,
    /// Descriptors referenced by `args`; must outlive the send
    pub fds: Vec<OwnedFd>,
    /// The new-id argument of the original message
    pub new_id: Option<A>,
}

/// A non-null object argument had no counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unresolved {
    pub position: usize,
}

/// Rebuilds `args` for the other side.
///
/// `object` maps an object reference; `new_object` produces the argument
/// for a new id (a null placeholder for requests, a created object for
/// events). Null references stay null.
pub fn translate<A, B>(
    args: impl IntoIterator<Item = Argument<A, OwnedFd>>,
    mut object: impl FnMut(&A) -> Option<B>,
    mut new_object: impl FnMut(&A) -> Option<B>,
) -> Result<Translated<A, B>, Unresolved>
where
    A: WireId,
    B: WireId,
{
    let mut out = Translated {
        args: Vec::new(),
        fds: Vec::new(),
        new_id: None,
    };
    for (position, arg) in args.into_iter().enumerate() {
        let translated = match arg {
            Argument::Int(v) => Argument::Int(v),
            Argument::Uint(v) => Argument::Uint(v),
            Argument::Fixed(v) => Argument::Fixed(v),
            Argument::Str(s) => Argument::Str(s),
            Argument::Array(a) => Argument::Array(a),
            Argument::Object(id) if id.is_null_id() => Argument::Object(B::null_id()),
            Argument::Object(id) => match object(&id) {
                Some(mapped) => Argument::Object(mapped),
                None => return Err(Unresolved { position }),
            },
            Argument::NewId(id) => {
                let mapped = new_object(&id).ok_or(Unresolved { position })?;
                out.new_id = Some(id);
                Argument::NewId(mapped)
            }
            Argument::Fd(fd) => {
                let raw = fd.as_raw_fd();
                out.fds.push(fd);
                Argument::Fd(raw)
            }
        };
        out.args.push(translated);
    }
    Ok(out)
}

/// Which way a message is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Guest request: guest pixels to host units
    ToHost,
    /// Host event: host units to guest pixels
    ToGuest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Int,
    Fixed,
}

struct Rule {
    interface: &'static str,
    message: &'static str,
    direction: Direction,
    unit: Unit,
    args: &'static [usize],
}

const fn rule(
    interface: &'static str,
    message: &'static str,
    direction: Direction,
    unit: Unit,
    args: &'static [usize],
) -> Rule {
    Rule {
        interface,
        message,
        direction,
        unit,
        args,
    }
}

use Direction::{ToGuest, ToHost};

const RULES: &[Rule] = &[
    rule("wl_region", "add", ToHost, Unit::Int, &[0, 1, 2, 3]),
    rule("wl_region", "subtract", ToHost, Unit::Int, &[0, 1, 2, 3]),
    rule("wl_subsurface", "set_position", ToHost, Unit::Int, &[0, 1]),
    rule("wl_shell_surface", "set_transient", ToHost, Unit::Int, &[1, 2]),
    rule("wl_shell_surface", "set_popup", ToHost, Unit::Int, &[3, 4]),
    rule("wl_shell_surface", "configure", ToGuest, Unit::Int, &[1, 2]),
    rule("wl_pointer", "set_cursor", ToHost, Unit::Int, &[2, 3]),
    rule("wl_pointer", "enter", ToGuest, Unit::Fixed, &[2, 3]),
    rule("wl_pointer", "motion", ToGuest, Unit::Fixed, &[1, 2]),
    rule("wl_touch", "down", ToGuest, Unit::Fixed, &[4, 5]),
    rule("wl_touch", "motion", ToGuest, Unit::Fixed, &[2, 3]),
    rule("wl_data_device", "enter", ToGuest, Unit::Fixed, &[2, 3]),
    rule("wl_data_device", "motion", ToGuest, Unit::Fixed, &[1, 2]),
    rule("xdg_surface", "set_window_geometry", ToHost, Unit::Int, &[0, 1, 2, 3]),
    rule("xdg_positioner", "set_size", ToHost, Unit::Int, &[0, 1]),
    rule("xdg_positioner", "set_anchor_rect", ToHost, Unit::Int, &[0, 1, 2, 3]),
    rule("xdg_positioner", "set_offset", ToHost, Unit::Int, &[0, 1]),
    rule("xdg_toplevel", "set_max_size", ToHost, Unit::Int, &[0, 1]),
    rule("xdg_toplevel", "set_min_size", ToHost, Unit::Int, &[0, 1]),
    rule("xdg_toplevel", "configure", ToGuest, Unit::Int, &[0, 1]),
    rule("xdg_popup", "configure", ToGuest, Unit::Int, &[0, 1, 2, 3]),
];

/// Whether `interface.message` carries coordinates in `direction`
pub fn is_scaled(interface: &str, message: &str, direction: Direction) -> bool {
    RULES
        .iter()
        .any(|r| r.interface == interface && r.message == message && r.direction == direction)
}

/// Rescales the coordinate arguments of one message in place
pub fn rescale<Id, Fd>(
    args: &mut [Argument<Id, Fd>],
    interface: &str,
    message: &str,
    direction: Direction,
    scale: &Scale,
) {
    let Some(rule) = RULES
        .iter()
        .find(|r| r.interface == interface && r.message == message && r.direction == direction)
    else {
        return;
    };
    for &index in rule.args {
        match (args.get_mut(index), rule.unit, direction) {
            (Some(Argument::Int(v)), Unit::Int, ToHost) => *v = scale.to_host(*v),
            (Some(Argument::Int(v)), Unit::Int, ToGuest) => *v = scale.to_guest(*v),
            (Some(Argument::Fixed(v)), Unit::Fixed, ToHost) => *v = scale.fixed_to_host(*v),
            (Some(Argument::Fixed(v)), Unit::Fixed, ToGuest) => *v = scale.fixed_to_guest(*v),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    impl WireId for u32 {
        fn null_id() -> Self {
            0
        }

        fn is_null_id(&self) -> bool {
            *self == 0
        }
    }

    fn temp_fd() -> OwnedFd {
        OwnedFd::from(tempfile::tempfile().unwrap())
    }

    #[test]
    fn test_translate_request_placeholders() {
        let fd = temp_fd();
        let raw = fd.as_raw_fd();
        let args: Vec<Argument<u32, OwnedFd>> = vec![
            Argument::NewId(9),
            Argument::Object(3),
            Argument::Object(0),
            Argument::Fd(fd),
            Argument::Int(-4),
        ];
        let out = translate(args, |id| Some(id + 100), |_| Some(0u32)).unwrap();

        assert_eq!(out.new_id, Some(9));
        assert_eq!(out.fds.len(), 1);
        assert!(matches!(out.args[0], Argument::NewId(0)));
        assert!(matches!(out.args[1], Argument::Object(103)));
        assert!(matches!(out.args[2], Argument::Object(0)));
        assert!(matches!(out.args[3], Argument::Fd(r) if r == raw));
        assert!(matches!(out.args[4], Argument::Int(-4)));
    }

    #[test]
    fn test_translate_unresolved_object() {
        let args: Vec<Argument<u32, OwnedFd>> = vec![Argument::Uint(1), Argument::Object(5)];
        let err = translate::<u32, u32>(args, |_| None, |_| None).unwrap_err();
        assert_eq!(err, Unresolved { position: 1 });
    }

    #[test]
    fn test_rescale_pointer_motion() {
        let scale = Scale::new(2.0, false);
        let mut args: Vec<Argument<u32, RawFd>> = vec![
            Argument::Uint(1234),
            Argument::Fixed(10 * 256),
            Argument::Fixed(5 * 256 + 128),
        ];
        rescale(&mut args, "wl_pointer", "motion", Direction::ToGuest, &scale);
        assert!(matches!(args[0], Argument::Uint(1234)));
        assert!(matches!(args[1], Argument::Fixed(v) if v == 20 * 256));
        assert!(matches!(args[2], Argument::Fixed(v) if v == 11 * 256));
    }

    #[test]
    fn test_rescale_ignores_other_direction() {
        let scale = Scale::new(2.0, false);
        let mut args: Vec<Argument<u32, RawFd>> = vec![Argument::Int(100), Argument::Int(50)];
        rescale(&mut args, "xdg_toplevel", "set_min_size", Direction::ToGuest, &scale);
        assert!(matches!(args[0], Argument::Int(100)));
        rescale(&mut args, "xdg_toplevel", "set_min_size", Direction::ToHost, &scale);
        assert!(matches!(args[0], Argument::Int(50)));
        assert!(matches!(args[1], Argument::Int(25)));
        assert!(is_scaled("xdg_popup", "configure", Direction::ToGuest));
        assert!(!is_scaled("wl_surface", "commit", Direction::ToHost));
    }

    proptest! {
        #[test]
        fn prop_integer_round_trip_within_one(x in -100_000i32..100_000, factor in 1u32..=10) {
            let scale = Scale::new(factor as f64, false);
            let mut args: Vec<Argument<u32, RawFd>> = vec![Argument::Int(x), Argument::Int(x)];
            rescale(&mut args, "wl_subsurface", "set_position", Direction::ToHost, &scale);
            let host = match args[0] { Argument::Int(v) => v, _ => unreachable!() };
            let back = scale.to_guest(host);
            prop_assert!((back - x).abs() <= factor as i32);
            prop_assert_eq!(back, (x as f64 / factor as f64).round() as i32 * factor as i32);
        }

        #[test]
        fn prop_viewport_scale_is_not_quantized(x in -10_000i32..10_000, factor in 0.5f64..4.0) {
            let scale = Scale::new(factor, true);
            let fixed = x * 256;
            let guest = scale.fixed_to_guest(fixed);
            prop_assert!((guest as f64 - fixed as f64 * factor).abs() <= 0.5);
        }
    }
}
