//! Seat bookkeeping and reserved keyboard accelerators
//!
//! Every relayed seat remembers the serial of the last input event, which
//! authenticates shell requests (move, resize, selection) made on behalf of
//! X clients. With the keyboard extension bound, key presses matching a
//! configured accelerator stay with the host instead of reaching the guest.

use crate::error::RelayError;
use anyhow::{Context as _, Result};
use log::debug;
use memmap2::MmapOptions;
use std::fs::File;
use std::os::fd::OwnedFd;
use xkbcommon::xkb;

pub const CONTROL_MASK: u32 = 1 << 0;
pub const ALT_MASK: u32 = 1 << 1;
pub const SHIFT_MASK: u32 = 1 << 2;

/// A key combination reserved by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accelerator {
    pub modifiers: u32,
    pub keysym: xkb::Keysym,
}

/// Parses a comma separated list such as `<Control><Alt>Delete,<Alt>Tab`
pub fn parse_accelerators(list: &str) -> Result<Vec<Accelerator>, RelayError> {
    let mut accelerators = Vec::new();
    let mut rest = list;
    let mut modifiers = 0;

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix(',') {
            rest = tail;
        } else if rest.starts_with('<') {
            let (mask, tail) = if let Some(tail) = rest.strip_prefix("<Control>") {
                (CONTROL_MASK, tail)
            } else if let Some(tail) = rest.strip_prefix("<Alt>") {
                (ALT_MASK, tail)
            } else if let Some(tail) = rest.strip_prefix("<Shift>") {
                (SHIFT_MASK, tail)
            } else {
                return Err(RelayError::Config(format!("invalid accelerator modifier in {:?}", rest)));
            };
            modifiers |= mask;
            rest = tail;
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let name = &rest[..end];
            let keysym = xkb::keysym_from_name(name, xkb::KEYSYM_CASE_INSENSITIVE);
            if keysym.raw() == 0 {
                return Err(RelayError::Config(format!("invalid key symbol {:?}", name)));
            }
            accelerators.push(Accelerator { modifiers, keysym });
            modifiers = 0;
            rest = &rest[end..];
        }
    }

    Ok(accelerators)
}

/// Whether `keysym` with `modifiers` held is reserved
pub fn is_reserved(accelerators: &[Accelerator], modifiers: u32, keysym: xkb::Keysym) -> bool {
    accelerators
        .iter()
        .any(|a| a.modifiers == modifiers && a.keysym == keysym)
}

/// Host keymap and modifier state for one keyboard
pub struct KeyboardState {
    state: xkb::State,
    control: xkb::ModMask,
    alt: xkb::ModMask,
    shift: xkb::ModMask,
}

impl std::fmt::Debug for KeyboardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardState")
            .field("modifiers", &self.modifiers())
            .finish()
    }
}

impl KeyboardState {
    pub fn from_string(context: &xkb::Context, keymap: &str) -> Result<Self> {
        let keymap = xkb::Keymap::new_from_string(
            context,
            keymap.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| RelayError::Config("host keymap does not compile".into()))?;

        let mask = |name: &str| {
            let index = keymap.mod_get_index(name);
            if index == xkb::MOD_INVALID {
                0
            } else {
                1 << index
            }
        };
        let control = mask(xkb::MOD_NAME_CTRL);
        let alt = mask(xkb::MOD_NAME_ALT);
        let shift = mask(xkb::MOD_NAME_SHIFT);

        Ok(Self {
            state: xkb::State::new(&keymap),
            control,
            alt,
            shift,
        })
    }

    /// Compiles the keymap the host sent in `wl_keyboard.keymap`
    pub fn from_fd(context: &xkb::Context, fd: OwnedFd, size: u32) -> Result<Self> {
        let file = File::from(fd);
        // SAFETY: the host keymap fd is a private read-only mapping
        let map = unsafe { MmapOptions::new().len(size as usize).map(&file) }.context("mapping host keymap")?;
        let text = match map.iter().position(|b| *b == 0) {
            Some(end) => &map[..end],
            None => &map[..],
        };
        let text = std::str::from_utf8(text).context("host keymap is not UTF-8")?;
        debug!("⌨️ Host keymap: {} bytes", text.len());
        Self::from_string(context, text)
    }

    pub fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        self.state.update_mask(depressed, latched, locked, 0, 0, group);
    }

    /// Effective modifiers as accelerator mask bits
    pub fn modifiers(&self) -> u32 {
        let effective = self.state.serialize_mods(xkb::STATE_MODS_EFFECTIVE);
        let mut modifiers = 0;
        if effective & self.control != 0 {
            modifiers |= CONTROL_MASK;
        }
        if effective & self.alt != 0 {
            modifiers |= ALT_MASK;
        }
        if effective & self.shift != 0 {
            modifiers |= SHIFT_MASK;
        }
        modifiers
    }

    /// Keysym for an evdev key code
    pub fn keysym(&self, key: u32) -> xkb::Keysym {
        self.state.key_get_one_sym(xkb::Keycode::from(key + 8))
    }

    pub fn is_reserved(&self, accelerators: &[Accelerator], key: u32) -> bool {
        is_reserved(accelerators, self.modifiers(), self.keysym(key))
    }
}

/// Per-seat input bookkeeping
#[derive(Debug, Default)]
pub struct SeatState {
    last_serial: u32,
    /// Guest surface protocol ids
    pub pointer_focus: Option<u32>,
    pub keyboard_focus: Option<u32>,
    pub keyboard: Option<KeyboardState>,
}

impl SeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the serial of an input event
    pub fn input_serial(&mut self, serial: u32) {
        self.last_serial = serial;
    }

    /// `None` until the seat has seen input
    pub fn last_serial(&self) -> Option<u32> {
        (self.last_serial != 0).then_some(self.last_serial)
    }
}
