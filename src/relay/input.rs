//! Seat devices: input serials, keyboard extension and accelerators

use super::{arg_object, arg_uint, GuestMessage, HostMessage, Relay, Role};
use crate::proxy::{GuestId, HostId};
use crate::registry::InternalGlobal;
use crate::seat::KeyboardState;
use anyhow::Result;
use log::{debug, trace, warn};
use wayland_backend::protocol::Argument;

/// `zcr_extended_keyboard_v1.handled_state`
const KEY_NOT_HANDLED: u32 = 0;
const KEY_HANDLED: u32 = 1;

impl Relay {
    pub(super) fn seat_request(&mut self, msg: GuestMessage, request: &str) -> Result<()> {
        let created = self.forward_request(msg)?;
        if request != "get_keyboard" {
            return Ok(());
        }
        let Some((_, keyboard)) = created else {
            return Ok(());
        };
        let Some(extension) = self.internal.get(&InternalGlobal::KeyboardExtension) else {
            return Ok(());
        };
        let extended = self.host.send(
            extension,
            "get_extended_keyboard",
            vec![Argument::NewId(HostId::null()), Argument::Object(keyboard.clone())],
        )?;
        if let Some(extended) = extended {
            self.objects.insert_internal(extended.clone(), Role::ExtendedKeyboard);
            self.extended_keyboards.insert(keyboard, extended);
        }
        Ok(())
    }

    pub(super) fn keyboard_destroyed(&mut self, keyboard: &GuestId) {
        let Some(host) = self.objects.host_of(keyboard) else {
            return;
        };
        if let Some(extended) = self.extended_keyboards.remove(&host) {
            self.destroy_host(&extended);
            self.objects.remove_host(&extended);
        }
    }

    /// Records the serial on the surface a host surface maps to
    fn note_serial(&mut self, surface: Option<&GuestId>, serial: u32) {
        self.seat.input_serial(serial);
        if let Some(state) = surface.and_then(|surface| self.surfaces.get_mut(surface)) {
            state.last_event_serial = serial;
        }
    }

    fn focused(&self, host_surface: Option<HostId>) -> Option<GuestId> {
        host_surface.and_then(|surface| self.objects.guest_of(&surface))
    }

    pub(super) fn pointer_event(&mut self, guest: GuestId, msg: HostMessage, event: &str) -> Result<()> {
        match event {
            "enter" => {
                let surface = self.focused(arg_object(&msg.args, 1));
                self.seat.pointer_focus = surface.as_ref().map(|s| s.protocol_id());
                self.note_serial(surface.as_ref(), arg_uint(&msg.args, 0));
                self.pointer_surface = surface;
            }
            "leave" => {
                self.seat.pointer_focus = None;
                self.pointer_surface = None;
            }
            "button" => {
                let surface = self.pointer_surface.clone();
                self.note_serial(surface.as_ref(), arg_uint(&msg.args, 0));
            }
            _ => {}
        }
        self.forward_event(guest, msg)
    }

    pub(super) fn touch_event(&mut self, guest: GuestId, msg: HostMessage, event: &str) -> Result<()> {
        if event == "down" {
            let surface = self.focused(arg_object(&msg.args, 2));
            self.note_serial(surface.as_ref(), arg_uint(&msg.args, 0));
        }
        self.forward_event(guest, msg)
    }

    pub(super) fn keyboard_event(&mut self, guest: GuestId, msg: HostMessage, event: &str) -> Result<()> {
        match event {
            "keymap" => self.keymap(&msg),
            "enter" => {
                let surface = self.focused(arg_object(&msg.args, 1));
                self.seat.keyboard_focus = surface.as_ref().map(|s| s.protocol_id());
                self.note_serial(surface.as_ref(), arg_uint(&msg.args, 0));
                let x_surface = surface
                    .as_ref()
                    .and_then(|s| self.surfaces.get(s))
                    .map_or(false, |state| self.is_x_client(&state.client));
                if let (true, Some(surface)) = (x_surface, &surface) {
                    let id = surface.protocol_id();
                    self.with_xwm(|x, _| x.xwm.restack(&mut x.conn, id));
                }
                self.keyboard_surface = surface;
            }
            "leave" => {
                self.seat.keyboard_focus = None;
                self.keyboard_surface = None;
            }
            "modifiers" => {
                if let Some(keyboard) = &mut self.seat.keyboard {
                    keyboard.update_modifiers(
                        arg_uint(&msg.args, 1),
                        arg_uint(&msg.args, 2),
                        arg_uint(&msg.args, 3),
                        arg_uint(&msg.args, 4),
                    );
                }
            }
            "key" => return self.key(guest, msg),
            _ => {}
        }
        self.forward_event(guest, msg)
    }

    fn keymap(&mut self, msg: &HostMessage) {
        if self.options.accelerators.is_empty() {
            return;
        }
        let Some(Argument::Fd(fd)) = msg.args.get(1) else {
            return;
        };
        let size = arg_uint(&msg.args, 2);
        let keyboard = fd
            .try_clone()
            .map_err(anyhow::Error::from)
            .and_then(|fd| KeyboardState::from_fd(&self.xkb, fd, size));
        match keyboard {
            Ok(keyboard) => {
                debug!("Loaded host keymap for accelerator matching");
                self.seat.keyboard = Some(keyboard);
            }
            Err(e) => warn!("Ignoring host keymap: {:#}", e),
        }
    }

    /// Keys matching a host accelerator go back to the host unhandled and
    /// never reach the guest
    fn key(&mut self, guest: GuestId, msg: HostMessage) -> Result<()> {
        let serial = arg_uint(&msg.args, 0);
        let key = arg_uint(&msg.args, 2);
        let surface = self.keyboard_surface.clone();
        self.note_serial(surface.as_ref(), serial);

        let Some(extended) = self.extended_keyboards.get(&msg.sender_id).cloned() else {
            return self.forward_event(guest, msg);
        };
        let reserved = self
            .seat
            .keyboard
            .as_ref()
            .map_or(false, |keyboard| keyboard.is_reserved(&self.options.accelerators, key));
        let handled = if reserved {
            trace!("Key {} is a host accelerator", key);
            KEY_NOT_HANDLED
        } else {
            self.forward_event(guest, msg)?;
            KEY_HANDLED
        };
        self.host.send(
            &extended,
            "ack_key",
            vec![Argument::Uint(serial), Argument::Uint(handled)],
        )?;
        Ok(())
    }
}
