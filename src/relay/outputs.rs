//! Host outputs and the scaled state guests see

use super::{arg_int, arg_object, arg_str, arg_uint, str_arg, GuestArgs, HostMessage, Relay, Role};
use crate::output::{self, HostOutput, OutputContext, OutputState, WL_OUTPUT_MODE_CURRENT};
use crate::proxy::{GuestId, HostId};
use crate::registry::InternalGlobal;
use anyhow::Result;
use log::debug;
use wayland_backend::protocol::Argument;

pub(crate) struct OutputRecord {
    pub host: HostId,
    pub aura: Option<HostId>,
    pub state: HostOutput,
    /// Guests have been sent a complete state at least once
    pub reported: bool,
    /// `done` arrived while an aura scale was still expected
    pub deferred: bool,
}

impl Relay {
    pub(super) fn output_bound(&mut self, name: u32, host: HostId) -> Result<()> {
        let aura = self.internal.contains_key(&InternalGlobal::AuraShell);
        let record = OutputRecord {
            host: host.clone(),
            aura: None,
            state: HostOutput::new(self.outputs.is_empty(), false),
            reported: false,
            deferred: false,
        };
        self.objects.insert_internal(host, Role::Output { name });
        self.outputs.insert(name, record);
        if aura {
            self.attach_aura_output(name)?;
        }
        Ok(())
    }

    pub(super) fn attach_aura_output(&mut self, name: u32) -> Result<()> {
        let Some(shell) = self.internal.get(&InternalGlobal::AuraShell) else {
            return Ok(());
        };
        let Some(record) = self.outputs.get_mut(&name) else {
            return Ok(());
        };
        if record.aura.is_some() {
            return Ok(());
        }
        let aura = self.host.send(
            shell,
            "get_aura_output",
            vec![Argument::NewId(HostId::null()), Argument::Object(record.host.clone())],
        )?;
        if let Some(aura) = aura {
            self.objects.insert_internal(aura.clone(), Role::AuraOutput { name });
            record.aura = Some(aura);
            record.state.has_aura_output = true;
            record.state.expecting_scale = true;
        }
        Ok(())
    }

    pub(super) fn output_removed(&mut self, name: u32) {
        let Some(record) = self.outputs.remove(&name) else {
            return;
        };
        if let Some(aura) = record.aura {
            self.objects.remove_host(&aura);
        }
        self.destroy_host(&record.host);
        self.objects.remove_host(&record.host);
        debug!("Output {} removed", name);
    }

    pub(super) fn output_event(&mut self, name: u32, msg: &HostMessage, event: &str) {
        let Some(record) = self.outputs.get_mut(&name) else {
            return;
        };
        let args = &msg.args;
        let state = &mut record.state;
        match event {
            "geometry" => state.set_geometry(
                arg_int(args, 0),
                arg_int(args, 1),
                arg_int(args, 2),
                arg_int(args, 3),
                arg_int(args, 4),
                arg_str(args, 5).unwrap_or_default(),
                arg_str(args, 6).unwrap_or_default(),
                arg_int(args, 7),
            ),
            "mode" => {
                let flags = arg_uint(args, 0);
                if flags & WL_OUTPUT_MODE_CURRENT != 0 {
                    state.set_mode(flags, arg_int(args, 1), arg_int(args, 2), arg_int(args, 3));
                }
            }
            "scale" => state.set_scale(arg_int(args, 0)),
            "done" => {
                if state.done() {
                    self.report_output(name);
                } else {
                    record.deferred = true;
                }
                return;
            }
            _ => return,
        }
        // Version 1 outputs never send done
        if self.host.version(&record.host) < 2 {
            self.report_output(name);
        }
    }

    pub(super) fn aura_output_event(&mut self, name: u32, msg: &HostMessage, event: &str) {
        let Some(record) = self.outputs.get_mut(&name) else {
            return;
        };
        match event {
            "scale" => {
                record.state.aura_scale(arg_uint(&msg.args, 0), arg_uint(&msg.args, 1));
                if record.deferred && !record.state.expecting_scale {
                    record.deferred = false;
                    self.report_output(name);
                }
            }
            "connection" => record.state.aura_connection(arg_uint(&msg.args, 0)),
            "device_scale_factor" => record.state.aura_device_scale_factor(arg_uint(&msg.args, 0)),
            _ => {}
        }
    }

    /// Scale Xwayland should run at given the outputs seen so far
    pub fn xwayland_scale(&self) -> f64 {
        output::xwayland_scale(
            self.outputs.values().map(|record| &record.state),
            self.desired_scale,
            self.internal.contains_key(&InternalGlobal::AuraShell),
            self.internal.contains_key(&InternalGlobal::Viewporter),
        )
    }

    fn output_context(&self) -> OutputContext<'_> {
        OutputContext {
            xwayland: self.options.xwayland,
            aura: self.internal.contains_key(&InternalGlobal::AuraShell),
            scale: self.scale.factor(),
            dpi: &self.options.dpi,
        }
    }

    /// Sends the current state of output `name` to every guest bound to it
    fn report_output(&mut self, name: u32) {
        let Some(record) = self.outputs.get_mut(&name) else {
            return;
        };
        record.reported = true;
        let Some(record) = self.outputs.get(&name) else {
            return;
        };
        let state = record.state.guest_state(&self.output_context());
        for guest in self.objects.bound_from(name) {
            self.send_output_state(&guest, &state);
        }
    }

    /// Resends every output guests already know about
    pub(super) fn report_outputs(&mut self) {
        let reported: Vec<u32> = self
            .outputs
            .iter()
            .filter(|(_, record)| record.reported)
            .map(|(name, _)| *name)
            .collect();
        for name in reported {
            self.report_output(name);
        }
    }

    /// Sends the state to a guest that just bound output `name`
    pub(super) fn output_guest_bound(&mut self, name: u32, guest: &GuestId) {
        let Some(record) = self.outputs.get(&name) else {
            return;
        };
        if record.reported {
            let state = record.state.guest_state(&self.output_context());
            self.send_output_state(guest, &state);
        }
    }

    fn send_output_state(&self, guest: &GuestId, state: &OutputState) {
        let geometry: GuestArgs = vec![
            Argument::Int(state.x),
            Argument::Int(state.y),
            Argument::Int(state.physical_width),
            Argument::Int(state.physical_height),
            Argument::Int(state.subpixel),
            str_arg(&state.make),
            str_arg(&state.model),
            Argument::Int(state.transform),
        ];
        self.send_guest(guest, "geometry", geometry);
        self.send_guest(
            guest,
            "mode",
            vec![
                Argument::Uint(state.mode_flags),
                Argument::Int(state.width),
                Argument::Int(state.height),
                Argument::Int(state.refresh),
            ],
        );
        self.send_guest(guest, "scale", vec![Argument::Int(state.scale)]);
        self.send_guest(guest, "done", Vec::new());
    }

    /// `wl_surface.enter`/`leave` name a host output; guests get every
    /// output object their client bound from the same global
    pub(super) fn surface_output_event(&mut self, surface: &GuestId, msg: &HostMessage, event: &str) {
        let Some(Role::Output { name }) = arg_object(&msg.args, 0).and_then(|o| self.objects.role_of(&o)) else {
            return;
        };
        let client = self.handle.get_client(surface.clone()).ok();
        for output in self.objects.bound_from(name) {
            if self.handle.get_client(output.clone()).ok() == client {
                self.send_guest(surface, event, vec![Argument::Object(output)]);
            }
        }
    }
}
