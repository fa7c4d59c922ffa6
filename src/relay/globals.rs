//! Host registry mirroring
//!
//! Each host global passes through the policy table: the relay may bind it
//! for itself, re-advertise it to guests (possibly under another interface
//! or a capped version), or both.

use super::{arg_str, arg_uint, GlobalProxy, HostMessage, Relay, Role};
use crate::proxy::{lookup, GuestId, ObjectKind};
use crate::geometry::Scale;
use crate::registry::InternalGlobal;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use wayland_backend::protocol::Argument;

impl Relay {
    pub(super) fn registry_event(&mut self, msg: &HostMessage, event: &str) -> Result<()> {
        match event {
            "global" => {
                let name = arg_uint(&msg.args, 0);
                let interface = arg_str(&msg.args, 1).unwrap_or_default();
                let version = arg_uint(&msg.args, 2);
                self.host_global(name, &interface, version)
            }
            "global_remove" => {
                self.host_global_remove(arg_uint(&msg.args, 0));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(super) fn initial_sync(&mut self) -> Result<()> {
        self.registry.check_required(self.options.shm_driver)?;
        self.synced = true;
        info!("✅ Host globals ready");
        Ok(())
    }

    fn host_global(&mut self, name: u32, interface: &str, version: u32) -> Result<()> {
        let Some(global) = self.registry.add(name, interface, version, &self.policy) else {
            return Ok(());
        };
        let policy = global.policy;

        if let Some(which) = policy.internal {
            self.bind_internal(name, which, interface, policy.version)?;
        }

        if let Some(face) = policy.guest {
            let guest_interface =
                lookup(face.interface).with_context(|| format!("no descriptor for {}", face.interface))?;
            let id = self
                .handle
                .create_global::<Relay>(guest_interface, face.version, Arc::new(GlobalProxy { name }));
            if let Some(global) = self.registry.get_mut(name) {
                global.guest = Some(id);
            }
        }
        Ok(())
    }

    fn bind_internal(&mut self, name: u32, which: InternalGlobal, interface: &str, version: u32) -> Result<()> {
        let descriptor = lookup(interface).with_context(|| format!("no descriptor for {}", interface))?;
        if which == InternalGlobal::Output {
            let id = self.host.bind(&self.registry_id, name, descriptor, version)?;
            return self.output_bound(name, id);
        }
        if self.internal.contains_key(&which) {
            debug!("Ignoring another host {}", interface);
            return Ok(());
        }

        let id = self.host.bind(&self.registry_id, name, descriptor, version)?;
        self.objects.insert_internal(id.clone(), Role::Global(which));
        self.internal.insert(which, id);

        match which {
            InternalGlobal::Viewporter => {
                self.scale = Scale::new(self.desired_scale, true);
            }
            InternalGlobal::AuraShell => {
                let outputs: Vec<u32> = self.outputs.keys().copied().collect();
                for output in outputs {
                    self.attach_aura_output(output)?;
                }
            }
            InternalGlobal::Seat | InternalGlobal::DataDeviceManager => self.ensure_data_device()?,
            _ => {}
        }
        Ok(())
    }

    /// The data device used for clipboard bridging, once both the manager
    /// and a seat are known
    fn ensure_data_device(&mut self) -> Result<()> {
        if !self.options.xwayland || self.data.device.is_some() {
            return Ok(());
        }
        let (Some(manager), Some(seat)) = (
            self.internal.get(&InternalGlobal::DataDeviceManager),
            self.internal.get(&InternalGlobal::Seat),
        ) else {
            return Ok(());
        };
        let device = self.host.send(
            manager,
            "get_data_device",
            vec![
                Argument::NewId(crate::proxy::HostId::null()),
                Argument::Object(seat.clone()),
            ],
        )?;
        if let Some(device) = device {
            self.objects.insert_internal(device.clone(), Role::DataDevice);
            self.data.manager = Some(manager.clone());
            self.data.device = Some(device);
        }
        Ok(())
    }

    fn host_global_remove(&mut self, name: u32) {
        let Some(global) = self.registry.remove(name) else {
            return;
        };
        if let Some(id) = global.guest {
            self.handle.disable_global::<Relay>(id.clone());
            self.handle.remove_global::<Relay>(id);
        }
        for host in self.objects.detach_bound(name) {
            self.destroy_host(&host);
        }
        match global.policy.internal {
            Some(InternalGlobal::Output) => self.output_removed(name),
            Some(which) => warn!("Host removed {} ({:?}) while the relay uses it", global.interface, which),
            None => {}
        }
    }

    /// A guest bound one of the re-advertised globals
    pub(super) fn bind_global(&mut self, name: u32, guest: GuestId) {
        if let Err(e) = self.try_bind_global(name, guest) {
            self.fail(e);
        }
    }

    fn try_bind_global(&mut self, name: u32, guest: GuestId) -> Result<()> {
        let version = self.guest_version(&guest);
        let kind = ObjectKind::of(guest.interface());
        debug!("Guest bound {} v{} from host global {}", guest.interface().name, version, name);

        let Some(global) = self.registry.get(name) else {
            // Removed after the guest saw it; the object stays inert
            self.objects.insert_local(guest, kind, version);
            return Ok(());
        };

        match kind {
            ObjectKind::GtkShell => {
                self.objects.insert_local(guest.clone(), kind, version);
                self.send_guest(&guest, "capabilities", vec![Argument::Uint(0)]);
            }
            ObjectKind::Drm => {
                self.objects.insert_local(guest.clone(), kind, version);
                self.drm_bound(&guest);
            }
            ObjectKind::Output => {
                self.objects.insert_local(guest.clone(), kind, version);
                self.objects.set_global(&guest, name);
                self.output_guest_bound(name, &guest);
            }
            _ => {
                let interface = lookup(&global.interface).unwrap_or(guest.interface());
                let host = self.host.bind(&self.registry_id, name, interface, version)?;
                self.objects.pair(guest.clone(), kind, version, host);
                self.objects.set_global(&guest, name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::{HostConnection, RelayOptions};
    use crate::transport::Passthrough;
    use std::collections::HashMap;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixStream;
    use wayland_backend::server::Backend;

    enum Wire<'a> {
        Uint(u32),
        Str(&'a str),
    }

    fn message(id: u32, opcode: u16, args: &[Wire]) -> Vec<u8> {
        let mut body = Vec::new();
        for arg in args {
            match arg {
                Wire::Uint(value) => body.extend_from_slice(&value.to_ne_bytes()),
                Wire::Str(text) => {
                    body.extend_from_slice(&(text.len() as u32 + 1).to_ne_bytes());
                    body.extend_from_slice(text.as_bytes());
                    body.push(0);
                    while body.len() % 4 != 0 {
                        body.push(0);
                    }
                }
            }
        }
        let header = (((body.len() + 8) as u32) << 16) | opcode as u32;
        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&id.to_ne_bytes());
        out.extend_from_slice(&header.to_ne_bytes());
        out.extend(body);
        out
    }

    /// Messages waiting on `socket` as (object, opcode, body)
    fn received(socket: &mut UnixStream) -> Vec<(u32, u16, Vec<u8>)> {
        socket.set_nonblocking(true).unwrap();
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("reading test socket: {}", e),
            }
        }

        let word = |at: usize| u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        let mut messages = Vec::new();
        let mut at = 0;
        while at + 8 <= bytes.len() {
            let header = word(at + 4);
            let size = (header >> 16) as usize;
            messages.push((word(at), (header & 0xffff) as u16, bytes[at + 8..at + size].to_vec()));
            at += size;
        }
        messages
    }

    fn first_uint(body: &[u8]) -> u32 {
        u32::from_ne_bytes(body[0..4].try_into().unwrap())
    }

    #[test]
    fn test_revoked_global_tears_down_bound_objects() -> Result<()> {
        let (host_socket, mut host) = UnixStream::pair()?;
        let (guest_socket, mut guest) = UnixStream::pair()?;

        let options = RelayOptions::from_config(&RelayConfig::default().finalize()?)?;
        let mut display = Backend::<Relay>::new()?;
        let connection = HostConnection::from_stream(host_socket)?;
        let mut relay = Relay::new(connection, display.handle(), options, Box::new(Passthrough), None)?;
        let registry = relay.registry_id.protocol_id();
        let sync = relay
            .objects
            .internal()
            .find(|(_, role)| **role == Role::InitialSync)
            .map(|(id, _)| id.protocol_id())
            .unwrap();

        // Host side: three globals, then the initial sync completes
        let mut announce = message(registry, 0, &[Wire::Uint(1), Wire::Str("wl_compositor"), Wire::Uint(4)]);
        announce.extend(message(registry, 0, &[Wire::Uint(2), Wire::Str("wl_output"), Wire::Uint(3)]));
        announce.extend(message(registry, 0, &[Wire::Uint(3), Wire::Str("wl_subcompositor"), Wire::Uint(1)]));
        announce.extend(message(sync, 0, &[Wire::Uint(0)]));
        host.write_all(&announce)?;
        assert!(relay.host().read()?);
        relay.dispatch_host();
        assert!(relay.take_error().is_none());
        assert!(relay.is_synced());

        // Guest side: fetch the registry and bind two of the mirrored globals
        let data = relay.new_client(false);
        display.handle().insert_client(guest_socket, data)?;
        guest.write_all(&message(1, 1, &[Wire::Uint(2)]))?;
        display.dispatch_all_clients(&mut relay)?;
        display.flush(None)?;
        let names: HashMap<String, u32> = received(&mut guest)
            .into_iter()
            .filter(|(id, opcode, _)| *id == 2 && *opcode == 0)
            .map(|(_, _, body)| {
                let len = u32::from_ne_bytes(body[4..8].try_into().unwrap()) as usize;
                (String::from_utf8_lossy(&body[8..8 + len - 1]).into_owned(), first_uint(&body))
            })
            .collect();
        let (subcompositor, output) = (names["wl_subcompositor"], names["wl_output"]);

        let mut binds = message(
            2,
            0,
            &[Wire::Uint(subcompositor), Wire::Str("wl_subcompositor"), Wire::Uint(1), Wire::Uint(3)],
        );
        binds.extend(message(
            2,
            0,
            &[Wire::Uint(output), Wire::Str("wl_output"), Wire::Uint(3), Wire::Uint(4)],
        ));
        guest.write_all(&binds)?;
        display.dispatch_all_clients(&mut relay)?;
        assert!(relay.take_error().is_none());

        let guest_subcompositor = relay.objects.of_kind(ObjectKind::Subcompositor).next().cloned().unwrap();
        let host_subcompositor = relay.objects.host_of(&guest_subcompositor).unwrap();
        assert_eq!(relay.objects.of_kind(ObjectKind::Output).count(), 1);
        let host_output = relay.outputs[&2].host.clone();

        // Host revokes both globals
        let mut revoke = message(registry, 1, &[Wire::Uint(3)]);
        revoke.extend(message(registry, 1, &[Wire::Uint(2)]));
        host.write_all(&revoke)?;
        assert!(relay.host().read()?);
        relay.dispatch_host();
        assert!(relay.take_error().is_none());

        assert_eq!(relay.objects.host_of(&guest_subcompositor), None);
        assert!(relay.objects.route(&host_subcompositor).is_none());
        assert!(relay.objects.route(&host_output).is_none());
        assert!(!relay.outputs.contains_key(&2));
        assert!(relay.registry.get(2).is_none());
        assert!(relay.registry.get(3).is_none());
        assert!(relay.registry.get(1).is_some());

        // The guest hears wl_registry.global_remove for both
        display.flush(None)?;
        let removed: Vec<u32> = received(&mut guest)
            .into_iter()
            .filter(|(id, opcode, _)| *id == 2 && *opcode == 1)
            .map(|(_, _, body)| first_uint(&body))
            .collect();
        assert!(removed.contains(&subcompositor));
        assert!(removed.contains(&output));

        // The host gets wl_subcompositor.destroy and wl_output.release
        assert!(relay.host().flush()?);
        let requests = received(&mut host);
        assert!(requests
            .iter()
            .any(|(id, opcode, _)| *id == host_subcompositor.protocol_id() && *opcode == 0));
        assert!(requests
            .iter()
            .any(|(id, opcode, _)| *id == host_output.protocol_id() && *opcode == 0));
        Ok(())
    }
}
