//! Client connection to the host compositor
//!
//! Host events are queued by a single [`ObjectData`] shared by every host
//! object and drained by the relay between reads, so they are handled with
//! full access to relay state and in arrival order.

use crate::proxy::HostId;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use wayland_backend::client::{Backend, ObjectData, WaylandError};
use wayland_backend::protocol::{Argument, Interface, Message};

/// An event received from the host
pub type HostMessage = Message<HostId, OwnedFd>;

/// Arguments of a request about to be sent to the host
pub type HostArgs = Vec<Argument<HostId, RawFd>>;

struct HostSink {
    inbox: Mutex<VecDeque<HostMessage>>,
}

impl ObjectData for HostSink {
    fn event(self: Arc<Self>, _backend: &Backend, msg: HostMessage) -> Option<Arc<dyn ObjectData>> {
        let creates = msg.args.iter().any(|arg| matches!(arg, Argument::NewId(_)));
        self.inbox.lock().push_back(msg);
        if creates {
            Some(self as Arc<dyn ObjectData>)
        } else {
            None
        }
    }

    fn destroyed(&self, _object_id: HostId) {}
}

/// Connection to the host display
#[derive(Clone)]
pub struct HostConnection {
    backend: Backend,
    sink: Arc<HostSink>,
}

impl HostConnection {
    /// Connects to `display`, or to the display named by the environment
    pub fn open(display: Option<&str>) -> Result<Self> {
        let backend = match display {
            Some(name) => {
                let path = display_path(name)?;
                let stream = UnixStream::connect(&path)
                    .with_context(|| format!("failed to connect to {}", path.display()))?;
                return Self::from_stream(stream);
            }
            None => wayland_client::Connection::connect_to_env()
                .context("failed to connect to the host display")?
                .backend(),
        };
        Ok(Self::from_backend(backend))
    }

    /// Runs the protocol over an already connected socket
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        let backend = Backend::connect(stream).map_err(|e| anyhow!("host connection: {:?}", e))?;
        Ok(Self::from_backend(backend))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend,
            sink: Arc::new(HostSink {
                inbox: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn display(&self) -> HostId {
        self.backend.display_id()
    }

    pub fn interface(&self, id: &HostId) -> Option<&'static Interface> {
        self.backend.info(id.clone()).ok().map(|info| info.interface)
    }

    pub fn version(&self, id: &HostId) -> u32 {
        self.backend.info(id.clone()).map(|info| info.version).unwrap_or(0)
    }

    /// Sends the request called `request` on `target`.
    ///
    /// Requests newer than the bound version are skipped. Returns the
    /// object created by a new-id argument.
    pub fn send(&self, target: &HostId, request: &str, args: HostArgs) -> Result<Option<HostId>> {
        let info = self
            .backend
            .info(target.clone())
            .map_err(|_| anyhow!("{} on a dead host object", request))?;
        let Some((opcode, desc)) = info
            .interface
            .requests
            .iter()
            .enumerate()
            .find(|(_, desc)| desc.name == request)
        else {
            bail!("{} has no request {}", info.interface.name, request);
        };
        if desc.since > info.version {
            trace!(
                "Skipping {}.{}: bound at v{}",
                info.interface.name,
                request,
                info.version
            );
            return Ok(None);
        }
        let child = desc.child_interface.map(|child| (child, info.version));
        self.send_raw(target, opcode as u16, args, child)
    }

    /// Sends a request by opcode; `child` overrides the new object's
    /// interface and version
    pub fn send_raw(
        &self,
        target: &HostId,
        opcode: u16,
        args: HostArgs,
        child: Option<(&'static Interface, u32)>,
    ) -> Result<Option<HostId>> {
        let creates = args.iter().any(|arg| matches!(arg, Argument::NewId(_)));
        let data = creates.then(|| self.sink.clone() as Arc<dyn ObjectData>);
        let id = self
            .backend
            .send_request(
                Message {
                    sender_id: target.clone(),
                    opcode,
                    args: args.into(),
                },
                data,
                child,
            )
            .map_err(|_| anyhow!("request {} on a dead host object", opcode))?;
        Ok(creates.then_some(id))
    }

    /// `wl_registry.bind`
    pub fn bind(&self, registry: &HostId, name: u32, interface: &'static Interface, version: u32) -> Result<HostId> {
        let args = vec![
            Argument::Uint(name),
            Argument::Str(Some(Box::new(CString::new(interface.name)?))),
            Argument::Uint(version),
            Argument::NewId(HostId::null()),
        ];
        debug!("Binding host global {} {} v{}", name, interface.name, version);
        self.send_raw(registry, 0, args, Some((interface, version)))?
            .ok_or_else(|| anyhow!("bind of {} created nothing", interface.name))
    }

    /// Events received since the last call, oldest first
    pub fn take_events(&self) -> Vec<HostMessage> {
        self.sink.inbox.lock().drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.sink.inbox.lock().is_empty()
    }

    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.backend.poll_fd()
    }

    /// Reads whatever the socket has; `false` once the host hung up
    pub fn read(&self) -> Result<bool> {
        let Some(guard) = self.backend.prepare_read() else {
            return Ok(true);
        };
        match guard.read() {
            Ok(_) => Ok(true),
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(WaylandError::Io(e)) => {
                debug!("Host connection closed: {}", e);
                Ok(false)
            }
            Err(WaylandError::Protocol(e)) => Err(anyhow!("host protocol error: {}", e)),
        }
    }

    pub fn flush(&self) -> Result<bool> {
        match self.backend.flush() {
            Ok(()) => Ok(true),
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(WaylandError::Io(e)) => {
                debug!("Host connection closed while flushing: {}", e);
                Ok(false)
            }
            Err(WaylandError::Protocol(e)) => Err(anyhow!("host protocol error: {}", e)),
        }
    }
}

/// Socket path of a display name; relative names live in `XDG_RUNTIME_DIR`
pub fn display_path(name: &str) -> Result<PathBuf> {
    let path = PathBuf::from(name);
    if path.is_absolute() {
        return Ok(path);
    }
    let runtime = std::env::var_os("XDG_RUNTIME_DIR").context("XDG_RUNTIME_DIR is not set")?;
    Ok(PathBuf::from(runtime).join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_display_path() {
        assert_eq!(
            display_path("/run/host/wayland-0").unwrap(),
            PathBuf::from("/run/host/wayland-0")
        );

        let previous = std::env::var_os("XDG_RUNTIME_DIR");
        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        let relative = display_path("wayland-1");
        match previous {
            Some(value) => std::env::set_var("XDG_RUNTIME_DIR", value),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
        assert_eq!(relative.unwrap(), PathBuf::from("/run/user/1000/wayland-1"));
    }
}
