//! Host side of the clipboard bridge

use super::{arg_object, arg_str, take_fd, HostConnection, HostMessage, Relay, Role};
use crate::clipboard::{Clipboard, HostSelection};
use crate::proxy::HostId;
use crate::transport::channel::ChannelDevice;
use crate::transport::DataDriver;
use crate::xwm::x11::XConnection;
use anyhow::{Context, Result};
use log::{debug, warn};
use rustix::pipe::{pipe_with, PipeFlags};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;
use wayland_backend::protocol::Argument;

/// The relay's own host data device
pub struct HostDataDevice {
    host: HostConnection,
    driver: DataDriver,
    channel: Option<Rc<ChannelDevice>>,
    pub manager: Option<HostId>,
    pub device: Option<HostId>,
    /// Serial sent with `set_selection`
    pub serial: u32,
    /// Objects created or destroyed here that the relay still has to
    /// route or forget
    created: Vec<HostId>,
    destroyed: Vec<HostId>,
}

impl HostDataDevice {
    pub fn new(host: HostConnection, driver: DataDriver, channel: Option<Rc<ChannelDevice>>) -> Self {
        Self {
            host,
            driver,
            channel,
            manager: None,
            device: None,
            serial: 0,
            created: Vec::new(),
            destroyed: Vec::new(),
        }
    }

    fn destroy(&mut self, object: HostId) {
        if let Err(e) = self.host.send(&object, "destroy", Vec::new()) {
            debug!("Destroying clipboard object: {:#}", e);
        }
        self.destroyed.push(object);
    }

    /// Read end of a pipe whose write end goes to the host
    fn pipe(&self) -> Result<(OwnedFd, OwnedFd)> {
        match self.driver {
            DataDriver::Virtwl => {
                let channel = self.channel.as_ref().context("virtwl data driver without a channel")?;
                let read = channel.pipe_read()?;
                let write = read.try_clone()?;
                Ok((read, write))
            }
            DataDriver::Noop => {
                let (read, write) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;
                Ok((read, write))
            }
        }
    }
}

impl HostSelection for HostDataDevice {
    type Offer = HostId;
    type Source = HostId;

    fn create_source(&mut self, mime_types: &[&str]) -> Option<HostId> {
        let manager = self.manager.clone()?;
        let source = match self
            .host
            .send(&manager, "create_data_source", vec![Argument::NewId(HostId::null())])
        {
            Ok(source) => source?,
            Err(e) => {
                warn!("Cannot create a host data source: {:#}", e);
                return None;
            }
        };
        for mime_type in mime_types {
            if let Err(e) = self.host.send(&source, "offer", vec![super::str_arg(mime_type)]) {
                warn!("Offering {} failed: {:#}", mime_type, e);
            }
        }
        self.created.push(source.clone());
        Some(source)
    }

    fn set_selection(&mut self, source: Option<&HostId>) {
        let Some(device) = &self.device else {
            return;
        };
        let args = vec![
            Argument::Object(source.cloned().unwrap_or_else(HostId::null)),
            Argument::Uint(self.serial),
        ];
        if let Err(e) = self.host.send(device, "set_selection", args) {
            warn!("Setting the host selection failed: {:#}", e);
        }
    }

    fn destroy_source(&mut self, source: HostId) {
        self.destroy(source);
    }

    fn destroy_offer(&mut self, offer: HostId) {
        self.destroy(offer);
    }

    /// The host writes into the returned pipe
    fn receive(&mut self, offer: &HostId, mime_type: &str) -> Result<OwnedFd> {
        let (read, write) = self.pipe()?;
        self.host.send(
            offer,
            "receive",
            vec![super::str_arg(mime_type), Argument::Fd(write.as_raw_fd())],
        )?;
        Ok(read)
    }
}

impl Relay {
    /// Routes host clipboard objects created or destroyed since the last call
    pub(super) fn sync_data_objects(&mut self) {
        for source in self.data.created.drain(..) {
            self.objects.insert_internal(source, Role::DataSource);
        }
        for object in self.data.destroyed.drain(..) {
            self.objects.remove_host(&object);
        }
    }

    fn with_clipboard<T>(
        &mut self,
        f: impl FnOnce(&mut Clipboard<HostDataDevice>, &mut XConnection, &mut HostDataDevice) -> T,
    ) -> Option<T> {
        let x = self.x.as_mut()?;
        let clipboard = x.clipboard.as_mut()?;
        self.data.serial = self.seat.last_serial().unwrap_or(0);
        Some(f(clipboard, &mut x.conn, &mut self.data))
    }

    pub(super) fn data_event(&mut self, role: Role, msg: HostMessage, event: &str) -> Result<()> {
        let sender = msg.sender_id.clone();
        match (role, event) {
            (Role::DataDevice, "data_offer") => {
                let Some(offer) = arg_object(&msg.args, 0) else {
                    return Ok(());
                };
                self.objects.insert_internal(offer.clone(), Role::DataOffer);
                let kept = self.with_clipboard(|clipboard, _, _| clipboard.offer_created(offer.clone()));
                if kept.is_none() {
                    self.data.destroy_offer(offer);
                }
            }
            (Role::DataDevice, "selection") => {
                let offer = arg_object(&msg.args, 0).filter(|offer: &HostId| !offer.is_null());
                self.with_clipboard(|clipboard, x, data| clipboard.set_selection(x, data, offer));
            }
            (Role::DataOffer, "offer") => {
                let mime_type = arg_str(&msg.args, 0).unwrap_or_default();
                self.with_clipboard(|clipboard, _, _| clipboard.offer_mime_type(&sender, &mime_type));
            }
            (Role::DataSource, "send") => {
                let mime_type = arg_str(&msg.args, 0).unwrap_or_default();
                let Some(fd) = take_fd(msg.args) else {
                    return Ok(());
                };
                self.with_clipboard(|clipboard, x, _| clipboard.source_send(x, &mime_type, fd));
            }
            (Role::DataSource, "cancelled") => {
                self.with_clipboard(|clipboard, _, data| clipboard.source_cancelled(data, &sender));
            }
            _ => {}
        }
        self.sync_data_objects();
        Ok(())
    }

    /// Fds of a running clipboard transfer: the pipe being read from the
    /// host and the pipe being written to it
    pub fn clipboard_fds(&self) -> (Option<BorrowedFd<'_>>, Option<BorrowedFd<'_>>) {
        let Some(clipboard) = self.x.as_ref().and_then(|x| x.clipboard.as_ref()) else {
            return (None, None);
        };
        (clipboard.receive_fd(), clipboard.send_fd())
    }

    pub fn clipboard_readable(&mut self) {
        self.with_clipboard(|clipboard, x, _| clipboard.receive_readable(x));
    }

    pub fn clipboard_writable(&mut self) {
        self.with_clipboard(|clipboard, x, _| clipboard.send_writable(x));
    }
}
