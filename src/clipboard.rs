//! Clipboard bridge between X selections and the host data device
//!
//! # Transfer flow
//!
//! ## X owner, host reader:
//! 1. XFixes reports a new `CLIPBOARD` owner
//! 2. The bridge converts the selection to `TARGETS` into `_WL_SELECTION`
//! 3. A host data source offering UTF-8 text becomes the host selection
//! 4. On `send`, the selection is converted to `UTF8_STRING` and the property
//!    is streamed into the host's fd, chunk by chunk for `INCR` owners
//!
//! ## Host owner, X reader:
//! 1. The host data device announces a selection offer
//! 2. The selection window takes `CLIPBOARD` ownership
//! 3. A `SelectionRequest` for text receives the offer through a pipe
//! 4. Payloads above [`INCR_CHUNK_SIZE`] go out with the `INCR` protocol:
//!    one chunk per deletion of the requestor's property, then an empty
//!    terminator

use crate::xwm::{Atoms, PropertyData, XOps, XRequest};
use log::{debug, info, warn};
use std::fmt::Debug;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use x11rb::protocol::xproto::AtomEnum;

/// Common MIME types for clipboard
pub mod mime_types {
    pub const TEXT_PLAIN_UTF8: &str = "text/plain;charset=utf-8";
}

/// Largest property written per `INCR` step
pub const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// Property read limit, in 32-bit units
const PROPERTY_LENGTH: u32 = 0x1fff_ffff;

/// Read limit for the `TARGETS` list, in 32-bit units
const TARGETS_LENGTH: u32 = 4096;

/// Host side of the bridge
pub trait HostSelection {
    type Offer: Clone + PartialEq + Debug;
    type Source: Clone + PartialEq + Debug;

    /// Creates a data source offering `mime_types`; `None` without a data device manager
    fn create_source(&mut self, mime_types: &[&str]) -> Option<Self::Source>;

    /// Sets the host selection with the seat's last serial
    fn set_selection(&mut self, source: Option<&Self::Source>);

    fn destroy_source(&mut self, source: Self::Source);

    fn destroy_offer(&mut self, offer: Self::Offer);

    /// Asks the offer to write `mime_type` data, returning the read end
    fn receive(&mut self, offer: &Self::Offer, mime_type: &str) -> anyhow::Result<OwnedFd>;
}

/// A `SelectionRequest` being answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    pub time: u32,
    pub requestor: u32,
    pub selection: u32,
    pub target: u32,
    pub property: u32,
}

#[derive(Debug)]
struct Offer<O> {
    offer: O,
    utf8_text: bool,
}

/// Host selection data flowing to an X requestor
#[derive(Debug)]
struct Outgoing {
    request: SelectionRequest,
    data: Vec<u8>,
    incremental: bool,
    /// A written property has not been deleted by the requestor yet
    ack_pending: bool,
    /// `None` once the host side reached end of stream
    receive: Option<OwnedFd>,
    /// Whether the receive fd should be polled
    reading: bool,
}

/// X selection data flowing to a host fd
#[derive(Debug, Default)]
struct Incoming {
    send: Option<OwnedFd>,
    incremental: bool,
    /// Property value not yet fully written
    value: Vec<u8>,
    offset: usize,
    writing: bool,
}

pub struct Clipboard<H: HostSelection> {
    atoms: Atoms,
    /// Window that owns `CLIPBOARD` on behalf of the host
    window: u32,
    owner: Option<u32>,
    timestamp: u32,
    pending_offers: Vec<Offer<H::Offer>>,
    offer: Option<Offer<H::Offer>>,
    source: Option<H::Source>,
    incoming: Incoming,
    outgoing: Option<Outgoing>,
}

impl<H: HostSelection> Clipboard<H> {
    pub fn new(atoms: Atoms, window: u32) -> Self {
        Self {
            atoms,
            window,
            owner: None,
            timestamp: 0,
            pending_offers: Vec::new(),
            offer: None,
            source: None,
            incoming: Incoming::default(),
            outgoing: None,
        }
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn source(&self) -> Option<&H::Source> {
        self.source.as_ref()
    }

    /// Whether an X client is currently being served host data
    pub fn transfer_pending(&self) -> bool {
        self.outgoing.is_some()
    }

    /// The host pipe to poll for readability
    pub fn receive_fd(&self) -> Option<BorrowedFd<'_>> {
        self.outgoing
            .as_ref()
            .filter(|o| o.reading)
            .and_then(|o| o.receive.as_ref())
            .map(|fd| fd.as_fd())
    }

    /// The host fd to poll for writability
    pub fn send_fd(&self) -> Option<BorrowedFd<'_>> {
        if !self.incoming.writing {
            return None;
        }
        self.incoming.send.as_ref().map(|fd| fd.as_fd())
    }

    // Host data device events

    pub fn offer_created(&mut self, offer: H::Offer) {
        self.pending_offers.push(Offer {
            offer,
            utf8_text: false,
        });
    }

    pub fn offer_mime_type(&mut self, offer: &H::Offer, mime_type: &str) {
        if mime_type != mime_types::TEXT_PLAIN_UTF8 {
            return;
        }
        if let Some(entry) = self.pending_offers.iter_mut().find(|o| &o.offer == offer) {
            entry.utf8_text = true;
        }
    }

    /// The host selection changed; `None` clears it
    pub fn set_selection(&mut self, x: &mut impl XOps, host: &mut H, offer: Option<H::Offer>) {
        if let Some(previous) = self.offer.take() {
            host.destroy_offer(previous.offer);
        }

        let mut selected = None;
        for entry in std::mem::take(&mut self.pending_offers) {
            if offer.as_ref() == Some(&entry.offer) && selected.is_none() {
                selected = Some(entry);
            } else {
                host.destroy_offer(entry.offer);
            }
        }

        let Some(entry) = selected else {
            if self.owner == Some(self.window) {
                x.send(XRequest::SetSelectionOwner {
                    owner: x11rb::NONE,
                    selection: self.atoms.CLIPBOARD,
                    time: self.timestamp,
                });
            }
            return;
        };
        x.send(XRequest::SetSelectionOwner {
            owner: self.window,
            selection: self.atoms.CLIPBOARD,
            time: x11rb::CURRENT_TIME,
        });
        debug!("📋 Host selection offer {:?} (utf-8: {})", entry.offer, entry.utf8_text);
        self.offer = Some(entry);
    }

    /// The host asks for our X-backed source's data
    pub fn source_send(&mut self, x: &mut impl XOps, mime_type: &str, fd: OwnedFd) {
        if mime_type != mime_types::TEXT_PLAIN_UTF8 {
            return;
        }
        if let Err(e) = rustix::io::ioctl_fionbio(&fd, true) {
            warn!("📋 Cannot make selection fd non-blocking: {}", e);
            return;
        }
        x.send(XRequest::ConvertSelection {
            requestor: self.window,
            selection: self.atoms.CLIPBOARD,
            target: self.atoms.UTF8_STRING,
            property: self.atoms._WL_SELECTION,
            time: x11rb::CURRENT_TIME,
        });
        self.incoming = Incoming {
            send: Some(fd),
            ..Default::default()
        };
    }

    pub fn source_cancelled(&mut self, host: &mut H, source: &H::Source) {
        if self.source.as_ref() == Some(source) {
            self.source = None;
        }
        host.destroy_source(source.clone());
    }

    // X events

    /// XFixes `SelectionNotify` for `selection`
    pub fn xfixes_selection_notify(
        &mut self,
        x: &mut impl XOps,
        host: &mut H,
        selection: u32,
        owner: u32,
        timestamp: u32,
    ) {
        if selection != self.atoms.CLIPBOARD {
            return;
        }

        if owner == x11rb::NONE {
            if self.owner != Some(self.window) {
                host.set_selection(None);
            }
            self.owner = None;
            return;
        }

        self.owner = Some(owner);
        if owner == self.window {
            self.timestamp = timestamp;
            return;
        }

        info!("📋 X selection owner is now {:#x}", owner);
        self.incoming.incremental = false;
        x.send(XRequest::ConvertSelection {
            requestor: self.window,
            selection: self.atoms.CLIPBOARD,
            target: self.atoms.TARGETS,
            property: self.atoms._WL_SELECTION,
            time: timestamp,
        });
    }

    /// Core `SelectionNotify`: a conversion we asked for completed
    pub fn selection_notify(&mut self, x: &mut impl XOps, host: &mut H, target: u32, property: u32) {
        if property == x11rb::NONE {
            return;
        }
        if target == self.atoms.TARGETS {
            self.read_targets(x, host);
        } else {
            self.read_data(x);
        }
    }

    pub fn selection_request(&mut self, x: &mut impl XOps, host: &mut H, request: SelectionRequest) {
        if request.selection == self.atoms.CLIPBOARD_MANAGER {
            self.notify(x, &request, request.property);
            return;
        }

        if request.target == self.atoms.TARGETS {
            let targets = [
                self.atoms.TIMESTAMP,
                self.atoms.TARGETS,
                self.atoms.UTF8_STRING,
                self.atoms.TEXT,
            ];
            x.send(XRequest::ChangeProperty {
                window: request.requestor,
                property: request.property,
                type_: AtomEnum::ATOM.into(),
                data: PropertyData::Words(targets.to_vec()),
            });
            self.notify(x, &request, request.property);
        } else if request.target == self.atoms.TIMESTAMP {
            x.send(XRequest::ChangeProperty {
                window: request.requestor,
                property: request.property,
                type_: AtomEnum::INTEGER.into(),
                data: PropertyData::Words(vec![self.timestamp]),
            });
            self.notify(x, &request, request.property);
        } else if request.target == self.atoms.UTF8_STRING || request.target == self.atoms.TEXT {
            self.send_data(x, host, request);
        } else {
            self.notify(x, &request, x11rb::NONE);
        }
    }

    /// `PropertyNotify` on a window the bridge cares about
    pub fn property_notify(&mut self, x: &mut impl XOps, window: u32, atom: u32, deleted: bool) {
        if atom == self.atoms._WL_SELECTION {
            if window == self.window && !deleted && self.incoming.incremental {
                self.read_incremental_chunk(x);
            }
            return;
        }

        let Some(outgoing) = self.outgoing.as_mut() else {
            return;
        };
        if atom != outgoing.request.property
            || window != outgoing.request.requestor
            || !deleted
            || !outgoing.incremental
        {
            return;
        }

        outgoing.ack_pending = false;
        if outgoing.receive.is_some() {
            if !outgoing.data.is_empty() {
                self.write_chunk(x);
            }
            if let Some(outgoing) = self.outgoing.as_mut() {
                outgoing.reading = true;
            }
            return;
        }

        if self.write_chunk(x) {
            debug!("📋 Incremental transfer complete");
            self.outgoing = None;
        }
    }

    // fd readiness

    /// The host pipe became readable
    pub fn receive_readable(&mut self, x: &mut impl XOps) {
        let Some(fd) = self.outgoing.as_ref().and_then(|o| o.receive.as_ref()) else {
            return;
        };
        let fd = match fd.try_clone() {
            Ok(fd) => fd,
            Err(e) => {
                warn!("📋 Cannot duplicate selection pipe: {}", e);
                return;
            }
        };
        self.pump(x, |buf| rustix::io::read(&fd, buf).map_err(io::Error::from));
    }

    /// The host fd for our source became writable
    pub fn send_writable(&mut self, x: &mut impl XOps) {
        let Some(fd) = self.incoming.send.as_ref() else {
            return;
        };
        let remaining = &self.incoming.value[self.incoming.offset..];
        match rustix::io::write(fd, remaining) {
            Ok(written) if written == remaining.len() => {
                self.incoming.value.clear();
                self.incoming.offset = 0;
                self.incoming.writing = false;
                if self.incoming.incremental {
                    // Chunk consumed, ask the owner for the next one
                    x.send(XRequest::DeleteProperty {
                        window: self.window,
                        property: self.atoms._WL_SELECTION,
                    });
                } else {
                    self.incoming.send = None;
                }
            }
            Ok(written) => self.incoming.offset += written,
            Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::INTR) => {}
            Err(e) => {
                warn!("📋 Write error to selection fd: {}", e);
                self.incoming = Incoming::default();
            }
        }
    }

    fn notify(&self, x: &mut impl XOps, request: &SelectionRequest, property: u32) {
        x.send(XRequest::SendSelectionNotify {
            requestor: request.requestor,
            selection: request.selection,
            target: request.target,
            property,
            time: request.time,
        });
    }

    fn read_targets(&mut self, x: &mut impl XOps, host: &mut H) {
        let Some(property) = x.property(self.window, self.atoms._WL_SELECTION, true, TARGETS_LENGTH) else {
            return;
        };
        if property.type_ != u32::from(AtomEnum::ATOM) {
            return;
        }

        let utf8 = property.words().contains(&self.atoms.UTF8_STRING);
        let mime_types: &[&str] = if utf8 { &[mime_types::TEXT_PLAIN_UTF8] } else { &[] };
        let Some(source) = host.create_source(mime_types) else {
            return;
        };
        host.set_selection(Some(&source));
        if let Some(previous) = self.source.replace(source) {
            host.destroy_source(previous);
        }
    }

    fn read_data(&mut self, x: &mut impl XOps) {
        let Some(property) = x.property(self.window, self.atoms._WL_SELECTION, true, PROPERTY_LENGTH) else {
            return;
        };
        if property.type_ == self.atoms.INCR {
            debug!("📋 X owner uses INCR");
            self.incoming.incremental = true;
        } else {
            self.incoming.incremental = false;
            self.start_write(x, property.value);
        }
    }

    fn read_incremental_chunk(&mut self, x: &mut impl XOps) {
        let Some(property) = x.property(self.window, self.atoms._WL_SELECTION, false, PROPERTY_LENGTH) else {
            return;
        };
        if property.value.is_empty() {
            self.incoming.send = None;
            self.incoming.incremental = false;
            return;
        }
        self.start_write(x, property.value);
    }

    fn start_write(&mut self, x: &mut impl XOps, value: Vec<u8>) {
        self.incoming.value = value;
        self.incoming.offset = 0;
        self.incoming.writing = true;
        self.send_writable(x);
    }

    fn send_data(&mut self, x: &mut impl XOps, host: &mut H, request: SelectionRequest) {
        let Some(offer) = self.offer.as_ref().filter(|o| o.utf8_text) else {
            self.notify(x, &request, x11rb::NONE);
            return;
        };

        if self.outgoing.is_some() {
            warn!("📋 Selection transfer already pending");
            self.notify(x, &request, x11rb::NONE);
            return;
        }

        match host.receive(&offer.offer, mime_types::TEXT_PLAIN_UTF8) {
            Ok(fd) => {
                self.outgoing = Some(Outgoing {
                    request,
                    data: Vec::new(),
                    incremental: false,
                    ack_pending: false,
                    receive: Some(fd),
                    reading: true,
                });
            }
            Err(e) => {
                warn!("📋 Cannot receive host selection: {:#}", e);
                self.notify(x, &request, x11rb::NONE);
            }
        }
    }

    /// Writes up to one chunk of buffered data to the requestor, returning
    /// whether it was the empty terminator
    fn write_chunk(&mut self, x: &mut impl XOps) -> bool {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return false;
        };
        let take = outgoing.data.len().min(INCR_CHUNK_SIZE);
        let chunk: Vec<u8> = outgoing.data.drain(..take).collect();
        x.send(XRequest::ChangeProperty {
            window: outgoing.request.requestor,
            property: outgoing.request.property,
            type_: self.atoms.UTF8_STRING,
            data: PropertyData::Bytes(chunk),
        });
        outgoing.ack_pending = true;
        take == 0
    }

    /// Pulls host data with `read` and advances the transfer
    fn pump(&mut self, x: &mut impl XOps, read: impl FnOnce(&mut [u8]) -> io::Result<usize>) {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return;
        };

        // One byte of lookahead before INCR tells a full chunk from a larger payload
        let limit = if outgoing.incremental {
            INCR_CHUNK_SIZE
        } else {
            INCR_CHUNK_SIZE + 1
        };
        let mut buf = vec![0u8; limit.saturating_sub(outgoing.data.len()).max(1)];

        let read = match read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                warn!("📋 Read error from host selection: {}", e);
                let request = outgoing.request;
                self.outgoing = None;
                self.notify(x, &request, x11rb::NONE);
                return;
            }
        };
        outgoing.data.extend_from_slice(&buf[..read]);

        if read > 0 && outgoing.data.len() >= limit {
            outgoing.reading = false;
            if !outgoing.incremental {
                debug!("📋 Switching to INCR for {:#x}", outgoing.request.requestor);
                outgoing.incremental = true;
                outgoing.ack_pending = true;
                let request = outgoing.request;
                x.send(XRequest::ChangeProperty {
                    window: request.requestor,
                    property: request.property,
                    type_: self.atoms.INCR,
                    data: PropertyData::Words(vec![INCR_CHUNK_SIZE as u32]),
                });
                self.notify(x, &request, request.property);
            } else if !outgoing.ack_pending {
                self.write_chunk(x);
            }
            return;
        }

        if read > 0 {
            return;
        }

        // End of stream
        outgoing.receive = None;
        outgoing.reading = false;
        let incremental = outgoing.incremental;
        let terminated = !outgoing.ack_pending && self.write_chunk(x);
        if !incremental {
            if let Some(outgoing) = self.outgoing.take() {
                let request = outgoing.request;
                self.notify(x, &request, request.property);
            }
        } else if terminated {
            debug!("📋 Incremental transfer complete");
            self.outgoing = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xwm::requests::fake::FakeX;
    use crate::xwm::Property;
    use proptest::prelude::*;
    use std::io::Read;

    const SELECTION_WINDOW: u32 = 0x40_0002;
    const REQUESTOR: u32 = 0x60_0001;
    const PROP: u32 = 77;

    #[derive(Default)]
    struct FakeHost {
        next: u32,
        sources: Vec<(u32, Vec<String>)>,
        selections: Vec<Option<u32>>,
        destroyed_sources: Vec<u32>,
        destroyed_offers: Vec<u32>,
        received: Vec<u32>,
        pipes: Vec<OwnedFd>,
    }

    impl HostSelection for FakeHost {
        type Offer = u32;
        type Source = u32;

        fn create_source(&mut self, mime_types: &[&str]) -> Option<u32> {
            self.next += 1;
            self.sources
                .push((self.next, mime_types.iter().map(|m| m.to_string()).collect()));
            Some(self.next)
        }

        fn set_selection(&mut self, source: Option<&u32>) {
            self.selections.push(source.copied());
        }

        fn destroy_source(&mut self, source: u32) {
            self.destroyed_sources.push(source);
        }

        fn destroy_offer(&mut self, offer: u32) {
            self.destroyed_offers.push(offer);
        }

        fn receive(&mut self, offer: &u32, _mime_type: &str) -> anyhow::Result<OwnedFd> {
            self.received.push(*offer);
            let (read, write) = rustix::pipe::pipe()?;
            self.pipes.push(write);
            Ok(read)
        }
    }

    fn setup() -> (Clipboard<FakeHost>, FakeX, FakeHost) {
        let clipboard = Clipboard::new(Atoms::sequential(), SELECTION_WINDOW);
        (clipboard, FakeX::new(), FakeHost::default())
    }

    fn request(atoms: &Atoms, target: u32) -> SelectionRequest {
        SelectionRequest {
            time: 1234,
            requestor: REQUESTOR,
            selection: atoms.CLIPBOARD,
            target,
            property: PROP,
        }
    }

    fn with_utf8_offer(clipboard: &mut Clipboard<FakeHost>, x: &mut FakeX, host: &mut FakeHost) {
        clipboard.offer_created(9);
        clipboard.offer_mime_type(&9, mime_types::TEXT_PLAIN_UTF8);
        clipboard.set_selection(x, host, Some(9));
        x.take();
    }

    fn notified(requests: &[XRequest]) -> Vec<u32> {
        requests
            .iter()
            .filter_map(|r| match r {
                XRequest::SendSelectionNotify { property, .. } => Some(*property),
                _ => None,
            })
            .collect()
    }

    /// Drives a host → X transfer of `payload`, feeding reads of at most `read_size`
    fn transfer(payload: &[u8], read_size: usize) -> Vec<XRequest> {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        with_utf8_offer(&mut clipboard, &mut x, &mut host);
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.UTF8_STRING));
        assert!(clipboard.transfer_pending());

        let mut source = io::Cursor::new(payload.to_vec());
        let mut steps = 0;
        while clipboard.transfer_pending() {
            steps += 1;
            assert!(steps < 100_000, "transfer did not finish");
            if clipboard.outgoing.as_ref().is_some_and(|o| o.reading) {
                clipboard.pump(&mut x, |buf| {
                    let n = buf.len().min(read_size);
                    source.read(&mut buf[..n])
                });
            } else {
                // Requestor consumed the property
                clipboard.property_notify(&mut x, REQUESTOR, PROP, true);
            }
        }
        x.take()
    }

    fn chunk_writes(requests: &[XRequest], utf8: u32) -> Vec<usize> {
        requests
            .iter()
            .filter_map(|r| match r {
                XRequest::ChangeProperty {
                    type_,
                    data: PropertyData::Bytes(bytes),
                    ..
                } if *type_ == utf8 => Some(bytes.len()),
                _ => None,
            })
            .collect()
    }

    fn incr_announcements(requests: &[XRequest], incr: u32) -> usize {
        requests
            .iter()
            .filter(|r| matches!(r, XRequest::ChangeProperty { type_, .. } if *type_ == incr))
            .count()
    }

    #[test]
    fn test_targets_answer() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.TARGETS));
        let requests = x.take();
        assert_eq!(
            requests[0],
            XRequest::ChangeProperty {
                window: REQUESTOR,
                property: PROP,
                type_: AtomEnum::ATOM.into(),
                data: PropertyData::Words(vec![atoms.TIMESTAMP, atoms.TARGETS, atoms.UTF8_STRING, atoms.TEXT]),
            }
        );
        assert_eq!(notified(&requests), vec![PROP]);
    }

    #[test]
    fn test_timestamp_answer_uses_ownership_time() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.xfixes_selection_notify(&mut x, &mut host, atoms.CLIPBOARD, SELECTION_WINDOW, 555);
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.TIMESTAMP));
        let requests = x.take();
        assert!(requests.contains(&XRequest::ChangeProperty {
            window: REQUESTOR,
            property: PROP,
            type_: AtomEnum::INTEGER.into(),
            data: PropertyData::Words(vec![555]),
        }));
    }

    #[test]
    fn test_unknown_target_and_manager_requests() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.selection_request(&mut x, &mut host, request(&atoms, 4242));
        assert_eq!(notified(&x.take()), vec![x11rb::NONE]);

        let mut manager = request(&atoms, atoms.TARGETS);
        manager.selection = atoms.CLIPBOARD_MANAGER;
        clipboard.selection_request(&mut x, &mut host, manager);
        assert_eq!(notified(&x.take()), vec![PROP]);
    }

    #[test]
    fn test_text_refused_without_utf8_offer() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.offer_created(3);
        clipboard.offer_mime_type(&3, "image/png");
        clipboard.set_selection(&mut x, &mut host, Some(3));
        x.take();
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.TEXT));
        assert_eq!(notified(&x.take()), vec![x11rb::NONE]);
        assert!(host.received.is_empty());
    }

    #[test]
    fn test_set_selection_takes_and_drops_ownership() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.offer_created(1);
        clipboard.offer_created(2);
        clipboard.set_selection(&mut x, &mut host, Some(2));
        assert_eq!(
            x.take(),
            vec![XRequest::SetSelectionOwner {
                owner: SELECTION_WINDOW,
                selection: atoms.CLIPBOARD,
                time: x11rb::CURRENT_TIME,
            }]
        );
        assert_eq!(host.destroyed_offers, vec![1]);

        clipboard.xfixes_selection_notify(&mut x, &mut host, atoms.CLIPBOARD, SELECTION_WINDOW, 99);
        clipboard.set_selection(&mut x, &mut host, None);
        assert_eq!(host.destroyed_offers, vec![1, 2]);
        assert_eq!(
            x.take(),
            vec![XRequest::SetSelectionOwner {
                owner: x11rb::NONE,
                selection: atoms.CLIPBOARD,
                time: 99,
            }]
        );
    }

    #[test]
    fn test_host_clear_keeps_x_owner() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.xfixes_selection_notify(&mut x, &mut host, atoms.CLIPBOARD, 0x80_0001, 42);
        x.take();

        // Only a selection we claimed for the host is released
        clipboard.set_selection(&mut x, &mut host, None);
        assert!(x.take().is_empty());

        clipboard.offer_created(3);
        clipboard.set_selection(&mut x, &mut host, Some(3));
        assert_eq!(
            x.take(),
            vec![XRequest::SetSelectionOwner {
                owner: SELECTION_WINDOW,
                selection: atoms.CLIPBOARD,
                time: x11rb::CURRENT_TIME,
            }]
        );
    }

    #[test]
    fn test_x_owner_becomes_host_source() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        clipboard.xfixes_selection_notify(&mut x, &mut host, atoms.CLIPBOARD, 0x80_0001, 42);
        assert_eq!(
            x.take(),
            vec![XRequest::ConvertSelection {
                requestor: SELECTION_WINDOW,
                selection: atoms.CLIPBOARD,
                target: atoms.TARGETS,
                property: atoms._WL_SELECTION,
                time: 42,
            }]
        );

        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_words(AtomEnum::ATOM.into(), &[atoms.TARGETS, atoms.UTF8_STRING]),
        );
        clipboard.selection_notify(&mut x, &mut host, atoms.TARGETS, atoms._WL_SELECTION);
        assert_eq!(host.sources, vec![(1, vec![mime_types::TEXT_PLAIN_UTF8.to_string()])]);
        assert_eq!(host.selections, vec![Some(1)]);
        assert_eq!(clipboard.source(), Some(&1));

        // A new owner replaces the previous source
        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_words(AtomEnum::ATOM.into(), &[atoms.TARGETS]),
        );
        clipboard.selection_notify(&mut x, &mut host, atoms.TARGETS, atoms._WL_SELECTION);
        assert_eq!(host.sources[1], (2, vec![]));
        assert_eq!(host.destroyed_sources, vec![1]);

        // Owner gone: host selection cleared
        clipboard.xfixes_selection_notify(&mut x, &mut host, atoms.CLIPBOARD, x11rb::NONE, 50);
        assert_eq!(host.selections.last(), Some(&None));
        assert_eq!(clipboard.owner(), None);
    }

    #[test]
    fn test_source_send_streams_property() {
        let (mut clipboard, mut x, _host) = setup();
        let atoms = Atoms::sequential();
        let (read, write) = rustix::pipe::pipe().unwrap();
        clipboard.source_send(&mut x, mime_types::TEXT_PLAIN_UTF8, write);
        assert!(matches!(x.take()[0], XRequest::ConvertSelection { target, .. } if target == atoms.UTF8_STRING));

        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_bytes(atoms.UTF8_STRING, b"hello from X".to_vec()),
        );
        let mut host = FakeHost::default();
        clipboard.selection_notify(&mut x, &mut host, atoms.UTF8_STRING, atoms._WL_SELECTION);
        assert!(clipboard.send_fd().is_none());

        let mut out = String::new();
        std::fs::File::from(read).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello from X");
    }

    #[test]
    fn test_source_send_ignores_other_mime_types() {
        let (mut clipboard, mut x, _host) = setup();
        let (_read, write) = rustix::pipe::pipe().unwrap();
        clipboard.source_send(&mut x, "text/html", write);
        assert!(x.take().is_empty());
    }

    #[test]
    fn test_incremental_source_deletes_after_each_chunk() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        let (read, write) = rustix::pipe::pipe().unwrap();
        clipboard.source_send(&mut x, mime_types::TEXT_PLAIN_UTF8, write);
        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_words(atoms.INCR, &[1024]),
        );
        clipboard.selection_notify(&mut x, &mut host, atoms.UTF8_STRING, atoms._WL_SELECTION);
        x.take();

        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_bytes(atoms.UTF8_STRING, b"part one ".to_vec()),
        );
        clipboard.property_notify(&mut x, SELECTION_WINDOW, atoms._WL_SELECTION, false);
        assert_eq!(
            x.take(),
            vec![XRequest::DeleteProperty {
                window: SELECTION_WINDOW,
                property: atoms._WL_SELECTION,
            }]
        );

        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_bytes(atoms.UTF8_STRING, b"part two".to_vec()),
        );
        clipboard.property_notify(&mut x, SELECTION_WINDOW, atoms._WL_SELECTION, false);

        // Zero-length chunk ends the transfer and closes the fd
        x.properties.insert(
            (SELECTION_WINDOW, atoms._WL_SELECTION),
            Property::from_bytes(atoms.UTF8_STRING, Vec::new()),
        );
        clipboard.property_notify(&mut x, SELECTION_WINDOW, atoms._WL_SELECTION, false);

        let mut out = String::new();
        std::fs::File::from(read).read_to_string(&mut out).unwrap();
        assert_eq!(out, "part one part two");
    }

    #[test]
    fn test_small_payload_without_incr() {
        let atoms = Atoms::sequential();
        let requests = transfer(b"short text", 4);
        assert_eq!(incr_announcements(&requests, atoms.INCR), 0);
        assert_eq!(chunk_writes(&requests, atoms.UTF8_STRING), vec![10]);
        assert_eq!(notified(&requests), vec![PROP]);
    }

    #[test]
    fn test_exact_chunk_payload_without_incr() {
        let atoms = Atoms::sequential();
        let payload = vec![b'a'; INCR_CHUNK_SIZE];
        let requests = transfer(&payload, INCR_CHUNK_SIZE);
        assert_eq!(incr_announcements(&requests, atoms.INCR), 0);
        assert_eq!(chunk_writes(&requests, atoms.UTF8_STRING), vec![INCR_CHUNK_SIZE]);
    }

    #[test]
    fn test_second_transfer_refused_while_pending() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        with_utf8_offer(&mut clipboard, &mut x, &mut host);
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.UTF8_STRING));
        let mut second = request(&atoms, atoms.UTF8_STRING);
        second.requestor = 0x60_0002;
        clipboard.selection_request(&mut x, &mut host, second);
        assert_eq!(
            x.take(),
            vec![XRequest::SendSelectionNotify {
                requestor: 0x60_0002,
                selection: atoms.CLIPBOARD,
                target: atoms.UTF8_STRING,
                property: x11rb::NONE,
                time: 1234,
            }]
        );
        assert_eq!(host.received, vec![9]);
    }

    #[test]
    fn test_read_error_refuses_request() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        with_utf8_offer(&mut clipboard, &mut x, &mut host);
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.UTF8_STRING));
        clipboard.pump(&mut x, |_| Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!clipboard.transfer_pending());
        assert_eq!(notified(&x.take()), vec![x11rb::NONE]);
    }

    #[test]
    fn test_receive_readable_from_pipe() {
        let (mut clipboard, mut x, mut host) = setup();
        let atoms = Atoms::sequential();
        with_utf8_offer(&mut clipboard, &mut x, &mut host);
        clipboard.selection_request(&mut x, &mut host, request(&atoms, atoms.UTF8_STRING));
        let write = host.pipes.pop().unwrap();
        rustix::io::write(&write, b"from host").unwrap();
        drop(write);

        assert!(clipboard.receive_fd().is_some());
        clipboard.receive_readable(&mut x);
        clipboard.receive_readable(&mut x);
        assert!(!clipboard.transfer_pending());
        let requests = x.take();
        assert_eq!(chunk_writes(&requests, atoms.UTF8_STRING), vec![9]);
        assert_eq!(notified(&requests), vec![PROP]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_incr_chunk_count(extra in 1usize..3 * INCR_CHUNK_SIZE, read_size in 512usize..80_000) {
            let atoms = Atoms::sequential();
            let payload = vec![b'z'; INCR_CHUNK_SIZE + extra];
            let requests = transfer(&payload, read_size);

            prop_assert_eq!(incr_announcements(&requests, atoms.INCR), 1);
            let writes = chunk_writes(&requests, atoms.UTF8_STRING);
            let expected = payload.len().div_ceil(INCR_CHUNK_SIZE);
            prop_assert_eq!(writes.len(), expected + 1);
            prop_assert_eq!(*writes.last().unwrap(), 0);
            prop_assert!(writes[..expected].iter().all(|w| *w > 0 && *w <= INCR_CHUNK_SIZE));
            prop_assert_eq!(writes.iter().sum::<usize>(), payload.len());
        }
    }
}
