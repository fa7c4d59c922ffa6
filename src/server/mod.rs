//! The relay's event loop and process lifecycle
//!
//! One `calloop` loop owns every fd the relay waits on: the host
//! connection, the guest display, the Xwayland display-ready pipe and
//! window manager connection, the channel context pump, running clipboard
//! transfers, and SIGCHLD. Callbacks only touch [`State`]; everything that
//! has to happen between two waits (flushing, clipboard fd bookkeeping,
//! exit checks) runs in [`State::before_wait`].

pub mod master;

use crate::config::RelayConfig;
use crate::output::xcursor_size;
use crate::relay::{HostConnection, Relay, RelayOptions};
use crate::transport::channel::{ChannelDevice, ContextPump};
use crate::transport::{open_backend, DataDriver, ShmDriver};
use crate::xwayland::{self, ChildAction, ChildPolicy, DisplayReader, XwaylandRendering};
use crate::xwm::x11::XConnection;
use anyhow::{Context, Result};
use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use log::{debug, error, info, warn};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::rc::Rc;
use wayland_backend::server::Backend;

/// Who the guest is
#[derive(Debug, Clone, Default)]
pub struct Launch {
    /// Program to run inside the relay
    pub program: Vec<String>,
    /// Already connected guest socket, from a master
    pub client_fd: Option<RawFd>,
    pub peer_pid: Option<i32>,
}

/// Everything the loop callbacks work on
pub struct State {
    relay: Relay,
    display: Backend<Relay>,
    handle: LoopHandle<'static, State>,
    children: ChildPolicy,
    /// Program to start once Xwayland is ready
    pending_program: Vec<String>,
    sd_notify: Option<String>,
    clipboard_watches: [Watched<RegistrationToken>; 2],
    exit: Option<i32>,
    error: Option<anyhow::Error>,
}

impl State {
    fn fail(&mut self, error: anyhow::Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn exit(&mut self, code: i32) {
        if self.exit.is_none() {
            debug!("Exiting with {}", code);
            self.exit = Some(code);
        }
    }

    /// Work done before every wait
    fn before_wait(&mut self) -> Result<()> {
        self.relay.dispatch_host();
        self.relay.dispatch_x()?;
        if let Err(e) = self.display.flush(None) {
            debug!("Flushing guest clients: {}", e);
        }
        self.relay.flush_x()?;
        if !self.relay.host().flush()? {
            info!("👋 Host display went away");
            self.exit(0);
        }
        self.sync_clipboard_watches()?;

        if let Some(e) = self.relay.take_error() {
            return Err(e);
        }
        if self.relay.client_gone() {
            info!("👋 Guest disconnected");
            self.exit(self.children.exit_code());
        }
        Ok(())
    }

    /// Keeps one watch per running clipboard transfer fd; a watch is only
    /// replaced when the transfer behind it changes
    fn sync_clipboard_watches(&mut self) -> Result<()> {
        let (receive, send) = self.relay.clipboard_fds();
        let slots: [(_, fn(&mut Relay), Interest); 2] = [
            (receive, Relay::clipboard_readable, Interest::READ),
            (send, Relay::clipboard_writable, Interest::WRITE),
        ];
        for (watch, (fd, on_ready, interest)) in self.clipboard_watches.iter_mut().zip(slots) {
            let file = fd.map(FileKey::of).transpose()?;
            if watch.is_current(file) {
                continue;
            }
            if let Some(token) = watch.take() {
                self.handle.remove(token);
            }
            let (Some(fd), Some(file)) = (fd, file) else {
                continue;
            };
            let token = self
                .handle
                .insert_source(
                    Generic::new(fd.try_clone_to_owned()?, interest, Mode::Level),
                    move |_, _, state| {
                        on_ready(&mut state.relay);
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|e| e.error)?;
            watch.set(file, token);
        }
        Ok(())
    }

    fn child_exited(&mut self) {
        for (pid, status) in xwayland::reap() {
            match self.children.on_exit(pid, status) {
                ChildAction::Nothing => {}
                ChildAction::Terminate(xwayland) => xwayland::terminate(xwayland),
                ChildAction::Notify => self.notify_ready(),
                ChildAction::Exit(code) => self.exit(code),
            }
        }
    }

    fn notify_ready(&self) {
        if let Some(state) = &self.sd_notify {
            if let Err(e) = sd_notify(state) {
                warn!("sd_notify failed: {:#}", e);
            }
        }
    }

    /// Xwayland wrote its display number: connect the window manager and
    /// start the program
    fn xwayland_ready(&mut self, display: &str, wm: UnixStream) -> Result<()> {
        info!("🟢 Xwayland ready on {}", display);
        std::env::set_var("DISPLAY", display);

        let conn = XConnection::connect(wm, self.relay.options().clipboard_manager)?;
        let x_fd = conn.poll_fd()?;
        let scale = self.relay.xwayland_scale();
        self.relay.set_scale(scale);
        self.relay.attach_x(conn);
        std::env::set_var("XCURSOR_SIZE", xcursor_size(self.relay.scale().factor()).to_string());

        self.handle
            .insert_source(Generic::new(x_fd, Interest::READ, Mode::Level), |_, _, state| {
                if let Err(e) = state.relay.dispatch_x() {
                    state.fail(e);
                }
                Ok(PostAction::Continue)
            })
            .map_err(|e| e.error)?;

        if self.pending_program.is_empty() {
            self.notify_ready();
            return Ok(());
        }
        let program = std::mem::take(&mut self.pending_program);
        self.children.program = Some(xwayland::spawn(&program, &[], &[])?);
        Ok(())
    }
}

/// Identity of an open file, stable across dups and fd number reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileKey {
    dev: u64,
    ino: u64,
}

impl FileKey {
    fn of(fd: BorrowedFd<'_>) -> Result<Self> {
        let stat = rustix::fs::fstat(fd).context("fstat of a clipboard transfer fd")?;
        Ok(Self {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        })
    }
}

/// A registration tied to the file it watches
#[derive(Debug)]
struct Watched<T> {
    current: Option<(FileKey, T)>,
}

impl<T> Default for Watched<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<T> Watched<T> {
    fn is_current(&self, file: Option<FileKey>) -> bool {
        self.current.as_ref().map(|(key, _)| *key) == file
    }

    fn take(&mut self) -> Option<T> {
        self.current.take().map(|(_, token)| token)
    }

    fn set(&mut self, file: FileKey, token: T) {
        self.current = Some((file, token));
    }
}

/// Host connection, possibly tunneled through the channel device
fn connect_host(config: &RelayConfig, channel: Option<&Rc<ChannelDevice>>) -> Result<(HostConnection, Option<ContextPump>)> {
    match (channel, &config.display.host_display) {
        (Some(device), None) => {
            let (pump, socket) = ContextPump::connect(device)?;
            let host = HostConnection::from_stream(UnixStream::from(socket))?;
            Ok((host, Some(pump)))
        }
        (_, display) => Ok((HostConnection::open(display.as_deref())?, None)),
    }
}

fn open_channel(config: &RelayConfig) -> Result<Option<Rc<ChannelDevice>>> {
    let uses_channel = matches!(config.shm_driver()?, ShmDriver::Virtwl | ShmDriver::VirtwlDmabuf)
        || config.data_driver()? == DataDriver::Virtwl;
    match &config.transport.virtwl_device {
        Some(path) if uses_channel || config.display.host_display.is_none() => {
            Ok(Some(Rc::new(ChannelDevice::open(path)?)))
        }
        _ => Ok(None),
    }
}

/// Runs one relay until its guest or host goes away; returns the exit code
pub fn run(config: &RelayConfig, launch: Launch) -> Result<i32> {
    // SAFETY: setting signal dispositions has no preconditions. A master
    // leaves SIGCHLD ignored, which would hide exits from the signal source.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    }
    if let Some(pid) = launch.peer_pid {
        debug!("Serving peer {}", pid);
    }

    let options = RelayOptions::from_config(config)?;
    let channel = open_channel(config)?;
    let (host, pump) = connect_host(config, channel.as_ref())?;
    let transport = open_backend(options.shm_driver, options.drm_device.as_deref(), channel.clone())?;

    let display = Backend::<Relay>::new().map_err(|e| anyhow::anyhow!("guest display: {:?}", e))?;
    let relay = Relay::new(host, display.handle(), options, transport, channel)?;

    let mut event_loop: EventLoop<'static, State> = EventLoop::try_new().context("creating the event loop")?;
    let handle = event_loop.handle();

    let signals = Signals::new(&[Signal::SIGCHLD]).context("watching SIGCHLD")?;
    handle
        .insert_source(signals, |_, _, state| state.child_exited())
        .map_err(|e| e.error)?;

    let mut state = State {
        relay,
        display,
        handle: handle.clone(),
        children: ChildPolicy::new(config.xwayland.exit_with_child),
        pending_program: Vec::new(),
        sd_notify: config.display.sd_notify.clone(),
        clipboard_watches: Default::default(),
        exit: None,
        error: None,
    };

    let host_fd = state.relay.host().poll_fd().try_clone_to_owned()?;
    handle
        .insert_source(Generic::new(host_fd, Interest::READ, Mode::Level), |_, _, state| {
            match state.relay.host().read() {
                Ok(true) => state.relay.dispatch_host(),
                Ok(false) => {
                    info!("👋 Host display hung up");
                    state.exit(0);
                }
                Err(e) => state.fail(e),
            }
            Ok(PostAction::Continue)
        })
        .map_err(|e| e.error)?;

    let display_fd = state.display.poll_fd().try_clone_to_owned()?;
    handle
        .insert_source(Generic::new(display_fd, Interest::READ, Mode::Level), |_, _, state| {
            if let Err(e) = state.display.dispatch_all_clients(&mut state.relay) {
                state.fail(e.into());
            }
            Ok(PostAction::Continue)
        })
        .map_err(|e| e.error)?;

    if let Some(pump) = pump {
        watch_pump(&handle, Rc::new(pump))?;
    }

    start_guest(config, launch, &mut state, &handle)?;

    info!("🚀 Relay running");
    loop {
        if let Err(e) = state.before_wait() {
            state.fail(e);
        }
        if let Some(e) = state.error.take() {
            return Err(e);
        }
        if let Some(code) = state.exit {
            return Ok(code);
        }
        event_loop.dispatch(None, &mut state).context("event loop dispatch")?;
    }
}

/// Moves bytes between the channel context and the host connection socket
fn watch_pump(handle: &LoopHandle<'static, State>, pump: Rc<ContextPump>) -> Result<()> {
    let from = pump.clone();
    handle
        .insert_source(
            Generic::new(pump.context_fd().try_clone_to_owned()?, Interest::READ, Mode::Level),
            move |_, _, state| {
                match from.pump_from_context() {
                    Ok(true) => {}
                    Ok(false) => state.exit(0),
                    Err(e) => state.fail(e),
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| e.error)?;
    let to = pump.clone();
    handle
        .insert_source(
            Generic::new(pump.socket_fd().try_clone_to_owned()?, Interest::READ, Mode::Level),
            move |_, _, state| {
                match to.pump_to_context() {
                    Ok(true) => {}
                    Ok(false) => state.exit(0),
                    Err(e) => state.fail(e),
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| e.error)?;
    Ok(())
}

/// Connects the guest: Xwayland, an inherited client socket, or the
/// program itself
fn start_guest(config: &RelayConfig, launch: Launch, state: &mut State, handle: &LoopHandle<'static, State>) -> Result<()> {
    if config.xwayland.enabled {
        return start_xwayland(config, launch.program, state, handle);
    }

    if let Some(fd) = launch.client_fd {
        // SAFETY: the master handed this descriptor over for us to own.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        let data = state.relay.new_client(false);
        state.display.handle().insert_client(stream, data)?;
        state.notify_ready();
        return Ok(());
    }

    anyhow::ensure!(!launch.program.is_empty(), "no program to run");
    let (ours, theirs) = UnixStream::pair()?;
    let data = state.relay.new_client(false);
    state.display.handle().insert_client(ours, data)?;
    let env = [("WAYLAND_SOCKET".to_string(), theirs.as_raw_fd().to_string())];
    state.children.program = Some(xwayland::spawn(&launch.program, &env, &[theirs.as_raw_fd()])?);
    Ok(())
}

fn start_xwayland(
    config: &RelayConfig,
    program: Vec<String>,
    state: &mut State,
    handle: &LoopHandle<'static, State>,
) -> Result<()> {
    let (ours, theirs) = UnixStream::pair()?;
    let data = state.relay.new_client(true);
    let client = state.display.handle().insert_client(ours, data)?;
    state.relay.set_x_client(client);

    let (display_read, display_write) = UnixStream::pair()?;
    let (wm, wm_xwayland) = UnixStream::pair()?;

    let rendering = XwaylandRendering::select(config.transport.drm_device.is_some(), config.transport.glamor);
    let argv = xwayland::xwayland_command(
        config.xwayland.cmd_prefix.as_deref(),
        &config.xwayland.path,
        config.xwayland.display,
        rendering,
        display_write.as_raw_fd(),
        wm_xwayland.as_raw_fd(),
    );
    info!("🚀 Starting Xwayland: {}", argv.join(" "));
    let env = [("WAYLAND_SOCKET".to_string(), theirs.as_raw_fd().to_string())];
    let inherit = [theirs.as_raw_fd(), display_write.as_raw_fd(), wm_xwayland.as_raw_fd()];
    state.children.xwayland = Some(xwayland::spawn(&argv, &env, &inherit)?);
    state.pending_program = program;

    let mut reader = DisplayReader::new();
    let mut wm = Some(wm);
    handle
        .insert_source(
            Generic::new(OwnedFd::from(display_read), Interest::READ, Mode::Level),
            move |_, fd, state| {
                let mut buf = [0u8; 16];
                let display = match rustix::io::read(&**fd, &mut buf) {
                    Ok(0) => match reader.finish() {
                        Some(display) => Some(display),
                        None => {
                            state.fail(anyhow::anyhow!("Xwayland exited before reporting a display"));
                            return Ok(PostAction::Remove);
                        }
                    },
                    Ok(n) => reader.feed(&buf[..n]),
                    Err(rustix::io::Errno::AGAIN | rustix::io::Errno::INTR) => return Ok(PostAction::Continue),
                    Err(e) => {
                        state.fail(anyhow::Error::from(e).context("reading the Xwayland display"));
                        return Ok(PostAction::Remove);
                    }
                };
                let Some(display) = display else {
                    return Ok(PostAction::Continue);
                };
                if let Some(wm) = wm.take() {
                    if let Err(e) = state.xwayland_ready(&display, wm) {
                        error!("❌ Window manager startup failed");
                        state.fail(e);
                    }
                }
                Ok(PostAction::Remove)
            },
        )
        .map_err(|e| e.error)?;
    Ok(())
}

/// Sends `state` to the service manager socket named by `NOTIFY_SOCKET`;
/// a leading `@` names an abstract socket
pub fn sd_notify(state: &str) -> Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let name = std::env::var("NOTIFY_SOCKET").context("NOTIFY_SOCKET is not set")?;
    let socket = UnixDatagram::unbound()?;
    let address = match name.strip_prefix('@') {
        Some(abstract_name) => SocketAddr::from_abstract_name(abstract_name)?,
        None => SocketAddr::from_pathname(&name)?,
    };
    socket.send_to_addr(state.as_bytes(), &address)?;
    debug!("Notified {}: {}", name, state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::fd::AsFd;

    #[test]
    #[serial]
    fn test_sd_notify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify");
        let listener = UnixDatagram::bind(&path).unwrap();

        std::env::set_var("NOTIFY_SOCKET", &path);
        let sent = sd_notify("READY=1");
        std::env::remove_var("NOTIFY_SOCKET");
        sent.unwrap();

        let mut buf = [0u8; 32];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[test]
    #[serial]
    fn test_sd_notify_without_socket() {
        std::env::remove_var("NOTIFY_SOCKET");
        assert!(sd_notify("READY=1").is_err());
    }

    #[test]
    fn test_watch_follows_the_open_file() {
        let (first, _first_writer) = rustix::pipe::pipe().unwrap();
        let (second, _second_writer) = rustix::pipe::pipe().unwrap();
        let key = FileKey::of(first.as_fd()).unwrap();

        let mut watch = Watched::default();
        assert!(watch.is_current(None));
        assert!(!watch.is_current(Some(key)));
        watch.set(key, 1u32);

        // A dup of the same pipe keeps the registration
        let dup = first.try_clone().unwrap();
        assert!(watch.is_current(Some(FileKey::of(dup.as_fd()).unwrap())));

        // Another transfer, or none, replaces it
        assert!(!watch.is_current(Some(FileKey::of(second.as_fd()).unwrap())));
        assert!(!watch.is_current(None));
        assert_eq!(watch.take(), Some(1));
        assert_eq!(watch.take(), None);
        assert!(watch.is_current(None));
    }

    #[test]
    fn test_next_transfer_is_a_new_file() {
        let (reader, writer) = rustix::pipe::pipe().unwrap();
        let old = FileKey::of(reader.as_fd()).unwrap();
        drop(reader);
        drop(writer);

        // Usually lands on the same fd number
        let (reader, writer) = rustix::pipe::pipe().unwrap();
        let new = FileKey::of(reader.as_fd()).unwrap();
        assert_ne!(old, new);
        assert_eq!(new, FileKey::of(writer.as_fd()).unwrap());
    }

    #[test]
    fn test_open_channel_without_device() {
        let config = RelayConfig::default();
        assert!(open_channel(&config).unwrap().is_none());
    }
}
