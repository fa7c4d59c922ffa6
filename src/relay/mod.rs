//! The relay
//!
//! [`Relay`] is the state shared by the guest-facing server and the
//! host-facing client. Guest requests arrive through [`GuestData`] with
//! `&mut Relay`; host events are queued by the host connection and drained
//! by [`Relay::dispatch_host`]. Most messages are forwarded generically:
//! arguments are translated through the object table, rescaled, then sent on
//! the counterpart object. The submodules handle the messages the relay has
//! to understand itself.

mod data;
mod globals;
mod gtk;
pub mod host;
mod input;
mod outputs;
mod shell;
mod surfaces;

pub use host::{HostConnection, HostMessage};
pub use shell::XState;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::geometry::Scale;
use crate::proxy::{destructor, rescale, translate, Direction, GuestId, HostId, HostRoute, ObjectKind, ObjectTable};
use crate::registry::{InternalGlobal, PolicyContext, Registry};
use crate::seat::{Accelerator, SeatState};
use crate::surface::ShmBuffer;
use crate::transport::channel::ChannelDevice;
use crate::transport::{BufferBackend, DataDriver, SharedMmap, ShmDriver};
use anyhow::{Context, Result};
use data::HostDataDevice;
use log::{debug, error, info, trace, warn};
use outputs::OutputRecord;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use surfaces::SurfaceState;
use wayland_backend::protocol::{Argument, Message};
use wayland_backend::server::{
    ClientData, ClientId, DisconnectReason, GlobalHandler, GlobalId, Handle, ObjectData,
};
use xkbcommon::xkb;

/// A request received from a guest client
pub type GuestMessage = Message<GuestId, OwnedFd>;

/// Arguments of an event about to be sent to a guest
pub type GuestArgs = Vec<Argument<GuestId, RawFd>>;

/// What a host object the relay created for itself is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Registry,
    /// The `wl_display.sync` sent right after the registry request
    InitialSync,
    Global(InternalGlobal),
    Output { name: u32 },
    AuraOutput { name: u32 },
    XdgSurface { window: u32 },
    Toplevel { window: u32 },
    Popup { window: u32 },
    Positioner,
    AuraSurface,
    Viewport,
    /// Host buffer holding copied contents of a guest surface
    OutputBuffer,
    ExtendedKeyboard,
    DataDevice,
    DataOffer,
    DataSource,
}

/// Relay settings resolved from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOptions {
    pub xwayland: bool,
    pub shm_driver: ShmDriver,
    pub data_driver: DataDriver,
    pub drm_device: Option<PathBuf>,
    /// Requested guest-to-host scale
    pub scale: f64,
    pub dpi: Vec<i32>,
    pub accelerators: Vec<Accelerator>,
    pub application_id: Option<String>,
    pub frame_color: Option<u32>,
    pub clipboard_manager: bool,
}

impl RelayOptions {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            xwayland: config.xwayland.enabled,
            shm_driver: config.shm_driver()?,
            data_driver: config.data_driver()?,
            drm_device: config.transport.drm_device.clone(),
            scale: config.scale.scale,
            dpi: config.scale.dpi.clone(),
            accelerators: config.accelerators()?,
            application_id: config.window.application_id.clone(),
            frame_color: config.frame_color()?,
            clipboard_manager: config.clipboard_manager(),
        })
    }

    fn policy(&self) -> PolicyContext {
        PolicyContext {
            xwayland: self.xwayland,
            shm_driver: self.shm_driver,
            drm_device: self.drm_device.is_some(),
        }
    }
}

/// Per-client data; records the disconnect for the event loop
#[derive(Debug, Default)]
pub struct GuestClient {
    gone: AtomicBool,
}

impl GuestClient {
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }
}

impl ClientData for GuestClient {
    fn initialized(&self, client_id: ClientId) {
        debug!("Guest client {:?} connected", client_id);
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        info!("👋 Guest client {:?} disconnected: {:?}", client_id, reason);
        self.gone.store(true, Ordering::SeqCst);
    }
}

/// Object data of every guest object
struct GuestData;

impl ObjectData<Relay> for GuestData {
    fn request(
        self: Arc<Self>,
        _handle: &Handle,
        relay: &mut Relay,
        client: ClientId,
        msg: GuestMessage,
    ) -> Option<Arc<dyn ObjectData<Relay>>> {
        let creates = msg.args.iter().any(|arg| matches!(arg, Argument::NewId(_)));
        relay.guest_request(client, msg);
        creates.then(move || self as Arc<dyn ObjectData<Relay>>)
    }

    fn destroyed(self: Arc<Self>, _handle: &Handle, relay: &mut Relay, _client: ClientId, object: GuestId) {
        relay.guest_destroyed(object);
    }
}

/// A host global re-advertised to guests
struct GlobalProxy {
    name: u32,
}

impl GlobalHandler<Relay> for GlobalProxy {
    fn bind(
        self: Arc<Self>,
        _handle: &Handle,
        relay: &mut Relay,
        _client: ClientId,
        _global: GlobalId,
        object: GuestId,
    ) -> Arc<dyn ObjectData<Relay>> {
        relay.bind_global(self.name, object);
        Arc::new(GuestData)
    }
}

/// Relay state
pub struct Relay {
    host: HostConnection,
    handle: Handle,
    options: RelayOptions,
    policy: PolicyContext,
    /// Scale asked for; the effective one depends on the viewporter
    desired_scale: f64,
    scale: Scale,
    objects: ObjectTable<GuestId, HostId, Role>,
    registry: Registry<GlobalId>,
    registry_id: HostId,
    internal: HashMap<InternalGlobal, HostId>,
    transport: Box<dyn BufferBackend>,
    surfaces: HashMap<GuestId, SurfaceState>,
    shm_pools: HashMap<GuestId, SharedMmap>,
    shm_buffers: HashMap<GuestId, ShmBuffer>,
    /// Sizes of buffers the host reads directly
    direct_buffers: HashMap<GuestId, (u32, u32)>,
    outputs: BTreeMap<u32, OutputRecord>,
    seat: SeatState,
    pointer_surface: Option<GuestId>,
    keyboard_surface: Option<GuestId>,
    xkb: xkb::Context,
    /// Host keyboard to its extended keyboard
    extended_keyboards: HashMap<HostId, HostId>,
    /// Guest gtk_surface1 to the aura surface backing it
    gtk_surfaces: HashMap<GuestId, Option<HostId>>,
    gtk_startup_id: Option<String>,
    x_client: Option<ClientId>,
    x: Option<XState>,
    data: HostDataDevice,
    clients: Vec<Arc<GuestClient>>,
    synced: bool,
    error: Option<anyhow::Error>,
}

impl Relay {
    /// Starts talking to the host: requests the registry and a sync that
    /// marks the end of the initial globals
    pub fn new(
        host: HostConnection,
        handle: Handle,
        options: RelayOptions,
        transport: Box<dyn BufferBackend>,
        channel: Option<Rc<ChannelDevice>>,
    ) -> Result<Self> {
        let display = host.display();
        let registry_id = host
            .send(&display, "get_registry", vec![Argument::NewId(HostId::null())])?
            .context("wl_display.get_registry created nothing")?;
        let sync = host
            .send(&display, "sync", vec![Argument::NewId(HostId::null())])?
            .context("wl_display.sync created nothing")?;

        let mut objects = ObjectTable::new();
        objects.insert_internal(registry_id.clone(), Role::Registry);
        objects.insert_internal(sync, Role::InitialSync);

        info!(
            "🍷 Relay starting: {} transport, scale {}{}",
            transport.name(),
            options.scale,
            if options.xwayland { ", Xwayland" } else { "" }
        );

        Ok(Self {
            data: HostDataDevice::new(host.clone(), options.data_driver, channel),
            host,
            handle,
            policy: options.policy(),
            desired_scale: options.scale,
            scale: Scale::new(options.scale, false),
            options,
            objects,
            registry: Registry::new(),
            registry_id,
            internal: HashMap::new(),
            transport,
            surfaces: HashMap::new(),
            shm_pools: HashMap::new(),
            shm_buffers: HashMap::new(),
            direct_buffers: HashMap::new(),
            outputs: BTreeMap::new(),
            seat: SeatState::new(),
            pointer_surface: None,
            keyboard_surface: None,
            xkb: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            extended_keyboards: HashMap::new(),
            gtk_surfaces: HashMap::new(),
            gtk_startup_id: None,
            x_client: None,
            x: None,
            clients: Vec::new(),
            synced: false,
            error: None,
        })
    }

    pub fn host(&self) -> &HostConnection {
        &self.host
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn scale(&self) -> &Scale {
        &self.scale
    }

    /// Whether the initial host globals have all been seen
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Replaces the requested scale; used once Xwayland's scale is known
    pub fn set_scale(&mut self, desired: f64) {
        self.desired_scale = desired;
        self.scale = Scale::new(desired, self.internal.contains_key(&InternalGlobal::Viewporter));
        if let Some(x) = &mut self.x {
            x.xwm.scale = self.scale.factor();
        }
        self.report_outputs();
        info!("🔍 Scale set to {}", self.scale.factor());
    }

    /// Data for a new guest client; `xwayland` marks the Xwayland connection
    pub fn new_client(&mut self, xwayland: bool) -> Arc<GuestClient> {
        let client = Arc::new(GuestClient::default());
        self.clients.push(client.clone());
        if xwayland {
            debug!("Next guest client is Xwayland");
        }
        client
    }

    /// Remembers which guest client is Xwayland
    pub fn set_x_client(&mut self, client: ClientId) {
        self.x_client = Some(client);
    }

    /// Whether any guest client has disconnected
    pub fn client_gone(&self) -> bool {
        self.clients.iter().any(|client| client.is_gone())
    }

    /// The first fatal error hit while handling messages
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    fn fail(&mut self, error: anyhow::Error) {
        error!("❌ {:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Kills the guest connection owning `object` with a protocol error
    fn post_error(&self, object: &GuestId, code: u32, message: &str) {
        warn!("Protocol error on {}: {}", object, message);
        self.handle
            .post_error(object.clone(), code, CString::new(message).unwrap_or_default());
    }

    fn is_x_client(&self, client: &ClientId) -> bool {
        self.x_client.as_ref() == Some(client)
    }

    fn guest_version(&self, guest: &GuestId) -> u32 {
        self.handle
            .object_info(guest.clone())
            .map(|info| info.version)
            .unwrap_or(1)
    }

    /// Sends the event called `event` to a guest object; events newer than
    /// the bound version are skipped
    fn send_guest(&self, target: &GuestId, event: &str, args: GuestArgs) {
        let interface = target.interface();
        let Some((opcode, desc)) = interface
            .events
            .iter()
            .enumerate()
            .find(|(_, desc)| desc.name == event)
        else {
            warn!("{} has no event {}", interface.name, event);
            return;
        };
        if desc.since > self.guest_version(target) {
            return;
        }
        let msg = Message {
            sender_id: target.clone(),
            opcode: opcode as u16,
            args: args.into(),
        };
        if self.handle.send_event(msg).is_err() {
            debug!("{}.{} to a dead guest object", interface.name, event);
        }
    }

    /// Sends a host object's destructor if its interface has one
    fn destroy_host(&self, host: &HostId) {
        let Some(interface) = self.host.interface(host) else {
            return;
        };
        if let Some(opcode) = destructor(interface, self.host.version(host)) {
            if let Err(e) = self.host.send_raw(host, opcode, Vec::new(), None) {
                debug!("Destroying {}: {:#}", interface.name, e);
            }
        }
    }

    fn guest_request(&mut self, client: ClientId, msg: GuestMessage) {
        let sender = msg.sender_id.clone();
        let Some(kind) = self.objects.kind(&sender) else {
            debug!("Request on unknown guest object {}", sender);
            return;
        };
        let Some(request) = sender.interface().requests.get(msg.opcode as usize).map(|d| d.name) else {
            return;
        };
        trace!("→ {}.{}", sender, request);

        let result = match (kind, request) {
            (ObjectKind::Compositor, _) => self.compositor_request(msg, request),
            (ObjectKind::Surface, _) => self.surface_request(msg, request),
            (ObjectKind::Shm, _) => self.shm_request(msg, request),
            (ObjectKind::ShmPool, _) => self.shm_pool_request(msg, request),
            (ObjectKind::Seat, _) => self.seat_request(msg, request),
            (ObjectKind::Keyboard, "release") => {
                self.keyboard_destroyed(&sender);
                self.forward(msg)
            }
            (ObjectKind::Pointer, "set_cursor")
            | (ObjectKind::XdgWmBase, "get_xdg_surface")
            | (ObjectKind::Shell, "get_shell_surface")
            | (ObjectKind::Subcompositor, "get_subsurface") => self.role_request(msg),
            (ObjectKind::GtkShell, _) => self.gtk_shell_request(client, msg, request),
            (ObjectKind::GtkSurface, _) => self.gtk_surface_request(msg, request),
            (ObjectKind::Drm, _) => self.drm_request(msg, request),
            (ObjectKind::Output, _) => Ok(()),
            _ => self.forward(msg),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Requests whose second argument is a surface that gets a role
    fn role_request(&mut self, msg: GuestMessage) -> Result<()> {
        if let Some(surface) = arg_object(&msg.args, 1) {
            if let Some(state) = self.surfaces.get_mut(&surface) {
                state.has_role = true;
            }
        }
        self.forward(msg)
    }

    fn forward(&mut self, msg: GuestMessage) -> Result<()> {
        self.forward_request(msg).map(|_| ())
    }

    /// Forwards a guest request to the paired host object. Returns the
    /// guest and host objects it created, if any.
    fn forward_request(&mut self, msg: GuestMessage) -> Result<Option<(GuestId, HostId)>> {
        let Message {
            sender_id: sender,
            opcode,
            args,
        } = msg;
        let interface = sender.interface();
        let desc = interface
            .requests
            .get(opcode as usize)
            .with_context(|| format!("{} has no request {}", interface.name, opcode))?;
        let Some(host) = self.objects.host_of(&sender) else {
            trace!("Dropping {}.{}: no host object", interface.name, desc.name);
            return Ok(None);
        };

        let objects = &self.objects;
        let mut translated = translate(args, |guest| objects.host_of(guest), |_| Some(HostId::null()))
            .map_err(|unresolved| {
                RelayError::protocol(
                    interface.name,
                    format!("{} argument {} has no host object", desc.name, unresolved.position),
                )
            })?;
        rescale(&mut translated.args, interface.name, desc.name, Direction::ToHost, &self.scale);

        let version = self.host.version(&host);
        let child = desc.child_interface.map(|child| (child, version));
        let created = self.host.send_raw(&host, opcode, translated.args, child)?;
        drop(translated.fds);
        if desc.is_destructor {
            self.objects.detach_host(&sender);
        }

        Ok(match (translated.new_id, created) {
            (Some(guest), Some(host)) => {
                let kind = ObjectKind::of(guest.interface());
                self.objects.pair(guest.clone(), kind, self.guest_version(&guest), host.clone());
                Some((guest, host))
            }
            _ => None,
        })
    }

    /// Forwards a host event to the paired guest object
    fn forward_event(&mut self, guest: GuestId, msg: HostMessage) -> Result<()> {
        let Message { sender_id, opcode, args } = msg;
        let interface = sender_id.interface();
        let Some(desc) = interface.events.get(opcode as usize) else {
            return Ok(());
        };
        let version = self.guest_version(&guest);
        if desc.since > version {
            return Ok(());
        }
        let Ok(client) = self.handle.get_client(guest.clone()) else {
            return Ok(());
        };

        let handle = &self.handle;
        let objects = &self.objects;
        let translated = translate(
            args,
            |host| objects.guest_of(host),
            |_| {
                let child = desc.child_interface?;
                handle
                    .create_object::<Relay>(client.clone(), child, version, Arc::new(GuestData))
                    .ok()
            },
        );
        let mut translated = match translated {
            Ok(translated) => translated,
            Err(unresolved) => {
                debug!(
                    "Dropping {}.{}: argument {} has no guest object",
                    interface.name, desc.name, unresolved.position
                );
                return Ok(());
            }
        };
        rescale(&mut translated.args, interface.name, desc.name, Direction::ToGuest, &self.scale);

        let created = translated.args.iter().find_map(|arg| match arg {
            Argument::NewId(id) => Some(id.clone()),
            _ => None,
        });
        let msg = Message {
            sender_id: guest,
            opcode,
            args: translated.args.into(),
        };
        if self.handle.send_event(msg).is_err() {
            debug!("{}.{} to a dead guest object", interface.name, desc.name);
        }
        drop(translated.fds);

        if let (Some(host), Some(created)) = (translated.new_id, created) {
            self.objects.pair(created, ObjectKind::of(host.interface()), version, host);
        }
        Ok(())
    }

    /// Handles every queued host event
    pub fn dispatch_host(&mut self) {
        for msg in self.host.take_events() {
            self.host_event(msg);
        }
        self.sync_data_objects();
    }

    fn host_event(&mut self, msg: HostMessage) {
        let sender = msg.sender_id.clone();
        let Some(desc) = sender.interface().events.get(msg.opcode as usize) else {
            return;
        };
        let (event, destructor) = (desc.name, desc.is_destructor);
        trace!("← {}.{}", sender, event);

        let result = match self.objects.route(&sender).cloned() {
            Some(HostRoute::Guest(guest)) => self.guest_event(guest, msg, event),
            Some(HostRoute::Internal(role)) => self.internal_event(role, msg, event),
            None => {
                trace!("Unrouted host event {}.{}", sender.interface().name, event);
                Ok(())
            }
        };
        if destructor {
            self.objects.remove_host(&sender);
        }
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn guest_event(&mut self, guest: GuestId, msg: HostMessage, event: &str) -> Result<()> {
        match self.objects.kind(&guest) {
            Some(ObjectKind::Surface) if event == "enter" || event == "leave" => {
                self.surface_output_event(&guest, &msg, event);
                Ok(())
            }
            Some(ObjectKind::Pointer) => self.pointer_event(guest, msg, event),
            Some(ObjectKind::Keyboard) => self.keyboard_event(guest, msg, event),
            Some(ObjectKind::Touch) => self.touch_event(guest, msg, event),
            _ => self.forward_event(guest, msg),
        }
    }

    fn internal_event(&mut self, role: Role, msg: HostMessage, event: &str) -> Result<()> {
        match role {
            Role::Registry => self.registry_event(&msg, event),
            Role::InitialSync => self.initial_sync(),
            Role::Output { name } => {
                self.output_event(name, &msg, event);
                Ok(())
            }
            Role::AuraOutput { name } => {
                self.aura_output_event(name, &msg, event);
                Ok(())
            }
            Role::OutputBuffer if event == "release" => {
                self.output_buffer_released(&msg.sender_id);
                Ok(())
            }
            Role::Global(InternalGlobal::XdgWmBase) if event == "ping" => {
                self.host
                    .send(&msg.sender_id, "pong", vec![Argument::Uint(arg_uint(&msg.args, 0))])?;
                Ok(())
            }
            Role::XdgSurface { .. } | Role::Toplevel { .. } | Role::Popup { .. } => {
                self.shell_event(role, &msg, event);
                Ok(())
            }
            Role::DataDevice | Role::DataOffer | Role::DataSource => self.data_event(role, msg, event),
            _ => Ok(()),
        }
    }

    fn guest_destroyed(&mut self, id: GuestId) {
        match self.objects.kind(&id) {
            Some(ObjectKind::Surface) => self.surface_destroyed(&id),
            Some(ObjectKind::ShmPool) => {
                self.shm_pools.remove(&id);
            }
            Some(ObjectKind::Buffer) => {
                self.shm_buffers.remove(&id);
                self.direct_buffers.remove(&id);
            }
            Some(ObjectKind::Keyboard) => self.keyboard_destroyed(&id),
            Some(ObjectKind::GtkSurface) => self.gtk_surface_destroyed(&id),
            _ => {}
        }
        let Some(entry) = self.objects.remove_guest(&id) else {
            return;
        };
        if let Some(host) = entry.host {
            self.destroy_host(&host);
        }
    }
}

pub(crate) fn arg_uint<I, F>(args: &[Argument<I, F>], index: usize) -> u32 {
    match args.get(index) {
        Some(Argument::Uint(value)) => *value,
        Some(Argument::Int(value)) => *value as u32,
        _ => 0,
    }
}

pub(crate) fn arg_int<I, F>(args: &[Argument<I, F>], index: usize) -> i32 {
    match args.get(index) {
        Some(Argument::Int(value)) | Some(Argument::Fixed(value)) => *value,
        Some(Argument::Uint(value)) => *value as i32,
        _ => 0,
    }
}

pub(crate) fn arg_str<I, F>(args: &[Argument<I, F>], index: usize) -> Option<String> {
    match args.get(index) {
        Some(Argument::Str(Some(value))) => Some(value.to_string_lossy().into_owned()),
        _ => None,
    }
}

pub(crate) fn arg_object<I: Clone, F>(args: &[Argument<I, F>], index: usize) -> Option<I> {
    match args.get(index) {
        Some(Argument::Object(id)) | Some(Argument::NewId(id)) => Some(id.clone()),
        _ => None,
    }
}

pub(crate) fn arg_array<I, F>(args: &[Argument<I, F>], index: usize) -> &[u8] {
    match args.get(index) {
        Some(Argument::Array(array)) => array.as_slice(),
        _ => &[],
    }
}

pub(crate) fn str_arg<I, F>(value: &str) -> Argument<I, F> {
    Argument::Str(Some(Box::new(CString::new(value).unwrap_or_default())))
}

pub(crate) fn opt_str_arg<I, F>(value: Option<&str>) -> Argument<I, F> {
    Argument::Str(value.map(|value| Box::new(CString::new(value).unwrap_or_default())))
}

/// Moves the first file descriptor out of an argument list
pub(crate) fn take_fd<I>(args: impl IntoIterator<Item = Argument<I, OwnedFd>>) -> Option<OwnedFd> {
    args.into_iter().find_map(|arg| match arg {
        Argument::Fd(fd) => Some(fd),
        _ => None,
    })
}
