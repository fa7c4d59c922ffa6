//! Host global registry and exposure policy
//!
//! Every global the host advertises is looked up in a fixed policy table
//! that decides whether the guest sees it (possibly under another
//! interface), whether the relay binds it for its own use, and at which
//! version. Globals outside the table are ignored.

use crate::error::RelayError;
use crate::transport::ShmDriver;
use log::{debug, info};
use std::collections::BTreeMap;

/// Host globals the relay binds for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalGlobal {
    Compositor,
    Shm,
    Output,
    Seat,
    DataDeviceManager,
    XdgWmBase,
    AuraShell,
    Viewporter,
    LinuxDmabuf,
    KeyboardExtension,
}

/// How a host global is presented to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFace {
    pub interface: &'static str,
    pub version: u32,
}

/// Decision for one host global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalPolicy {
    /// Version bound internally: `min(advertised, cap)`
    pub version: u32,
    pub guest: Option<GuestFace>,
    pub internal: Option<InternalGlobal>,
}

/// Startup facts the policy depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyContext {
    pub xwayland: bool,
    pub shm_driver: ShmDriver,
    /// A render node is configured, so `wl_drm` can be offered
    pub drm_device: bool,
}

struct Entry {
    interface: &'static str,
    min: u32,
    cap: u32,
    guest: Guest,
    internal: Option<InternalGlobal>,
}

enum Guest {
    Never,
    Always,
    WithoutX,
    As(&'static str, u32),
    AsWithDrm(&'static str, u32),
}

const POLICY: &[Entry] = &[
    Entry {
        interface: "wl_compositor",
        min: 3,
        cap: 3,
        guest: Guest::Always,
        internal: Some(InternalGlobal::Compositor),
    },
    Entry {
        interface: "wl_subcompositor",
        min: 1,
        cap: 1,
        guest: Guest::Always,
        internal: None,
    },
    Entry {
        interface: "wl_shm",
        min: 1,
        cap: 1,
        guest: Guest::Always,
        internal: Some(InternalGlobal::Shm),
    },
    Entry {
        interface: "wl_shell",
        min: 1,
        cap: 1,
        guest: Guest::Always,
        internal: None,
    },
    Entry {
        interface: "wl_output",
        min: 1,
        cap: 3,
        guest: Guest::Always,
        internal: Some(InternalGlobal::Output),
    },
    Entry {
        interface: "wl_seat",
        min: 1,
        cap: 5,
        guest: Guest::Always,
        internal: Some(InternalGlobal::Seat),
    },
    Entry {
        interface: "wl_data_device_manager",
        min: 1,
        cap: 3,
        guest: Guest::WithoutX,
        internal: Some(InternalGlobal::DataDeviceManager),
    },
    Entry {
        interface: "xdg_wm_base",
        min: 1,
        cap: 1,
        guest: Guest::WithoutX,
        internal: Some(InternalGlobal::XdgWmBase),
    },
    Entry {
        interface: "zaura_shell",
        min: 6,
        cap: 6,
        guest: Guest::As("gtk_shell1", 1),
        internal: Some(InternalGlobal::AuraShell),
    },
    Entry {
        interface: "wp_viewporter",
        min: 1,
        cap: 1,
        guest: Guest::Never,
        internal: Some(InternalGlobal::Viewporter),
    },
    Entry {
        interface: "zwp_linux_dmabuf_v1",
        min: 2,
        cap: 2,
        guest: Guest::AsWithDrm("wl_drm", 2),
        internal: Some(InternalGlobal::LinuxDmabuf),
    },
    Entry {
        interface: "zcr_keyboard_extension_v1",
        min: 1,
        cap: 1,
        guest: Guest::Never,
        internal: Some(InternalGlobal::KeyboardExtension),
    },
];

/// Decides what to do with a host global, or `None` to ignore it
pub fn policy(interface: &str, version: u32, ctx: &PolicyContext) -> Option<GlobalPolicy> {
    let entry = POLICY.iter().find(|e| e.interface == interface)?;
    if version < entry.min {
        debug!(
            "Ignoring {} v{}: at least v{} is required",
            interface, version, entry.min
        );
        return None;
    }
    let bound = version.min(entry.cap);
    let guest = match entry.guest {
        Guest::Never => None,
        Guest::Always => Some(GuestFace {
            interface: entry.interface,
            version: bound,
        }),
        Guest::WithoutX if ctx.xwayland => None,
        Guest::WithoutX => Some(GuestFace {
            interface: entry.interface,
            version: bound,
        }),
        Guest::As(name, version) => Some(GuestFace {
            interface: name,
            version,
        }),
        Guest::AsWithDrm(name, version) if ctx.drm_device => Some(GuestFace {
            interface: name,
            version,
        }),
        Guest::AsWithDrm(..) => None,
    };
    // Clipboard bridging only needs the data device manager with X.
    let internal = match entry.internal {
        Some(InternalGlobal::DataDeviceManager) if !ctx.xwayland => None,
        other => other,
    };
    Some(GlobalPolicy {
        version: bound,
        guest,
        internal,
    })
}

/// One global advertised by the host
#[derive(Debug, Clone, PartialEq)]
pub struct HostGlobal<G> {
    pub name: u32,
    pub interface: String,
    pub version: u32,
    pub policy: GlobalPolicy,
    /// Guest-side global, once created
    pub guest: Option<G>,
}

/// Host globals currently advertised, keyed by host name
pub struct Registry<G> {
    globals: BTreeMap<u32, HostGlobal<G>>,
}

impl<G> Default for Registry<G> {
    fn default() -> Self {
        Self {
            globals: BTreeMap::new(),
        }
    }
}

impl<G: Clone> Registry<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a `wl_registry.global` event; `None` if it is ignored
    pub fn add(
        &mut self,
        name: u32,
        interface: &str,
        version: u32,
        ctx: &PolicyContext,
    ) -> Option<&mut HostGlobal<G>> {
        let policy = policy(interface, version, ctx)?;
        info!(
            "🌐 Host global {} {} v{} (bound at v{}{})",
            name,
            interface,
            version,
            policy.version,
            match policy.guest {
                Some(face) if face.interface != interface => format!(", guest sees {}", face.interface),
                Some(_) => String::new(),
                None => ", internal".to_string(),
            }
        );
        self.globals.insert(
            name,
            HostGlobal {
                name,
                interface: interface.to_string(),
                version,
                policy,
                guest: None,
            },
        );
        self.globals.get_mut(&name)
    }

    /// Records a `wl_registry.global_remove` event
    pub fn remove(&mut self, name: u32) -> Option<HostGlobal<G>> {
        let removed = self.globals.remove(&name);
        if let Some(global) = &removed {
            info!("🗑️ Host global {} {} removed", name, global.interface);
        }
        removed
    }

    pub fn get(&self, name: u32) -> Option<&HostGlobal<G>> {
        self.globals.get(&name)
    }

    pub fn get_mut(&mut self, name: u32) -> Option<&mut HostGlobal<G>> {
        self.globals.get_mut(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostGlobal<G>> {
        self.globals.values()
    }

    /// The first host global serving an internal role
    pub fn internal(&self, which: InternalGlobal) -> Option<&HostGlobal<G>> {
        self.globals
            .values()
            .find(|g| g.policy.internal == Some(which))
    }

    /// Checks the globals that must exist once the host's initial
    /// announcements are complete
    pub fn check_required(&self, shm_driver: ShmDriver) -> Result<(), RelayError> {
        let compositor = self.globals.values().find(|g| g.interface == "wl_compositor");
        match compositor {
            None => return Err(RelayError::MissingGlobal("wl_compositor")),
            Some(g) if g.version < 3 => {
                return Err(RelayError::GlobalTooOld {
                    interface: "wl_compositor",
                    version: g.version,
                    required: 3,
                })
            }
            Some(_) => {}
        }
        if shm_driver.copies() && self.internal(InternalGlobal::Shm).is_none() {
            return Err(RelayError::MissingGlobal("wl_shm"));
        }
        if matches!(shm_driver, ShmDriver::Dmabuf | ShmDriver::VirtwlDmabuf)
            && self.internal(InternalGlobal::LinuxDmabuf).is_none()
        {
            return Err(RelayError::MissingGlobal("zwp_linux_dmabuf_v1"));
        }
        Ok(())
    }
}
