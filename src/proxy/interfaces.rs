//! Interface descriptors and object kinds
//!
//! Both sides of the relay share the client-side interface statics: host
//! objects are created from them and guest globals are advertised with them,
//! so a child interface reached through a request descriptor is the same
//! static on either connection.

use crate::protocols::{aura, drm, gtk, keyboard_extension};
use wayland_backend::protocol::Interface;
use wayland_client::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_data_device, wl_data_device_manager, wl_data_offer,
    wl_data_source, wl_keyboard, wl_output, wl_pointer, wl_region, wl_seat, wl_shell,
    wl_shell_surface, wl_shm, wl_shm_pool, wl_subcompositor, wl_subsurface, wl_surface, wl_touch,
};
use wayland_client::Proxy;
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};
use wayland_protocols::wp::viewporter::client::{wp_viewport, wp_viewporter};
use wayland_protocols::xdg::shell::client::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};

/// Finds the descriptor of a protocol interface the relay understands
pub fn lookup(name: &str) -> Option<&'static Interface> {
    Some(match name {
        "wl_compositor" => wl_compositor::WlCompositor::interface(),
        "wl_surface" => wl_surface::WlSurface::interface(),
        "wl_region" => wl_region::WlRegion::interface(),
        "wl_callback" => wl_callback::WlCallback::interface(),
        "wl_subcompositor" => wl_subcompositor::WlSubcompositor::interface(),
        "wl_subsurface" => wl_subsurface::WlSubsurface::interface(),
        "wl_shm" => wl_shm::WlShm::interface(),
        "wl_shm_pool" => wl_shm_pool::WlShmPool::interface(),
        "wl_buffer" => wl_buffer::WlBuffer::interface(),
        "wl_shell" => wl_shell::WlShell::interface(),
        "wl_shell_surface" => wl_shell_surface::WlShellSurface::interface(),
        "wl_output" => wl_output::WlOutput::interface(),
        "wl_seat" => wl_seat::WlSeat::interface(),
        "wl_pointer" => wl_pointer::WlPointer::interface(),
        "wl_keyboard" => wl_keyboard::WlKeyboard::interface(),
        "wl_touch" => wl_touch::WlTouch::interface(),
        "wl_data_device_manager" => wl_data_device_manager::WlDataDeviceManager::interface(),
        "wl_data_device" => wl_data_device::WlDataDevice::interface(),
        "wl_data_source" => wl_data_source::WlDataSource::interface(),
        "wl_data_offer" => wl_data_offer::WlDataOffer::interface(),
        "xdg_wm_base" => xdg_wm_base::XdgWmBase::interface(),
        "xdg_surface" => xdg_surface::XdgSurface::interface(),
        "xdg_toplevel" => xdg_toplevel::XdgToplevel::interface(),
        "xdg_popup" => xdg_popup::XdgPopup::interface(),
        "xdg_positioner" => xdg_positioner::XdgPositioner::interface(),
        "wp_viewporter" => wp_viewporter::WpViewporter::interface(),
        "wp_viewport" => wp_viewport::WpViewport::interface(),
        "zwp_linux_dmabuf_v1" => zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1::interface(),
        "zwp_linux_buffer_params_v1" => {
            zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1::interface()
        }
        "zaura_shell" => aura::zaura_shell::ZauraShell::interface(),
        "zaura_surface" => aura::zaura_surface::ZauraSurface::interface(),
        "zaura_output" => aura::zaura_output::ZauraOutput::interface(),
        "gtk_shell1" => gtk::gtk_shell1::GtkShell1::interface(),
        "gtk_surface1" => gtk::gtk_surface1::GtkSurface1::interface(),
        "zcr_keyboard_extension_v1" => {
            keyboard_extension::zcr_keyboard_extension_v1::ZcrKeyboardExtensionV1::interface()
        }
        "zcr_extended_keyboard_v1" => {
            keyboard_extension::zcr_extended_keyboard_v1::ZcrExtendedKeyboardV1::interface()
        }
        "wl_drm" => drm::wl_drm::WlDrm::interface(),
        _ => return None,
    })
}

/// What a proxied object is, decided once from its interface name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Compositor,
    Surface,
    Region,
    Callback,
    Subcompositor,
    Subsurface,
    Shm,
    ShmPool,
    Buffer,
    Shell,
    ShellSurface,
    Output,
    Seat,
    Pointer,
    Keyboard,
    Touch,
    DataDeviceManager,
    DataDevice,
    DataSource,
    DataOffer,
    XdgWmBase,
    XdgSurface,
    XdgToplevel,
    XdgPopup,
    XdgPositioner,
    GtkShell,
    GtkSurface,
    Drm,
    /// Forwarded verbatim
    Other,
}

impl ObjectKind {
    pub fn of(interface: &Interface) -> Self {
        Self::from_name(interface.name)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "wl_compositor" => ObjectKind::Compositor,
            "wl_surface" => ObjectKind::Surface,
            "wl_region" => ObjectKind::Region,
            "wl_callback" => ObjectKind::Callback,
            "wl_subcompositor" => ObjectKind::Subcompositor,
            "wl_subsurface" => ObjectKind::Subsurface,
            "wl_shm" => ObjectKind::Shm,
            "wl_shm_pool" => ObjectKind::ShmPool,
            "wl_buffer" => ObjectKind::Buffer,
            "wl_shell" => ObjectKind::Shell,
            "wl_shell_surface" => ObjectKind::ShellSurface,
            "wl_output" => ObjectKind::Output,
            "wl_seat" => ObjectKind::Seat,
            "wl_pointer" => ObjectKind::Pointer,
            "wl_keyboard" => ObjectKind::Keyboard,
            "wl_touch" => ObjectKind::Touch,
            "wl_data_device_manager" => ObjectKind::DataDeviceManager,
            "wl_data_device" => ObjectKind::DataDevice,
            "wl_data_source" => ObjectKind::DataSource,
            "wl_data_offer" => ObjectKind::DataOffer,
            "xdg_wm_base" => ObjectKind::XdgWmBase,
            "xdg_surface" => ObjectKind::XdgSurface,
            "xdg_toplevel" => ObjectKind::XdgToplevel,
            "xdg_popup" => ObjectKind::XdgPopup,
            "xdg_positioner" => ObjectKind::XdgPositioner,
            "gtk_shell1" => ObjectKind::GtkShell,
            "gtk_surface1" => ObjectKind::GtkSurface,
            "wl_drm" => ObjectKind::Drm,
            _ => ObjectKind::Other,
        }
    }

    /// Whether a surface given this role counts as having a shell role
    pub fn is_shell_role(&self) -> bool {
        matches!(
            self,
            ObjectKind::XdgSurface | ObjectKind::ShellSurface | ObjectKind::Subsurface
        )
    }
}

/// Opcode of the interface's destructor request usable at `version`, if any
pub fn destructor(interface: &Interface, version: u32) -> Option<u16> {
    interface
        .requests
        .iter()
        .position(|desc| desc.is_destructor && desc.since <= version)
        .map(|opcode| opcode as u16)
}
