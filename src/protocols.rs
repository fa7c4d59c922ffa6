//! Protocol extensions that are not part of `wayland-protocols`
//!
//! Generated from the XML files under `protocols/`. Only client-side code is
//! generated: the interface descriptions are shared by both sides of the
//! relay, so guest-facing globals are created from the same statics.

#![allow(non_upper_case_globals, non_camel_case_types, unused_imports, clippy::all)]

/// Window frames, application ids and output scale (`zaura_shell`)
pub mod aura {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/aura-shell.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/aura-shell.xml");
}

/// GTK shell integration offered to guests in place of aura (`gtk_shell1`)
pub mod gtk {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/gtk-shell.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/gtk-shell.xml");
}

/// Synchronous key acknowledgement (`zcr_keyboard_extension_v1`)
pub mod keyboard_extension {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/keyboard-extension.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/keyboard-extension.xml");
}

/// Mesa's `wl_drm`, served to the guest for prime buffer import
pub mod drm {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/wayland-drm.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/wayland-drm.xml");
}
