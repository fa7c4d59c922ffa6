use super::requests::fake::FakeX;
use super::*;
use crate::window::{FrameType, SurfaceInfo, TOPLEVEL_STATE_ACTIVATED};
use std::collections::HashMap;

const WIN: u32 = 0x20_0001;
const OTHER: u32 = 0x20_0010;
const SCREEN: (i32, i32) = (1920, 1080);

/// Host shell stand-in: refs are small integers
#[derive(Default)]
struct FakeShell {
    surfaces: HashMap<u32, SurfaceInfo>,
    aura: bool,
    next_ref: u32,
    created: Vec<(&'static str, u32)>,
    positioners: Vec<Positioner>,
    requests: Vec<ShellRequest<u32>>,
}

impl FakeShell {
    fn object(&mut self, kind: &'static str, window: u32) -> Option<u32> {
        self.next_ref += 1;
        self.created.push((kind, window));
        Some(self.next_ref)
    }

    fn count(&self, kind: &str) -> usize {
        self.created.iter().filter(|(k, _)| *k == kind).count()
    }

    fn acks(&self) -> Vec<u32> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                ShellRequest::AckConfigure { serial, .. } => Some(*serial),
                _ => None,
            })
            .collect()
    }
}

impl Shell for FakeShell {
    type Ref = u32;

    fn surface(&self, surface_id: u32) -> Option<SurfaceInfo> {
        self.surfaces.get(&surface_id).copied()
    }

    fn has_aura(&self) -> bool {
        self.aura
    }

    fn get_xdg_surface(&mut self, window: u32, _surface_id: u32) -> Option<u32> {
        self.object("xdg_surface", window)
    }

    fn get_toplevel(&mut self, window: u32, _xdg_surface: &u32) -> Option<u32> {
        self.object("toplevel", window)
    }

    fn get_popup(&mut self, window: u32, _xdg: &u32, _parent: &u32, positioner: Positioner) -> Option<u32> {
        self.positioners.push(positioner);
        self.object("popup", window)
    }

    fn get_aura_surface(&mut self, surface_id: u32) -> Option<u32> {
        self.object("aura", surface_id)
    }

    fn send(&mut self, request: ShellRequest<u32>) {
        self.requests.push(request);
    }
}

fn setup() -> (Xwm<u32>, FakeX, FakeShell) {
    let xwm = Xwm::new(Atoms::sequential(), 0x100, SCREEN, 1.0, XwmOptions::default());
    (xwm, FakeX::new(), FakeShell::default())
}

fn motif_undecorated(x: &mut FakeX, window: u32, atoms: &Atoms) {
    x.properties.insert(
        (window, atoms._MOTIF_WM_HINTS),
        Property::from_words(atoms._MOTIF_WM_HINTS, &[hints::MWM_HINTS_DECORATIONS, 0, 0, 0, 0]),
    );
}

/// Creates, maps and pairs a managed window on surface `surface_id`
fn managed_window(xwm: &mut Xwm<u32>, x: &mut FakeX, shell: &mut FakeShell, id: u32, surface_id: u32, size: (i32, i32)) {
    x.geometries.insert(
        id,
        Geometry {
            rect: Rect::new(0, 0, size.0, size.1),
            border_width: 0,
            depth: 24,
        },
    );
    xwm.create_notify(x, id, Rect::new(0, 0, size.0, size.1), 0);
    xwm.map_request(x, id);
    shell.surfaces.insert(surface_id, SurfaceInfo::default());
    xwm.client_message(x, shell, id, xwm.atoms.WL_SURFACE_ID, [surface_id, 0, 0, 0, 0], None);
}

#[test]
fn test_undecorated_window_centered_with_one_round_trip() {
    let (mut xwm, mut x, mut shell) = setup();
    let atoms = xwm.atoms;
    motif_undecorated(&mut x, WIN, &atoms);
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (640, 480));

    let w = xwm.window(WIN).unwrap();
    assert!(w.managed);
    assert!(!w.decorated);
    assert!(!w.unpaired);
    assert_eq!(w.geometry(), Rect::new(640, 300, 640, 480));
    assert!(x.requests.iter().any(|r| matches!(
        r,
        XRequest::CreateFrame { geometry, depth: 24, .. } if *geometry == Rect::new(640, 300, 640, 480)
    )));
    assert_eq!(shell.count("toplevel"), 1);
    assert_eq!(shell.count("popup"), 0);

    // Host configures; the client has not drawn anything matching yet
    xwm.toplevel_configure(WIN, 0, 0, &[]);
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 10);
    assert!(shell.acks().is_empty());
    assert_eq!(xwm.window(WIN).unwrap().pending.serial, 10);

    // Wrong size does not ack
    xwm.surface_attached(&mut x, &mut shell, 5, (320, 240));
    assert!(shell.acks().is_empty());

    xwm.surface_attached(&mut x, &mut shell, 5, (640, 480));
    assert_eq!(shell.acks(), vec![10]);
    assert_eq!(xwm.window(WIN).unwrap().pending.serial, 0);

    assert!(xwm.surface_committed(5, true));
    assert!(xwm.window(WIN).unwrap().realized);
    assert_eq!(shell.count("toplevel"), 1);
}

#[test]
fn test_single_configure_in_flight() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));

    xwm.toplevel_configure(WIN, 800, 600, &[]);
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 1);
    xwm.toplevel_configure(WIN, 1000, 700, &[]);
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 2);

    let w = xwm.window(WIN).unwrap();
    assert_eq!(w.pending.serial, 1);
    assert_eq!(w.next.serial, 2);
    assert_eq!((w.width, w.height), (800, 600));
    assert!(shell.acks().is_empty());

    // Contents for the first configure: ack 1, apply 2, wait again
    xwm.surface_attached(&mut x, &mut shell, 5, (800, 600));
    assert_eq!(shell.acks(), vec![1]);
    let w = xwm.window(WIN).unwrap();
    assert_eq!(w.pending.serial, 2);
    assert_eq!(w.next.serial, 0);
    assert_eq!((w.width, w.height), (1000, 700));
    assert_eq!((w.x, w.y), (460, 190));

    xwm.surface_attached(&mut x, &mut shell, 5, (1000, 700));
    assert_eq!(shell.acks(), vec![1, 2]);
}

#[test]
fn test_configure_writes_net_wm_state() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    x.take();

    xwm.toplevel_configure(WIN, 0, 0, &2u32.to_ne_bytes());
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 3);

    let atoms = xwm.atoms;
    assert!(x.requests.contains(&XRequest::ChangeProperty {
        window: WIN,
        property: atoms._NET_WM_STATE,
        type_: AtomEnum::ATOM.into(),
        data: PropertyData::Words(vec![atoms._NET_WM_STATE_FULLSCREEN]),
    }));
    assert!(!xwm.window(WIN).unwrap().allow_resize);
}

#[test]
fn test_unmanaged_window_becomes_popup_of_last_input_window() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    shell.surfaces.insert(
        5,
        SurfaceInfo {
            contents: (400, 300),
            last_event_serial: 42,
        },
    );
    xwm.surface_committed(5, true);
    let parent = xwm.window(WIN).unwrap().geometry();

    // Override-redirect menu at an explicit position
    xwm.create_notify(&mut x, OTHER, Rect::new(parent.x + 20, parent.y + 30, 100, 50), 0);
    shell.surfaces.insert(6, SurfaceInfo::default());
    xwm.client_message(&mut x, &mut shell, OTHER, xwm.atoms.WL_SURFACE_ID, [6, 0, 0, 0, 0], None);

    assert_eq!(shell.count("popup"), 1);
    assert_eq!(shell.count("toplevel"), 1);
    assert_eq!(shell.positioners[0].anchor_rect, Rect::new(20, 30, 1, 1));
    assert_eq!(shell.positioners[0].size, (100, 50));
}

#[test]
fn test_unmanaged_window_without_parent_is_toplevel() {
    let (mut xwm, mut x, mut shell) = setup();
    xwm.create_notify(&mut x, OTHER, Rect::new(5, 5, 100, 50), 0);
    shell.surfaces.insert(6, SurfaceInfo::default());
    xwm.client_message(&mut x, &mut shell, OTHER, xwm.atoms.WL_SURFACE_ID, [6, 0, 0, 0, 0], None);
    assert_eq!(shell.count("toplevel"), 1);
    assert_eq!(shell.count("popup"), 0);
    assert!(matches!(shell.requests.last(), Some(ShellRequest::Commit { surface_id: 6 })));
}

#[test]
fn test_configure_commits_only_drawn_surfaces() {
    let (mut xwm, mut x, mut shell) = setup();
    xwm.create_notify(&mut x, OTHER, Rect::new(5, 5, 100, 50), 0);
    shell.surfaces.insert(6, SurfaceInfo::default());
    xwm.client_message(&mut x, &mut shell, OTHER, xwm.atoms.WL_SURFACE_ID, [6, 0, 0, 0, 0], None);
    shell.requests.clear();

    // Nothing attached yet: ack, but hold the commit back
    xwm.xdg_surface_configure(&mut x, &mut shell, OTHER, 7);
    assert_eq!(shell.acks(), vec![7]);
    assert!(!shell.requests.iter().any(|r| matches!(r, ShellRequest::Commit { .. })));

    shell.surfaces.insert(
        6,
        SurfaceInfo {
            contents: (100, 50),
            last_event_serial: 0,
        },
    );
    xwm.xdg_surface_configure(&mut x, &mut shell, OTHER, 8);
    assert_eq!(shell.acks(), vec![7, 8]);
    assert!(matches!(shell.requests.last(), Some(ShellRequest::Commit { surface_id: 6 })));
}

#[test]
fn test_moveresize_needs_serial() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    let moveresize = xwm.atoms._NET_WM_MOVERESIZE;
    shell.requests.clear();

    xwm.client_message(&mut x, &mut shell, WIN, moveresize, [0, 0, 8, 0, 0], None);
    assert!(shell.requests.is_empty());

    xwm.client_message(&mut x, &mut shell, WIN, moveresize, [0, 0, 8, 0, 0], Some(77));
    xwm.client_message(&mut x, &mut shell, WIN, moveresize, [0, 0, 4, 0, 0], Some(78));
    xwm.client_message(&mut x, &mut shell, WIN, moveresize, [0, 0, 11, 0, 0], Some(79));
    assert!(matches!(shell.requests[0], ShellRequest::Move { serial: 77, .. }));
    assert!(matches!(
        shell.requests[1],
        ShellRequest::Resize {
            serial: 78,
            edge: ResizeEdge::BottomRight,
            ..
        }
    ));
    assert_eq!(shell.requests.len(), 2);
}

#[test]
fn test_net_wm_state_messages() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    let atoms = xwm.atoms;
    shell.requests.clear();

    xwm.client_message(&mut x, &mut shell, WIN, atoms._NET_WM_STATE, [NET_WM_STATE_ADD, atoms._NET_WM_STATE_FULLSCREEN, 0, 0, 0], None);
    xwm.client_message(&mut x, &mut shell, WIN, atoms._NET_WM_STATE, [NET_WM_STATE_ADD, atoms._NET_WM_STATE_MAXIMIZED_VERT, 0, 0, 0], None);
    xwm.client_message(
        &mut x,
        &mut shell,
        WIN,
        atoms._NET_WM_STATE,
        [NET_WM_STATE_REMOVE, atoms._NET_WM_STATE_MAXIMIZED_VERT, atoms._NET_WM_STATE_MAXIMIZED_HORZ, 0, 0],
        None,
    );
    assert_eq!(shell.requests.len(), 2);
    assert!(matches!(shell.requests[0], ShellRequest::SetFullscreen(_)));
    assert!(matches!(shell.requests[1], ShellRequest::UnsetMaximized(_)));
}

#[test]
fn test_title_follows_wm_name() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    let wm_name = u32::from(AtomEnum::WM_NAME);
    x.properties.insert((WIN, wm_name), Property::from_bytes(31, b"vim".to_vec()));
    shell.requests.clear();

    xwm.property_notify(&mut x, &mut shell, WIN, wm_name, false);
    xwm.property_notify(&mut x, &mut shell, WIN, wm_name, true);
    let titles: Vec<_> = shell
        .requests
        .iter()
        .filter_map(|r| match r {
            ShellRequest::SetTitle { title, .. } => Some(title.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(titles, vec!["vim", ""]);
}

#[test]
fn test_motif_property_updates_aura_frame() {
    let (mut xwm, mut x, mut shell) = setup();
    shell.aura = true;
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    assert!(shell.requests.contains(&ShellRequest::SetFrame {
        aura: 2,
        frame: FrameType::Normal
    }));
    assert!(shell.requests.contains(&ShellRequest::SetApplicationId {
        aura: 2,
        app_id: format!("org.chromium.termina.xid.{}", WIN),
    }));

    let atoms = xwm.atoms;
    motif_undecorated(&mut x, WIN, &atoms);
    shell.requests.clear();
    xwm.property_notify(&mut x, &mut shell, WIN, atoms._MOTIF_WM_HINTS, false);
    assert_eq!(
        shell.requests,
        vec![ShellRequest::SetFrame {
            aura: 2,
            frame: FrameType::Shadow
        }]
    );
}

#[test]
fn test_unmap_withdraws_and_tears_down() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    let frame = xwm.window(WIN).unwrap().frame_id.unwrap();
    x.take();
    shell.requests.clear();

    xwm.unmap_notify(&mut x, &mut shell, WIN, true);
    assert!(x.requests.is_empty());

    xwm.unmap_notify(&mut x, &mut shell, WIN, false);
    let w = xwm.window(WIN).unwrap();
    assert!(!w.managed);
    assert!(w.unpaired);
    assert_eq!(w.frame_id, None);
    assert_eq!(
        shell.requests.iter().filter(|r| matches!(r, ShellRequest::Destroy(_))).count(),
        2
    );
    assert!(x.requests.contains(&XRequest::ChangeProperty {
        window: WIN,
        property: xwm.atoms.WM_STATE,
        type_: xwm.atoms.WM_STATE,
        data: PropertyData::Words(vec![WM_STATE_WITHDRAWN, 0]),
    }));
    assert!(x.requests.contains(&XRequest::DestroyWindow(frame)));
}

#[test]
fn test_host_activation_moves_input_focus() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    x.take();

    xwm.toplevel_configure(WIN, 0, 0, &TOPLEVEL_STATE_ACTIVATED.to_ne_bytes());
    assert_eq!(xwm.host_focus(), Some(WIN));
    xwm.flush_focus(&mut x);
    let atoms = xwm.atoms;
    assert_eq!(
        x.take(),
        vec![
            XRequest::SendClientMessage {
                window: WIN,
                type_: atoms.WM_PROTOCOLS,
                data: [atoms.WM_TAKE_FOCUS, 0, 0, 0, 0],
                mask: EventMask::SUBSTRUCTURE_REDIRECT,
            },
            XRequest::SetInputFocus(Some(WIN)),
        ]
    );

    // Nothing pending: no requests
    xwm.flush_focus(&mut x);
    assert!(x.requests.is_empty());

    xwm.destroy_notify(&mut x, &mut shell, WIN);
    xwm.flush_focus(&mut x);
    assert_eq!(x.requests.last(), Some(&XRequest::SetInputFocus(None)));
}

#[test]
fn test_configure_request_on_managed_window_acks_outstanding() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 4);
    xwm.xdg_surface_configure(&mut x, &mut shell, WIN, 5);

    xwm.configure_request(
        &mut x,
        &mut shell,
        ConfigureRequest {
            window: WIN,
            changes: WindowChanges {
                width: Some(500),
                height: Some(400),
                ..Default::default()
            },
        },
    );
    assert_eq!(shell.acks(), vec![4, 5]);
    let w = xwm.window(WIN).unwrap();
    assert_eq!((w.width, w.height), (500, 400));
    assert_eq!((w.x, w.y), (710, 340));
    assert_eq!(w.pending, Default::default());
}

#[test]
fn test_unmanaged_configure_request_passes_through() {
    let (mut xwm, mut x, mut shell) = setup();
    xwm.create_notify(&mut x, OTHER, Rect::new(0, 0, 10, 10), 0);
    x.take();
    let changes = WindowChanges {
        x: Some(3),
        sibling: Some(9),
        ..Default::default()
    };
    xwm.configure_request(&mut x, &mut shell, ConfigureRequest { window: OTHER, changes });
    assert_eq!(x.take(), vec![XRequest::Configure { window: OTHER, changes }]);
}

#[test]
fn test_root_resize_recenters_unpositioned() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    x.take();

    xwm.configure_notify(&mut x, &mut shell, 0x100, Rect::new(0, 0, 1280, 800), 0);
    assert_eq!(xwm.screen, (1280, 800));
    let w = xwm.window(WIN).unwrap();
    assert_eq!((w.x, w.y), (440, 250));
    assert!(x
        .requests
        .iter()
        .any(|r| matches!(r, XRequest::SendConfigureNotify { window: WIN, .. })));

    // Same size again is ignored
    x.take();
    xwm.configure_notify(&mut x, &mut shell, 0x100, Rect::new(0, 0, 1280, 800), 0);
    assert!(x.requests.is_empty());
}

#[test]
fn test_own_windows_ignored_and_reparent_tracks() {
    let (mut xwm, mut x, mut shell) = setup();
    x.ours.push(0x40_0099);
    xwm.create_notify(&mut x, 0x40_0099, Rect::new(0, 0, 1, 1), 0);
    assert!(xwm.window(0x40_0099).is_none());

    x.geometries.insert(
        OTHER,
        Geometry {
            rect: Rect::new(0, 0, 30, 40),
            border_width: 1,
            depth: 24,
        },
    );
    xwm.reparent_notify(&mut x, &mut shell, OTHER, 0x100, (7, 8));
    let w = xwm.window(OTHER).unwrap();
    assert_eq!(w.geometry(), Rect::new(7, 8, 30, 40));
    assert_eq!(w.border_width, 1);

    // Reparented away from root by someone else: forget it
    xwm.reparent_notify(&mut x, &mut shell, OTHER, 0x20_0500, (0, 0));
    assert!(xwm.window(OTHER).is_none());
}

#[test]
fn test_restack_raises_focused_frame() {
    let (mut xwm, mut x, mut shell) = setup();
    managed_window(&mut xwm, &mut x, &mut shell, WIN, 5, (400, 300));
    managed_window(&mut xwm, &mut x, &mut shell, OTHER, 6, (400, 300));
    let frame_a = xwm.window(WIN).unwrap().frame_id.unwrap();
    let frame_b = xwm.window(OTHER).unwrap().frame_id.unwrap();
    x.take();

    xwm.restack(&mut x, 6);
    assert_eq!(
        x.take(),
        vec![
            XRequest::Configure {
                window: frame_a,
                changes: WindowChanges::stack(StackMode::BELOW),
            },
            XRequest::Configure {
                window: frame_b,
                changes: WindowChanges::stack(StackMode::ABOVE),
            },
        ]
    );
}
