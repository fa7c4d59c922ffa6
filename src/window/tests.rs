use super::*;

fn window() -> Window<u32> {
    Window::new(0x20_0001, Rect::new(10, 20, 300, 200), 2)
}

#[test]
fn test_new_window_is_unpaired_and_positioned() {
    let w = window();
    assert!(w.unpaired);
    assert!(w.is_positioned());
    assert!(w.allow_resize);
    assert!(!w.managed);
    assert_eq!(w.expected_contents(), (304, 204));
}

#[test]
fn test_is_matches_frame() {
    let mut w = window();
    assert!(w.is(0x20_0001));
    assert!(!w.is(0x40_0001));
    w.frame_id = Some(0x40_0001);
    assert!(w.is(0x40_0001));
}

#[test]
fn test_center_and_clamp() {
    let mut w = window();
    w.width = 3000;
    w.clamp_to_screen((1920, 1080));
    assert_eq!(w.width, 1920);
    w.width = 400;
    w.height = 300;
    w.center_on_screen((1920, 1080));
    assert_eq!((w.x, w.y), (760, 390));
}

#[test]
fn test_frame_type_selection() {
    let mut w = window();
    w.decorated = true;
    assert_eq!(w.frame_type(), FrameType::Normal);
    w.decorated = false;
    w.depth = 32;
    assert_eq!(w.frame_type(), FrameType::None);
    w.depth = 24;
    assert_eq!(w.frame_type(), FrameType::Shadow);
}

#[test]
fn test_application_id_fallbacks() {
    let mut w = window();
    assert_eq!(w.application_id(None), "org.chromium.termina.xid.2097153");
    w.client_leader = Some(77);
    assert_eq!(w.application_id(None), "org.chromium.termina.wmclientleader.77");
    w.class = Some("XTerm".into());
    assert_eq!(w.application_id(None), "org.chromium.termina.wmclass.XTerm");
    assert_eq!(w.application_id(Some("forced.app")), "forced.app");
}

#[test]
fn test_size_limits_divide_by_scale() {
    let mut w = window();
    w.size_flags |= P_MIN_SIZE;
    w.min_size = (200, 101);
    w.max_size = (900, 900);
    assert_eq!(w.size_limits(2.0), ((100, 50), (0, 0)));
}

#[test]
fn test_toplevel_configure_centers_unpositioned() {
    let mut w = window();
    w.managed = true;
    w.size_flags = 0;
    let activated = w.apply_toplevel_configure(
        400,
        300,
        &[TOPLEVEL_STATE_ACTIVATED, TOPLEVEL_STATE_MAXIMIZED],
        2.0,
        (1920, 1080),
    );
    assert_eq!(activated, Some(true));
    assert_eq!(w.next.size, Some((800, 600)));
    assert_eq!(w.next.position, Some((560, 240)));
    assert_eq!(w.next.border_width, Some(0));
    assert_eq!(w.next.states, vec![WmState::MaximizedVert, WmState::MaximizedHorz]);
    assert!(!w.allow_resize);

    // Same activation again is not a change
    assert_eq!(w.apply_toplevel_configure(0, 0, &[TOPLEVEL_STATE_ACTIVATED], 2.0, (1920, 1080)), None);
    assert!(w.allow_resize);
    assert!(w.next.states.is_empty());
}

#[test]
fn test_toplevel_configure_keeps_explicit_position() {
    let mut w = window();
    w.size_flags = US_POSITION;
    w.apply_toplevel_configure(100, 100, &[TOPLEVEL_STATE_FULLSCREEN], 1.0, (1920, 1080));
    assert_eq!(w.next.position, None);
    assert_eq!(w.next.states, vec![WmState::Fullscreen]);
}

#[test]
fn test_promote_next_moves_into_pending() {
    let mut w = window();
    w.next.serial = 7;
    w.next.position = Some((50, 60));
    w.next.size = Some((640, 480));
    w.next.border_width = Some(0);

    assert!(w.promote_next());
    assert_eq!(w.geometry(), Rect::new(50, 60, 640, 480));
    assert_eq!(w.border_width, 0);
    assert_eq!(w.pending.serial, 7);
    assert_eq!(w.next, Config::default());

    // Size-only configure does not count as a move
    w.next.size = Some((10, 10));
    assert!(!w.promote_next());
}

#[test]
fn test_pending_satisfied_requires_matching_contents_when_managed() {
    let mut w = window();
    assert!(!w.pending_satisfied(None));
    w.pending.serial = 3;
    assert!(w.pending_satisfied(Some((1, 1))));
    w.managed = true;
    assert!(!w.pending_satisfied(Some((300, 200))));
    assert!(w.pending_satisfied(Some((304, 204))));
    assert!(w.pending_satisfied(None));
}

#[test]
fn test_decode_states() {
    let mut raw = Vec::new();
    for s in [1u32, 4] {
        raw.extend_from_slice(&s.to_ne_bytes());
    }
    raw.push(0xff);
    assert_eq!(decode_states(&raw), vec![1, 4]);
}

#[test]
fn test_resize_edge_mapping() {
    assert_eq!(ResizeEdge::from_moveresize(0), Some(ResizeEdge::TopLeft));
    assert_eq!(ResizeEdge::from_moveresize(7), Some(ResizeEdge::Left));
    assert_eq!(ResizeEdge::from_moveresize(8), None);
    assert_eq!(ResizeEdge::BottomRight as u32, 10);
}

#[test]
fn test_shell_objects_take_all_order() {
    let mut objects = ShellObjects {
        xdg_surface: Some(1),
        toplevel: Some(2),
        popup: None,
        aura: Some(4),
    };
    assert_eq!(objects.take_all(), vec![4, 2, 1]);
    assert_eq!(objects, ShellObjects::default());
}
