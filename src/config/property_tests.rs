//! Property-based tests for configuration module

use super::*;
use proptest::prelude::*;

prop_compose! {
    fn any_config()(
        scale in 0.01f64..100.0,
        dpi in prop::collection::vec(-100i32..20_000, 0..6),
        xwayland in any::<bool>(),
        clipboard_manager in any::<bool>(),
        rgb in 0u32..0x0100_0000,
    ) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.scale.scale = scale;
        config.scale.dpi = dpi;
        config.xwayland.enabled = xwayland;
        config.xwayland.clipboard_manager = clipboard_manager;
        config.window.frame_color = Some(format!("#{:06x}", rgb));
        config
    }
}

proptest! {
    #[test]
    fn prop_finalize_keeps_ranges(config in any_config()) {
        let config = config.finalize().unwrap();
        prop_assert!(config.scale.scale >= crate::geometry::MIN_SCALE);
        prop_assert!(config.scale.scale <= crate::geometry::MAX_SCALE);
        prop_assert!(config.scale.dpi.iter().all(|d| (MIN_DPI..=MAX_DPI).contains(d)));
        if config.xwayland.enabled {
            prop_assert!(!config.scale.dpi.is_empty());
        }
    }

    #[test]
    fn prop_frame_color_is_opaque(rgb in 0u32..0x0100_0000) {
        let color = parse_frame_color(&format!("#{:06X}", rgb)).unwrap();
        prop_assert_eq!(color, 0xff00_0000 | rgb);
    }

    #[test]
    fn prop_toml_roundtrip(config in any_config()) {
        let text = toml::to_string(&config).unwrap();
        let parsed: RelayConfig = toml::from_str(&text).unwrap();
        prop_assert_eq!(parsed, config);
    }

    #[test]
    fn prop_dpi_list_parses(dpi in prop::collection::vec(0i32..10_000, 1..8)) {
        let text = dpi.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");
        prop_assert_eq!(parse_dpi(&text).unwrap(), dpi);
    }
}
