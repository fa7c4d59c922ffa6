//! Unit tests for configuration module
//!
//! Covers file loading, the environment and command line layers, and the
//! driver selection rules.

use super::*;
use anyhow::Result;
use clap::Parser;
use serial_test::serial;
use std::collections::HashMap;
use tempfile::tempdir;

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_default_configuration_is_valid() {
    let config = RelayConfig::default();
    config.validate().unwrap();

    assert_eq!(config.display.socket, "wayland-0");
    assert_eq!(config.scale.scale, 1.0);
    assert!(!config.xwayland.enabled);
    assert!(config.xwayland.exit_with_child);
    assert!(config.xwayland.clipboard_manager);
    assert_eq!(config.shm_driver().unwrap(), ShmDriver::Noop);
    assert_eq!(config.data_driver().unwrap(), DataDriver::Noop);
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("carafe.toml");
    fs::write(
        &path,
        r##"
[display]
host_display = "wayland-1"

[transport]
shm_driver = "virtwl-dmabuf"
virtwl_device = "/dev/wl0"

[scale]
scale = 1.5
dpi = [96, 160]

[xwayland]
enabled = true
display = 3

[window]
frame_color = "#336699"
"##,
    )?;

    let config = RelayConfig::load(&path)?;
    assert_eq!(config.display.host_display.as_deref(), Some("wayland-1"));
    assert_eq!(config.display.socket, "wayland-0");
    assert_eq!(config.transport.shm_driver, Some(ShmDriver::VirtwlDmabuf));
    assert_eq!(config.scale.scale, 1.5);
    assert_eq!(config.scale.dpi, vec![96, 160]);
    assert_eq!(config.xwayland.display, Some(3));
    assert_eq!(config.xwayland.path, "Xwayland");
    assert_eq!(config.frame_color()?, Some(0xff33_6699));
    Ok(())
}

#[test]
fn test_save_and_load() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested").join("carafe.toml");

    let mut config = RelayConfig::default();
    config.window.application_id = Some("org.example.App".into());
    config.transport.data_driver = Some(DataDriver::Noop);
    config.save(&path)?;

    assert_eq!(RelayConfig::load(&path)?, config);
    Ok(())
}

#[test]
fn test_invalid_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;

    let path = dir.path().join("bad.toml");
    fs::write(&path, "[transport]\nshm_driver = \"magic\"\n")?;
    assert!(RelayConfig::load(&path).is_err());

    fs::write(&path, "[window]\nframe_color = \"blue\"\n")?;
    let err = RelayConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("frame color"));

    assert!(RelayConfig::load(dir.path().join("missing.toml")).is_err());
    Ok(())
}

#[test]
fn test_environment_overrides() -> Result<()> {
    let mut config = RelayConfig::default();
    config.apply_env_from(env(&[
        ("SOMMELIER_DISPLAY", "wayland-9"),
        ("SOMMELIER_SCALE", "2"),
        ("SOMMELIER_DPI", "96, 160"),
        ("SOMMELIER_CLIPBOARD_MANAGER", "0"),
        ("SOMMELIER_DRM_DEVICE", "/dev/dri/renderD128"),
        ("SOMMELIER_GLAMOR", "1"),
        ("SOMMELIER_SHM_DRIVER", "dmabuf"),
        ("SOMMELIER_ACCELERATORS", "<Alt>Tab"),
        ("SOMMELIER_XWAYLAND_PATH", "/opt/bin/Xwayland"),
        ("SOMMELIER_XWAYLAND_CMD_PREFIX", "strace -f"),
    ]))?;

    assert_eq!(config.display.host_display.as_deref(), Some("wayland-9"));
    assert_eq!(config.scale.scale, 2.0);
    assert_eq!(config.scale.dpi, vec![96, 160]);
    assert!(!config.xwayland.clipboard_manager);
    assert!(config.transport.glamor);
    assert_eq!(config.shm_driver()?, ShmDriver::Dmabuf);
    assert_eq!(config.accelerators()?.len(), 1);
    assert_eq!(config.xwayland.path, "/opt/bin/Xwayland");
    assert_eq!(config.xwayland.cmd_prefix.as_deref(), Some("strace -f"));
    Ok(())
}

#[test]
fn test_environment_rejects_garbage() {
    let mut config = RelayConfig::default();
    assert!(config.apply_env_from(env(&[("SOMMELIER_SCALE", "big")])).is_err());
    assert!(config.apply_env_from(env(&[("SOMMELIER_DPI", "96,x")])).is_err());
    assert!(config.apply_env_from(env(&[("SOMMELIER_DATA_DRIVER", "pigeon")])).is_err());
}

#[test]
#[serial]
fn test_process_environment() -> Result<()> {
    std::env::set_var("SOMMELIER_FRAME_COLOR", "#000000");
    std::env::set_var("SOMMELIER_CLIPBOARD_MANAGER", "1");
    let mut config = RelayConfig::default();
    let result = config.apply_env();
    std::env::remove_var("SOMMELIER_FRAME_COLOR");
    std::env::remove_var("SOMMELIER_CLIPBOARD_MANAGER");

    result?;
    assert_eq!(config.frame_color()?, Some(0xff00_0000));
    assert!(config.xwayland.clipboard_manager);
    Ok(())
}

#[test]
#[serial]
fn test_default_path_follows_xdg_config_home() {
    let previous = std::env::var_os("XDG_CONFIG_HOME");
    std::env::set_var("XDG_CONFIG_HOME", "/tmp/carafe-xdg");
    let path = RelayConfig::default_path();
    match previous {
        Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
        None => std::env::remove_var("XDG_CONFIG_HOME"),
    }

    assert_eq!(path, Some(PathBuf::from("/tmp/carafe-xdg/carafe/carafe.toml")));
}

#[test]
fn test_command_line_overrides_environment() -> Result<()> {
    let mut config = RelayConfig::default();
    config.apply_env_from(env(&[("SOMMELIER_SCALE", "2"), ("SOMMELIER_DISPLAY", "env")]))?;

    let cli = Cli::try_parse_from([
        "carafe",
        "--scale=1.25",
        "--x-display=2",
        "--no-exit-with-child",
        "--dpi=96",
        "--",
        "xterm",
        "-e",
        "top",
    ])?;
    cli.apply(&mut config)?;

    assert_eq!(config.scale.scale, 1.25);
    assert_eq!(config.display.host_display.as_deref(), Some("env"));
    assert!(config.xwayland.enabled);
    assert_eq!(config.xwayland.display, Some(2));
    assert!(!config.xwayland.exit_with_child);
    assert_eq!(config.scale.dpi, vec![96]);
    assert_eq!(cli.program, vec!["xterm", "-e", "top"]);
    Ok(())
}

#[test]
fn test_program_without_separator() -> Result<()> {
    let cli = Cli::try_parse_from(["carafe", "-X", "weston-terminal", "--fullscreen"])?;
    assert!(cli.xwayland);
    assert_eq!(cli.program, vec!["weston-terminal", "--fullscreen"]);
    Ok(())
}

#[test]
fn test_finalize_clamps_and_fills_defaults() -> Result<()> {
    let mut config = RelayConfig::default();
    config.scale.scale = 50.0;
    config.xwayland.enabled = true;
    let config = config.finalize()?;
    assert_eq!(config.scale.scale, crate::geometry::MAX_SCALE);
    assert_eq!(config.scale.dpi, DEFAULT_DPI_BUCKETS.to_vec());

    let mut config = RelayConfig::default();
    config.scale.dpi = vec![10, 100_000];
    let config = config.finalize()?;
    assert_eq!(config.scale.dpi, vec![MIN_DPI, MAX_DPI]);
    Ok(())
}

#[test]
fn test_no_default_dpi_without_xwayland() -> Result<()> {
    let config = RelayConfig::default().finalize()?;
    assert!(config.scale.dpi.is_empty());
    Ok(())
}

#[test]
fn test_driver_selection() {
    let mut config = RelayConfig::default();

    config.transport.virtwl_device = Some("/dev/wl0".into());
    assert_eq!(config.shm_driver().unwrap(), ShmDriver::VirtwlDmabuf);
    assert_eq!(config.data_driver().unwrap(), DataDriver::Virtwl);

    config.transport.drm_device = Some("/dev/dri/renderD128".into());
    assert_eq!(config.shm_driver().unwrap(), ShmDriver::Dmabuf);

    config.transport.shm_driver = Some(ShmDriver::Noop);
    assert_eq!(config.shm_driver().unwrap(), ShmDriver::Noop);
}

#[test]
fn test_driver_requires_device() {
    let mut config = RelayConfig::default();
    config.transport.shm_driver = Some(ShmDriver::Dmabuf);
    assert!(config.shm_driver().is_err());
    assert!(config.clone().finalize().is_err());

    config.transport.shm_driver = Some(ShmDriver::Virtwl);
    assert!(config.shm_driver().is_err());

    config.transport.shm_driver = None;
    config.transport.data_driver = Some(DataDriver::Virtwl);
    assert!(config.data_driver().is_err());
}

#[test]
fn test_frame_color_parsing() {
    assert_eq!(parse_frame_color("#ffffff").unwrap(), 0xffff_ffff);
    assert_eq!(parse_frame_color("#0A0b0C").unwrap(), 0xff0a_0b0c);
    assert!(parse_frame_color("ffffff").is_err());
    assert!(parse_frame_color("#fff").is_err());
    assert!(parse_frame_color("#gggggg").is_err());
    assert!(parse_frame_color("#+12345").is_err());
}

#[test]
fn test_clipboard_manager_needs_xwayland() {
    let mut config = RelayConfig::default();
    assert!(!config.clipboard_manager());
    config.xwayland.enabled = true;
    assert!(config.clipboard_manager());
    config.xwayland.clipboard_manager = false;
    assert!(!config.clipboard_manager());
}

#[test]
fn test_peer_args() -> Result<()> {
    let cli = Cli::try_parse_from(["carafe", "--master", "--scale=2", "--drm-device=/dev/dri/card0"])?;
    let mut config = RelayConfig::default();
    cli.apply(&mut config)?;

    let args = cli.peer_args(&config);
    assert!(args.contains(&"--scale=2".to_string()));
    assert!(args.contains(&"--drm-device=/dev/dri/card0".to_string()));
    assert!(!args.iter().any(|a| a.starts_with("--shm-driver")));
    Ok(())
}
