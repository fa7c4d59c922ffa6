//! Listen-and-fork mode: one relay process per guest connection

use super::sd_notify;
use crate::config::RelayConfig;
use crate::xwayland::{self, split_prefix};
use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use rustix::fs::{flock, FlockOperation};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

const LOCK_SUFFIX: &str = ".lock";

/// Socket and lock file paths for `socket` under `runtime_dir`
pub fn socket_paths(runtime_dir: &Path, socket: &str) -> (PathBuf, PathBuf) {
    let socket_path = runtime_dir.join(socket);
    let mut lock = socket_path.clone().into_os_string();
    lock.push(LOCK_SUFFIX);
    (socket_path, PathBuf::from(lock))
}

/// Command line of the relay serving one accepted connection
pub fn peer_command(prefix: Option<&str>, exe: &str, peer_pid: i32, client_fd: i32, forwarded: &[String]) -> Vec<String> {
    let mut argv = prefix.map(split_prefix).unwrap_or_default();
    argv.push(exe.to_string());
    argv.push(format!("--peer-pid={}", peer_pid));
    argv.push(format!("--client-fd={}", client_fd));
    argv.extend(forwarded.iter().cloned());
    argv
}

/// Accepts guest connections forever
pub fn run(config: &RelayConfig, forwarded: Vec<String>) -> Result<i32> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").context("XDG_RUNTIME_DIR is not set")?;
    let (socket_path, lock_path) = socket_paths(Path::new(&runtime_dir), &config.display.socket);

    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o660)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    if flock(&lock, FlockOperation::NonBlockingLockExclusive).is_err() {
        bail!("unable to lock {}, is another compositor running?", lock_path.display());
    }

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    // Children are never waited for
    // SAFETY: setting a signal disposition has no preconditions.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }

    if let Some(state) = &config.display.sd_notify {
        if let Err(e) = sd_notify(state) {
            warn!("sd_notify failed: {:#}", e);
        }
    }

    let exe = std::env::current_exe().context("locating the relay executable")?;
    let exe = exe.display().to_string();
    info!("🎧 Listening on {}", socket_path.display());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = serve(config, &exe, &forwarded, stream) {
                    error!("❌ Cannot start a relay: {:#}", e);
                }
            }
            Err(e) => error!("❌ Failed to accept: {}", e),
        }
    }
    Ok(0)
}

fn serve(config: &RelayConfig, exe: &str, forwarded: &[String], stream: UnixStream) -> Result<()> {
    let peer_pid = rustix::net::sockopt::get_socket_peercred(&stream)
        .map(|cred| rustix::process::Pid::as_raw(Some(cred.pid)))
        .unwrap_or(-1);
    let fd = stream.as_raw_fd();
    let argv = peer_command(config.display.peer_cmd_prefix.as_deref(), exe, peer_pid, fd, forwarded);
    let pid = xwayland::spawn(&argv, &[], &[fd])?;
    info!("🔗 Peer {} served by {}", peer_pid, pid);
    Ok(())
}
