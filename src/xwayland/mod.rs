//! Launching Xwayland and the guest program, and what happens when they exit

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Variable carrying the relay version into spawned processes
pub const VERSION_ENV: &str = "SOMMELIER_VERSION";

/// Longest display name Xwayland writes to the displayfd (":" plus digits)
const MAX_DISPLAY_NAME: usize = 8;

/// How Xwayland should get its pixels to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XwaylandRendering {
    /// No render node: plain shared memory
    Shm,
    /// Render node present, software rendering through DRM buffers
    Drm,
    /// Render node present and glamor enabled
    Glamor,
}

impl XwaylandRendering {
    pub fn select(drm_device: bool, glamor: bool) -> Self {
        match (drm_device, glamor) {
            (false, _) => XwaylandRendering::Shm,
            (true, false) => XwaylandRendering::Drm,
            (true, true) => XwaylandRendering::Glamor,
        }
    }
}

/// Splits a command prefix on spaces; double quotes group words
pub fn split_prefix(prefix: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;

    for c in prefix.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            ' ' if !quoted => {
                if started {
                    words.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            _ => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        words.push(current);
    }
    words
}

/// Full Xwayland command line, prefix included
pub fn xwayland_command(
    prefix: Option<&str>,
    path: &str,
    display: Option<u32>,
    rendering: XwaylandRendering,
    display_fd: RawFd,
    wm_fd: RawFd,
) -> Vec<String> {
    let mut args = prefix.map(split_prefix).unwrap_or_default();
    args.push(path.to_string());
    if let Some(display) = display.filter(|display| *display > 0) {
        args.push(format!(":{}", display));
    }
    args.extend(["-nolisten", "tcp", "-rootless"].map(String::from));
    match rendering {
        XwaylandRendering::Shm => args.push("-shm".into()),
        XwaylandRendering::Drm => args.push("-drm".into()),
        XwaylandRendering::Glamor => {}
    }
    args.push("-displayfd".into());
    args.push(display_fd.to_string());
    args.push("-wm".into());
    args.push(wm_fd.to_string());
    args
}

/// Collects the display name Xwayland writes once it is ready
#[derive(Debug, Default)]
pub struct DisplayReader {
    buffer: Vec<u8>,
}

impl DisplayReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes read from the displayfd; returns the display (":N")
    /// once the line is complete
    pub fn feed(&mut self, bytes: &[u8]) -> Option<String> {
        self.buffer.extend_from_slice(bytes);
        let end = self.buffer.iter().position(|b| *b == b'\n');
        if end.is_none() && self.buffer.len() < MAX_DISPLAY_NAME {
            return None;
        }
        self.finish()
    }

    /// Whatever has been read, for when the displayfd hits end of stream
    pub fn finish(&mut self) -> Option<String> {
        let end = self
            .buffer
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(self.buffer.len())
            .min(MAX_DISPLAY_NAME);
        let number = std::str::from_utf8(&self.buffer[..end]).ok()?.trim();
        if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(format!(":{}", number))
    }
}

/// Starts `argv` with `inherit` kept open across exec and the signal mask
/// cleared
pub fn spawn(argv: &[String], env: &[(String, String)], inherit: &[RawFd]) -> Result<i32> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command line");
    };
    let mut command = Command::new(program);
    command.args(args).env(VERSION_ENV, env!("CARGO_PKG_VERSION"));
    for (key, value) in env {
        command.env(key, value);
    }

    let inherit = inherit.to_vec();
    // SAFETY: the closure only calls async-signal-safe functions.
    unsafe {
        command.pre_exec(move || {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            for fd in &inherit {
                let flags = libc::fcntl(*fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(*fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().with_context(|| format!("failed to start {}", program))?;
    debug!("Started {} as {}", program, child.id());
    Ok(child.id() as i32)
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl ChildStatus {
    pub fn from_wait(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            ChildStatus::Exited(libc::WEXITSTATUS(status))
        } else {
            ChildStatus::Signaled(libc::WTERMSIG(status))
        }
    }

    /// Exit code, when it was a nonzero one
    pub fn failure(self) -> Option<i32> {
        match self {
            ChildStatus::Exited(0) | ChildStatus::Signaled(_) => None,
            ChildStatus::Exited(code) => Some(code),
        }
    }
}

/// Every child that has ended, without blocking
pub fn reap() -> Vec<(i32, ChildStatus)> {
    let mut ended = Vec::new();
    loop {
        let mut status = 0;
        // SAFETY: plain syscall on a local out-parameter.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        ended.push((pid, ChildStatus::from_wait(status)));
    }
    ended
}

/// Sends SIGTERM to `pid`
pub fn terminate(pid: i32) {
    // SAFETY: plain syscall.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!("Cannot terminate {}: {}", pid, std::io::Error::last_os_error());
    }
}

/// What the loop should do after a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAction {
    Nothing,
    /// Terminate Xwayland
    Terminate(i32),
    /// Tell the service manager the relay is ready
    Notify,
    Exit(i32),
}

/// Tracks the relay's children
#[derive(Debug, Clone)]
pub struct ChildPolicy {
    pub xwayland: Option<i32>,
    pub program: Option<i32>,
    pub exit_with_child: bool,
    /// Code to exit with once the guest connection goes away
    exit_code: i32,
}

impl ChildPolicy {
    pub fn new(exit_with_child: bool) -> Self {
        Self {
            xwayland: None,
            program: None,
            exit_with_child,
            exit_code: 0,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn on_exit(&mut self, pid: i32, status: ChildStatus) -> ChildAction {
        if Some(pid) == self.program {
            self.program = None;
            if let Some(code) = status.failure() {
                warn!("Child exited with status: {}", code);
            }
            if !self.exit_with_child {
                return ChildAction::Notify;
            }
            self.exit_code = status.failure().unwrap_or(0);
            return match self.xwayland {
                Some(xwayland) => ChildAction::Terminate(xwayland),
                None => ChildAction::Exit(self.exit_code),
            };
        }
        if Some(pid) == self.xwayland {
            self.xwayland = None;
            if let Some(code) = status.failure() {
                warn!("Xwayland exited with status: {}", code);
                return ChildAction::Exit(code);
            }
            info!("Xwayland exited");
            return ChildAction::Nothing;
        }
        debug!("Reaped unknown child {}: {:?}", pid, status);
        ChildAction::Nothing
    }
}
