//! Error taxonomy for the relay.
//!
//! Protocol violations and backend failures are fatal; transient I/O is
//! retried by the event loop and never becomes a `RelayError`.

use thiserror::Error;

/// Failure classes surfaced by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// A peer sent something the relay cannot resynchronize from
    #[error("protocol violation on {interface}: {reason}")]
    Protocol {
        interface: &'static str,
        reason: String,
    },

    /// A required host global was not advertised
    #[error("host does not provide required global {0}")]
    MissingGlobal(&'static str),

    /// The host advertised a global at a version we cannot work with
    #[error("host global {interface} v{version} is older than required v{required}")]
    GlobalTooOld {
        interface: &'static str,
        version: u32,
        required: u32,
    },

    /// Buffer allocation or import failed in the active transport backend
    #[error("{backend} transport: {reason}")]
    Transport {
        backend: &'static str,
        reason: String,
    },

    /// The X11 connection failed or returned an unusable reply
    #[error("X11: {0}")]
    X11(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn protocol(interface: &'static str, reason: impl Into<String>) -> Self {
        RelayError::Protocol {
            interface,
            reason: reason.into(),
        }
    }

    pub fn transport(backend: &'static str, reason: impl Into<String>) -> Self {
        RelayError::Transport {
            backend,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RelayError::protocol("wl_surface", "attach on destroyed surface");
        assert_eq!(
            err.to_string(),
            "protocol violation on wl_surface: attach on destroyed surface"
        );

        let err = RelayError::GlobalTooOld {
            interface: "wl_compositor",
            version: 2,
            required: 3,
        };
        assert!(err.to_string().contains("v2"));
        assert!(err.to_string().contains("v3"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
