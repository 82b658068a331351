//! Error taxonomy for the session runtime.
//!
//! Errors are split in two layers. [`ChannelError`] covers everything that can
//! happen on a raw byte transport and is deliberately small: callers of
//! `recv`-style methods need to distinguish "no data right now" from "the
//! other side is gone" without string matching. [`Error`] is the full
//! taxonomy surfaced to sessions, modules and the manager.

use std::time::Duration;

/// Failure modes of a byte channel.
///
/// `Blocked` is not really an error: it is the non-blocking read result when
/// nothing is buffered, and callers in polling loops are expected to treat it
/// as "try again later".
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No data available and the channel is in non-blocking mode.
    #[error("channel would block")]
    Blocked,

    /// The remote end performed an orderly close.
    #[error("channel closed by remote end")]
    Eof,

    /// A deadline expired mid-read. Carries whatever was read so far so the
    /// caller can decide whether to retry with the partial data.
    #[error("channel receive timed out after {elapsed:?} ({} bytes buffered)", .partial.len())]
    Timeout {
        partial: Vec<u8>,
        elapsed: Duration,
    },

    /// Underlying transport I/O failure.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// Failure while establishing the connection (TCP connect, TLS
    /// handshake, SSH authentication, ...).
    #[error("connection failed: {0}")]
    Connect(String),
}

impl ChannelError {
    /// True when the channel cannot be used any further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Eof | ChannelError::Transport(_) | ChannelError::Connect(_)
        )
    }
}

/// Aggregate failure of an automated escalation search.
#[derive(Debug, Default)]
pub struct EscalationFailure {
    /// Human readable description of each attempted step.
    pub attempted: Vec<String>,
    /// Users that were determined reachable before the failure.
    pub reachable_users: Vec<String>,
    /// The error message of the last failed step, if any.
    pub last_error: Option<String>,
}

impl std::fmt::Display for EscalationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} attempts failed", self.attempted.len())?;
        if let Some(last) = &self.last_error {
            write!(f, " (last: {})", last)?;
        }
        Ok(())
    }
}

/// The full runtime error taxonomy.
///
/// `Transport` and `Platform` are fatal for the owning session; everything
/// else propagates to the calling module which decides whether to recover.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Channel-level failure (transport, EOF, timeout, blocked).
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Unexpected byte sequence, missing delimiter or malformed C2 response.
    /// Poisons the channel it occurred on.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Remote permission failure (EACCES/EPERM or a missing capability).
    #[error("permission denied: {0}")]
    Permission(String),

    /// A binary, file, user, module or plugin was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal concurrent operation on a session, e.g. a framed command
    /// while raw pass-through is active.
    #[error("session busy: {0}")]
    Busy(String),

    /// Bad module argument; never reaches the transport.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// No known escalation path; aggregates the individual attempts.
    #[error("escalation failed: {0}")]
    EscalationFailed(EscalationFailure),

    /// A platform driver invariant was violated. Fatal for the session.
    #[error("platform error: {0}")]
    Platform(String),
}

impl Error {
    /// Whether the owning session should be torn down because of this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Channel(inner) => inner.is_fatal(),
            Error::Platform(_) => true,
            Error::Protocol(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_is_not_fatal() {
        assert!(!ChannelError::Blocked.is_fatal());
        assert!(!Error::Channel(ChannelError::Blocked).is_fatal());
    }

    #[test]
    fn transport_is_fatal() {
        let err = Error::Channel(ChannelError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_fatal());
    }

    #[test]
    fn recoverable_classes_are_not_fatal() {
        assert!(!Error::Permission("denied".into()).is_fatal());
        assert!(!Error::NotFound("gone".into()).is_fatal());
        assert!(!Error::Busy("raw mode".into()).is_fatal());
        assert!(!Error::Argument("bad".into()).is_fatal());
    }

    #[test]
    fn timeout_carries_partial_data() {
        let err = ChannelError::Timeout {
            partial: b"half a lin".to_vec(),
            elapsed: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("10 bytes"));
    }
}
