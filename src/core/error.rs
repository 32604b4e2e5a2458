//! Error types for the M&C stack.
//!
//! The taxonomy separates caller bugs (`Encoding`), protocol mismatches
//! (`Decoding`), misconfiguration (`UnknownCommand`, `Config`), and the two
//! transport-level outcomes with very different retry policies: `Timeout`
//! (retried exactly once by the connection) and `Transport` (fatal to the
//! session, never retried).

use thiserror::Error;

use crate::core::address::BusAddress;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the M&C stack.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad payload or address shape. A caller bug, never retried.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Reply shape mismatch. May indicate a firmware/protocol mismatch,
    /// never retried.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// No composed capability layer defines the requested command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// No reply within the deadline.
    #[error("no reply within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Adapter-level fault. Fatal to the session; the session must be
    /// closed and reopened by the caller.
    #[error("transport fault: {0}")]
    Transport(String),

    /// Invalid configuration or capability composition.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session is closed or latched by a prior transport fault.
    #[error("session unusable: {0}")]
    SessionClosed(String),

    /// A transaction failed; carries the originating address and command
    /// name for diagnosability.
    #[error("{command} at {address}: {source}")]
    Command {
        command: String,
        address: BusAddress,
        #[source]
        source: Box<Error>,
    },

    /// An in-band transaction failure lifted back into an error.
    #[error("{detail}")]
    Failed { kind: FailureKind, detail: String },
}

impl Error {
    /// Shorthand for a decoding error.
    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }

    /// Shorthand for an encoding error.
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// Attach command name and bus address context to an error.
    pub fn with_command(self, command: impl Into<String>, address: BusAddress) -> Self {
        Self::Command {
            command: command.into(),
            address,
            source: Box::new(self),
        }
    }

    /// Classify this error for transaction-level failure reporting.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Encoding(_) => FailureKind::Encoding,
            Self::Decoding(_) => FailureKind::Decoding,
            Self::UnknownCommand(_) => FailureKind::UnknownCommand,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Transport(_) | Self::SessionClosed(_) => FailureKind::Transport,
            Self::Config(_) => FailureKind::Config,
            Self::Command { source, .. } => source.failure_kind(),
            Self::Failed { kind, .. } => *kind,
        }
    }
}

/// Failure classification attached to a failed transaction result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Request could not be serialized.
    Encoding,
    /// Reply could not be interpreted.
    Decoding,
    /// Command not defined by any composed layer.
    UnknownCommand,
    /// No reply within the deadline, after the single transparent retry.
    Timeout,
    /// Adapter fault or session latched/closed.
    Transport,
    /// Misconfiguration detected at call time.
    Config,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Encoding => "encoding",
            Self::Decoding => "decoding",
            Self::UnknownCommand => "unknown command",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Config => "config",
        };
        write!(f, "{}", s)
    }
}
