//! Crate-wide error type.
//!
//! Turn outcomes are not errors: every failure mode of a turn is reported as a
//! [`TurnStatus`](crate::agent::turn::TurnStatus). [`Error`] covers the
//! things that happen around a turn (loading config, building a client,
//! writing history files, calling a closed session).

use crate::api::ModelError;

/// Errors surfaced by the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Model call failed outside of a turn (client construction, manual calls).
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Tool engine setup failed (bad tools file, duplicate names).
    #[error("tool error: {0}")]
    Tool(String),

    /// The session was already closed.
    #[error("session is closed")]
    SessionClosed,
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Error>;
