// ── Core error types ──
//
// Every public operation in hearth-core returns `Result<_, CoreError>`.
// RPC front-ends translate variants into numeric fault codes through
// `CoreError::code()`, so "doesn't exist" and "not permitted" stay
// distinguishable on the wire.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Not found ────────────────────────────────────────────────────
    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: u32 },

    #[error("Unknown parameter: {parameter}")]
    UnknownParameter { parameter: String },

    #[error("Unknown parameter set: {paramset}")]
    UnknownParamset { paramset: String },

    #[error("Peer not found: {identifier}")]
    UnknownPeer { identifier: String },

    #[error("Device not found: {identifier}")]
    UnknownDevice { identifier: String },

    #[error("Peer {peer_id} is not a central peer")]
    NotCentral { peer_id: u64 },

    // ── Not permitted ────────────────────────────────────────────────
    #[error("Parameter is not readable: {parameter}")]
    NotReadable { parameter: String },

    #[error("Parameter is not writeable: {parameter}")]
    NotWriteable { parameter: String },

    #[error("{entity} is disposing")]
    Disposing { entity: String },

    // ── Invalid input ────────────────────────────────────────────────
    #[error("Factor is \"0\" or no valid number: {operand}")]
    InvalidFactor { operand: String },

    #[error("New peer ID is invalid: {id}")]
    InvalidPeerId { id: u64 },

    #[error("New peer ID is already in use: {id}")]
    PeerIdInUse { id: u64 },

    #[error("Cannot convert value for {parameter}: {reason}")]
    Conversion { parameter: String, reason: String },

    // ── Transient I/O ────────────────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Packet queue of interface {interface} is full ({capacity} packets), packet dropped")]
    QueueFull { interface: String, capacity: usize },

    #[error("Packet subscriber {subscriber} failed: {message}")]
    Subscriber { subscriber: String, message: String },

    #[error("{entity} has no upstream event sink")]
    Detached { entity: String },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Disposal finished with {} error(s)", .errors.len())]
    Disposal { errors: Vec<CoreError> },

    #[error("Background task panicked: {task}")]
    TaskPanicked { task: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Numeric fault code reported to RPC clients.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidFactor { .. } => -1,
            Self::UnknownChannel { .. }
            | Self::UnknownPeer { .. }
            | Self::UnknownDevice { .. }
            | Self::NotCentral { .. } => -2,
            Self::UnknownParamset { .. } => -3,
            Self::UnknownParameter { .. } => -5,
            Self::NotReadable { .. } | Self::NotWriteable { .. } | Self::Conversion { .. } => -6,
            Self::InvalidPeerId { .. } => -100,
            Self::PeerIdInUse { .. } => -101,
            Self::Storage { .. } | Self::Detached { .. } => -32501,
            Self::QueueFull { .. } | Self::Subscriber { .. } => -32502,
            Self::Disposal { .. } => -32503,
            Self::Disposing { .. } | Self::TaskPanicked { .. } | Self::Internal(_) => -32500,
        }
    }

    /// `true` for errors that mean the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownChannel { .. }
                | Self::UnknownParameter { .. }
                | Self::UnknownParamset { .. }
                | Self::UnknownPeer { .. }
                | Self::UnknownDevice { .. }
                | Self::NotCentral { .. }
        )
    }

    pub(crate) fn disposing(entity: impl Into<String>) -> Self {
        Self::Disposing {
            entity: entity.into(),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON encoding failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_not_permitted_codes_differ() {
        let missing = CoreError::UnknownParameter {
            parameter: "LEVEL".into(),
        };
        let denied = CoreError::NotWriteable {
            parameter: "LEVEL".into(),
        };
        assert_eq!(missing.code(), -5);
        assert_eq!(denied.code(), -6);
        assert!(missing.is_not_found());
        assert!(!denied.is_not_found());
    }

    #[test]
    fn disposal_message_counts_children() {
        let err = CoreError::Disposal {
            errors: vec![CoreError::Internal("a".into()), CoreError::Internal("b".into())],
        };
        assert_eq!(err.to_string(), "Disposal finished with 2 error(s)");
        assert_eq!(err.code(), -32503);
    }
}
