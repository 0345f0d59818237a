use bytes::Bytes;
use chrono::{DateTime, Utc};

/// An inbound transport packet.
///
/// The payload is opaque to the core; family-specific code decodes it.
/// Cloning is cheap (`Bytes` is reference counted), but the pipeline moves
/// each packet into its ring buffer exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl Packet {
    /// Wrap a payload, stamping it with the current time.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::received_at(payload, Utc::now())
    }

    pub fn received_at(payload: impl Into<Bytes>, received_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            received_at,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
