use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority. Higher values are handed to workers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job claimed from the broker.
///
/// The payload is kept byte-for-byte as it sits in the staging list, since the
/// acknowledger removes the ledger entry by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub priority: Priority,
    pub payload: Vec<u8>,
    pub claimed_at: DateTime<Utc>,
}

impl Job {
    /// Build a job for a payload claimed just now. The id is derived from the
    /// payload and the claim timestamp.
    pub fn claimed(queue: impl Into<String>, priority: Priority, payload: Vec<u8>) -> Self {
        Self::claimed_at(queue, priority, payload, Utc::now())
    }

    pub fn claimed_at(
        queue: impl Into<String>,
        priority: Priority,
        payload: Vec<u8>,
        claimed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::derive_id(&payload, claimed_at),
            queue: queue.into(),
            priority,
            payload,
            claimed_at,
        }
    }

    fn derive_id(payload: &[u8], claimed_at: DateTime<Utc>) -> Uuid {
        let nanos = claimed_at.timestamp_nanos_opt().unwrap_or_default();
        let mut name = Vec::with_capacity(payload.len() + 8);
        name.extend_from_slice(payload);
        name.extend_from_slice(&nanos.to_be_bytes());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &name)
    }

    /// Payload as UTF-8, for logging.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
