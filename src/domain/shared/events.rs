//! Domain event envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something that happened to an aggregate
pub trait DomainEvent: Send + Sync {
    fn event_type(&self) -> &'static str;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// Position among the events of the same aggregate, starting at 1
    fn sequence(&self) -> u64;
}

/// Identity and ordering shared by every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub sequence: u64,
}

impl EventMetadata {
    pub fn new(sequence: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            sequence,
        }
    }
}
