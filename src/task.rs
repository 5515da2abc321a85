use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// In-memory descriptor of one submitted unit of work.
///
/// A `Task` is what flows through the `QueueManager` and worker pool; the
/// durable truth lives in the `tasks` row it points at. A task must be
/// persisted (have `id` assigned) before it may be admitted or executed.
#[derive(Debug, Clone)]
pub struct Task {
    /// Identity of the durable record; `None` until persisted.
    pub id: Option<i64>,
    pub principal: String,
    pub consumer_id: String,
    pub payload_type: String,
    pub payload: JsonValue,
    /// Mutual-exclusion domain; `None` means no exclusivity constraint.
    pub group_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl Task {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

/// Equality is defined solely by the assigned durable record id. Tasks
/// without an id are never equal, not even to themselves, which guards
/// against accidental double-admission before persistence.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
