use chrono::{DateTime, Utc};

/// A domain event.
///
/// Events are facts: immutable once raised, versioned for schema evolution,
/// and named with a stable dotted type (e.g. `"inventory.low_stock"`).
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn schema_version(&self) -> u32 {
        1
    }

    /// When the underlying change happened (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
