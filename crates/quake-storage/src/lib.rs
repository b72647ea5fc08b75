//! Event store capability: setup, upsert, expiry delete, ordered scan and
//! nearest-point queries over one geospatially indexed table.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use quake_core::{Event, NearestMatch, NearestOptions, Point};
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryEventStore;
pub use postgres::{DatabaseConfig, PgEventStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("table {0:?} does not exist")]
    MissingTable(String),
    #[error("invalid identifier {0:?}: expected [A-Za-z_][A-Za-z0-9_]{{0,62}}")]
    InvalidIdentifier(String),
    #[error("stored row {id:?} is not a valid event: {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Result of an idempotent create step. "Already exists" is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPredicate {
    /// `occurred_at_epoch_millis` strictly before the cutoff.
    OccurredBefore(i64),
    All,
}

impl EventPredicate {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventPredicate::OccurredBefore(cutoff) => event.occurred_before(*cutoff),
            EventPredicate::All => true,
        }
    }
}

/// Storage operations the sync pipeline and query service depend on.
///
/// Every call acquires its own connection and releases it before returning,
/// so concurrent callers never share one.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_database_if_absent(&self, database: &str) -> Result<SetupOutcome, StoreError>;

    async fn create_table_if_absent(&self, table: &str) -> Result<SetupOutcome, StoreError>;

    async fn create_geo_index_if_absent(
        &self,
        table: &str,
        field: &str,
    ) -> Result<SetupOutcome, StoreError>;

    /// Insert new events and replace existing ones by `id`. Each record is
    /// written atomically; a failing record is counted, not propagated.
    async fn upsert_many(&self, table: &str, events: &[Event]) -> Result<UpsertSummary, StoreError>;

    async fn delete_where(&self, table: &str, predicate: EventPredicate) -> Result<u64, StoreError>;

    async fn query_ordered_by_magnitude_desc(&self, table: &str) -> Result<Vec<Event>, StoreError>;

    /// Nearest events to `point`, ascending by distance.
    async fn query_nearest(
        &self,
        table: &str,
        point: Point,
        options: &NearestOptions,
    ) -> Result<Vec<NearestMatch>, StoreError>;
}

/// Validate a table/index/database name and return it double-quoted.
pub fn quote_identifier(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn identifiers_are_validated_before_quoting() {
        assert_eq!(quote_identifier("quakes").unwrap(), "\"quakes\"");
        assert_eq!(quote_identifier("_q2").unwrap(), "\"_q2\"");
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("2quakes").is_err());
        assert!(quote_identifier("quakes\"; drop table x; --").is_err());
        assert!(quote_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn predicate_matching() {
        let event = Event {
            id: "a".into(),
            magnitude: 5.0,
            occurred_at_epoch_millis: 1_000,
            depth_km: None,
            location: Point::new(0.0, 0.0).unwrap(),
            properties: Map::new(),
        };
        assert!(EventPredicate::OccurredBefore(1_001).matches(&event));
        assert!(!EventPredicate::OccurredBefore(1_000).matches(&event));
        assert!(EventPredicate::All.matches(&event));
    }
}
