//! In-process store for demo runs and tests. Distances are haversine on a
//! spherical earth, so they differ slightly from PostGIS spheroid results.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use quake_core::{Event, NearestMatch, NearestOptions, Point};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{EventPredicate, EventStore, SetupOutcome, StoreError, UpsertSummary};

#[derive(Debug, Default)]
struct MemoryTable {
    rows: BTreeMap<String, Event>,
    geo_indexes: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    databases: RwLock<HashSet<String>>,
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, table: &str) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|t| t.rows.len())
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Event>, StoreError> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|t| t.rows.get(id).cloned())
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    pub async fn has_geo_index(&self, table: &str, field: &str) -> bool {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|t| t.geo_indexes.contains(field))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_database_if_absent(&self, database: &str) -> Result<SetupOutcome, StoreError> {
        let mut databases = self.databases.write().await;
        if databases.insert(database.to_string()) {
            Ok(SetupOutcome::Created)
        } else {
            debug!(database, "database already exists");
            Ok(SetupOutcome::AlreadyExists)
        }
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<SetupOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(table) {
            debug!(table, "table already exists");
            return Ok(SetupOutcome::AlreadyExists);
        }
        tables.insert(table.to_string(), MemoryTable::default());
        Ok(SetupOutcome::Created)
    }

    async fn create_geo_index_if_absent(
        &self,
        table: &str,
        field: &str,
    ) -> Result<SetupOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        if entry.geo_indexes.insert(field.to_string()) {
            Ok(SetupOutcome::Created)
        } else {
            debug!(table, field, "geo index already exists");
            Ok(SetupOutcome::AlreadyExists)
        }
    }

    async fn upsert_many(&self, table: &str, events: &[Event]) -> Result<UpsertSummary, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let mut summary = UpsertSummary::default();
        for event in events {
            match entry.rows.insert(event.id.clone(), event.clone()) {
                Some(_) => summary.replaced += 1,
                None => summary.inserted += 1,
            }
        }
        Ok(summary)
    }

    async fn delete_where(&self, table: &str, predicate: EventPredicate) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let before = entry.rows.len();
        entry.rows.retain(|_, event| !predicate.matches(event));
        Ok((before - entry.rows.len()) as u64)
    }

    async fn query_ordered_by_magnitude_desc(&self, table: &str) -> Result<Vec<Event>, StoreError> {
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let mut events = entry.rows.values().cloned().collect::<Vec<_>>();
        events.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
        Ok(events)
    }

    async fn query_nearest(
        &self,
        table: &str,
        point: Point,
        options: &NearestOptions,
    ) -> Result<Vec<NearestMatch>, StoreError> {
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let max_meters = options.max_distance_meters();
        let mut hits = entry
            .rows
            .values()
            .map(|event| (point.haversine_meters(&event.location), event))
            .filter(|(meters, _)| max_meters.map_or(true, |max| *meters <= max))
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(hits
            .into_iter()
            .take(options.max_results)
            .map(|(meters, event)| NearestMatch {
                distance: options.unit.from_meters(meters),
                unit: options.unit,
                event: event.clone(),
            })
            .collect())
    }
}
