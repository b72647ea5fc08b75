//! PostgreSQL + PostGIS implementation of [`EventStore`].
//!
//! Locations are stored as `GEOGRAPHY(POINT, 4326)`. PostGIS points are
//! longitude-first; the upsert and nearest statements are the only places
//! that ordering is written.

use std::time::Duration;

use async_trait::async_trait;
use quake_core::{Event, NearestMatch, NearestOptions, Point};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, PgPool, Row};
use tracing::{info, warn};

use crate::{quote_identifier, EventPredicate, EventStore, SetupOutcome, StoreError, UpsertSummary};

const DUPLICATE_DATABASE: &str = "42P04";
const DUPLICATE_RELATION: &str = "42P07";
const DUPLICATE_OBJECT: &str = "42710";

const EVENT_COLUMNS: &str = "id, magnitude, occurred_at_ms, depth_km, properties, \
     ST_Y(location::geometry) AS latitude, ST_X(location::geometry) AS longitude";

const UPSERT_SQL: &str = r#"
    INSERT INTO {table} (id, magnitude, occurred_at_ms, depth_km, properties, location, updated_at)
    VALUES ($1, $2, $3, $4, $5, ST_SetSRID(ST_MakePoint($6, $7), 4326)::geography, NOW())
    ON CONFLICT (id) DO UPDATE
       SET magnitude = EXCLUDED.magnitude,
           occurred_at_ms = EXCLUDED.occurred_at_ms,
           depth_km = EXCLUDED.depth_km,
           properties = EXCLUDED.properties,
           location = EXCLUDED.location,
           updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

// `<->` and the sphere form of ST_Distance agree, so rows come back in the
// order of the reported distance while the GiST index drives the scan.
const NEAREST_SQL: &str = r#"
    WITH q AS (SELECT ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography AS pt)
    SELECT {columns},
           ST_Distance(e.location, q.pt, false) AS distance_m
      FROM {table} e, q
     WHERE $3::float8 IS NULL OR ST_DWithin(e.location, q.pt, $3::float8, false)
     ORDER BY e.location <-> q.pt
     LIMIT $4
"#;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Database used for the one-off connection that issues `CREATE DATABASE`.
    pub maintenance_database: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "quakes".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            maintenance_database: "postgres".to_string(),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("QUAKES_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("QUAKES_DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: std::env::var("QUAKES_DB_NAME").unwrap_or(defaults.database),
            username: std::env::var("QUAKES_DB_USER").unwrap_or(defaults.username),
            password: std::env::var("QUAKES_DB_PASSWORD").unwrap_or(defaults.password),
            maintenance_database: std::env::var("QUAKES_DB_MAINTENANCE_NAME")
                .unwrap_or(defaults.maintenance_database),
            max_connections: std::env::var("QUAKES_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: defaults.acquire_timeout,
        }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(database)
    }
}

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    maintenance: PgConnectOptions,
}

impl PgEventStore {
    /// Build a lazily connecting pool; nothing touches the network until the
    /// first operation, so an unreachable database never blocks startup.
    pub fn new(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(config.connect_options(&config.database));
        Self {
            pool,
            maintenance: config.connect_options(&config.maintenance_database),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_already_exists(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(DUPLICATE_DATABASE | DUPLICATE_RELATION | DUPLICATE_OBJECT)
        ),
        _ => false,
    }
}

fn setup_outcome(
    result: Result<impl Sized, sqlx::Error>,
    object: &str,
) -> Result<SetupOutcome, StoreError> {
    match result {
        Ok(_) => {
            info!(object, "created");
            Ok(SetupOutcome::Created)
        }
        Err(err) if is_already_exists(&err) => {
            info!(object, "already exists");
            Ok(SetupOutcome::AlreadyExists)
        }
        Err(err) => Err(StoreError::Database(err)),
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let id: String = row.try_get("id")?;
    let latitude: f64 = row.try_get("latitude")?;
    let longitude: f64 = row.try_get("longitude")?;
    let location = Point::new(latitude, longitude).map_err(|err| StoreError::CorruptRow {
        id: id.clone(),
        reason: err.to_string(),
    })?;
    let Json(properties): Json<Map<String, JsonValue>> = row.try_get("properties")?;

    Ok(Event {
        magnitude: row.try_get("magnitude")?,
        occurred_at_epoch_millis: row.try_get("occurred_at_ms")?,
        depth_km: row.try_get("depth_km")?,
        location,
        properties,
        id,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_database_if_absent(&self, database: &str) -> Result<SetupOutcome, StoreError> {
        let name = quote_identifier(database)?;
        let mut conn = PgConnection::connect_with(&self.maintenance).await?;
        let sql = format!("CREATE DATABASE {name}");
        let result = sqlx::query(&sql).execute(&mut conn).await;
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing maintenance connection");
        }
        setup_outcome(result, database)
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<SetupOutcome, StoreError> {
        let name = quote_identifier(table)?;
        let mut conn = self.pool.acquire().await?;
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&mut *conn)
            .await?;

        let sql = format!(
            r#"
            CREATE TABLE {name} (
                id TEXT PRIMARY KEY,
                magnitude DOUBLE PRECISION NOT NULL,
                occurred_at_ms BIGINT NOT NULL,
                depth_km DOUBLE PRECISION,
                properties JSONB NOT NULL,
                location GEOGRAPHY(POINT, 4326) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        );
        let result = sqlx::query(&sql).execute(&mut *conn).await;
        setup_outcome(result, table)
    }

    async fn create_geo_index_if_absent(
        &self,
        table: &str,
        field: &str,
    ) -> Result<SetupOutcome, StoreError> {
        let table_name = quote_identifier(table)?;
        let column = quote_identifier(field)?;
        let index_name = quote_identifier(&format!("{table}_{field}_geo_idx"))?;
        let mut conn = self.pool.acquire().await?;
        let sql = format!("CREATE INDEX {index_name} ON {table_name} USING GIST ({column})");
        let result = sqlx::query(&sql).execute(&mut *conn).await;
        setup_outcome(result, &index_name)
    }

    async fn upsert_many(&self, table: &str, events: &[Event]) -> Result<UpsertSummary, StoreError> {
        let sql = UPSERT_SQL.replace("{table}", &quote_identifier(table)?);
        let mut conn = self.pool.acquire().await?;
        let mut summary = UpsertSummary::default();

        for event in events {
            let result = sqlx::query(&sql)
                .bind(&event.id)
                .bind(event.magnitude)
                .bind(event.occurred_at_epoch_millis)
                .bind(event.depth_km)
                .bind(Json(&event.properties))
                .bind(event.location.longitude())
                .bind(event.location.latitude())
                .fetch_one(&mut *conn)
                .await
                .and_then(|row| row.try_get::<bool, _>("inserted"));

            match result {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.replaced += 1,
                Err(err) => {
                    warn!(id = %event.id, error = %err, "event upsert failed");
                    summary.errored += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn delete_where(&self, table: &str, predicate: EventPredicate) -> Result<u64, StoreError> {
        let name = quote_identifier(table)?;
        let mut conn = self.pool.acquire().await?;
        let result = match predicate {
            EventPredicate::OccurredBefore(cutoff) => {
                sqlx::query(&format!("DELETE FROM {name} WHERE occurred_at_ms < $1"))
                    .bind(cutoff)
                    .execute(&mut *conn)
                    .await?
            }
            EventPredicate::All => {
                sqlx::query(&format!("DELETE FROM {name}"))
                    .execute(&mut *conn)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn query_ordered_by_magnitude_desc(&self, table: &str) -> Result<Vec<Event>, StoreError> {
        let name = quote_identifier(table)?;
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM {name} ORDER BY magnitude DESC"
        ))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn query_nearest(
        &self,
        table: &str,
        point: Point,
        options: &NearestOptions,
    ) -> Result<Vec<NearestMatch>, StoreError> {
        let columns = EVENT_COLUMNS
            .replace("ST_Y(location", "ST_Y(e.location")
            .replace("ST_X(location", "ST_X(e.location");
        let sql = NEAREST_SQL
            .replace("{columns}", &columns)
            .replace("{table}", &quote_identifier(table)?);
        let limit = i64::try_from(options.max_results).unwrap_or(i64::MAX);

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(point.longitude())
            .bind(point.latitude())
            .bind(options.max_distance_meters())
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;

        rows.iter()
            .map(|row| {
                let meters: f64 = row.try_get("distance_m")?;
                Ok(NearestMatch {
                    distance: options.unit.from_meters(meters),
                    unit: options.unit,
                    event: event_from_row(row)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_templates_bind_longitude_before_latitude() {
        assert!(UPSERT_SQL.contains("ST_MakePoint($6, $7)"));
        assert!(NEAREST_SQL.contains("ST_MakePoint($1, $2)"));
    }

    #[test]
    fn nearest_sql_renders_with_qualified_columns() {
        let columns = EVENT_COLUMNS.replace("ST_Y(location", "ST_Y(e.location");
        assert!(columns.contains("ST_Y(e.location::geometry) AS latitude"));
    }

    #[test]
    fn non_database_errors_are_not_already_exists() {
        assert!(!is_already_exists(&sqlx::Error::RowNotFound));
        assert!(matches!(
            setup_outcome(Err::<(), _>(sqlx::Error::PoolTimedOut), "quakes"),
            Err(StoreError::Database(_))
        ));
        assert_eq!(setup_outcome(Ok(()), "quakes").unwrap(), SetupOutcome::Created);
    }

    fn assert_event_store<S: EventStore + 'static>() {}

    #[tokio::test]
    async fn pg_store_implements_event_store() {
        assert_event_store::<PgEventStore>();
        let store: std::sync::Arc<dyn EventStore> =
            std::sync::Arc::new(PgEventStore::new(&DatabaseConfig::default()));
        drop(store);
    }

    #[test]
    fn config_defaults_target_local_postgres() {
        let config = DatabaseConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "quakes");
        assert_eq!(config.maintenance_database, "postgres");
    }

    fn live_event(id: &str, magnitude: f64, lat: f64, lon: f64) -> Event {
        Event {
            id: id.to_string(),
            magnitude,
            occurred_at_epoch_millis: 1_700_000_000_000,
            depth_km: Some(5.0),
            location: Point::new(lat, lon).unwrap(),
            properties: Map::new(),
        }
    }

    #[tokio::test]
    #[ignore = "needs a PostGIS database reachable through QUAKES_DB_*"]
    async fn postgis_round_trip_against_live_database() {
        let store = PgEventStore::new(&DatabaseConfig::from_env());
        let table = format!("quakes_it_{}", std::process::id());

        assert_eq!(store.create_table_if_absent(&table).await.unwrap(), SetupOutcome::Created);
        assert_eq!(
            store.create_table_if_absent(&table).await.unwrap(),
            SetupOutcome::AlreadyExists
        );
        assert_eq!(
            store.create_geo_index_if_absent(&table, "location").await.unwrap(),
            SetupOutcome::Created
        );
        assert_eq!(
            store.create_geo_index_if_absent(&table, "location").await.unwrap(),
            SetupOutcome::AlreadyExists
        );

        let events = [
            live_event("origin", 5.0, 0.0, 0.0),
            live_event("north", 6.0, 1.0, 0.0),
            live_event("far", 4.5, 40.0, 120.0),
        ];
        let first = store.upsert_many(&table, &events).await.unwrap();
        assert_eq!((first.inserted, first.replaced), (3, 0));
        let second = store.upsert_many(&table, &events[..1]).await.unwrap();
        assert_eq!((second.inserted, second.replaced), (0, 1));

        let ordered = store.query_ordered_by_magnitude_desc(&table).await.unwrap();
        assert_eq!(ordered[0].id, "north");
        assert_eq!(ordered[0].location.latitude(), 1.0);

        let options = NearestOptions {
            max_distance: Some(500.0),
            unit: quake_core::DistanceUnit::Kilometers,
            ..Default::default()
        };
        let hits = store
            .query_nearest(&table, Point::new(0.1, 0.0).unwrap(), &options)
            .await
            .unwrap();
        assert_eq!(
            hits.iter().map(|h| h.event.id.as_str()).collect::<Vec<_>>(),
            vec!["origin", "north"]
        );
        assert!(hits[0].distance < hits[1].distance);

        sqlx::query(&format!("DROP TABLE {}", quote_identifier(&table).unwrap()))
            .execute(&store.pool)
            .await
            .unwrap();
        store.close().await;
    }
}
