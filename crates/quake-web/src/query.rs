//! Read-side queries over the event store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quake_core::{DistanceUnit, Event, NearestMatch, NearestOptions, Point};
use quake_storage::{EventStore, StoreError};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RESULTS_LIMIT: usize = 1_000;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),
    #[error("store query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            QueryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "err": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// Query-string parameters of a nearest lookup, kept as text so that bad
/// input turns into [`QueryError::InvalidQuery`] instead of a bare rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NearestParams {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub max_results: Option<String>,
    pub max_distance: Option<String>,
    pub unit: Option<String>,
}

fn required_number(name: &str, value: Option<&str>) -> Result<f64, QueryError> {
    let text = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| QueryError::InvalidQuery(format!("missing {name}")))?;
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| QueryError::InvalidQuery(format!("{name} must be a number, got {text:?}")))
}

impl NearestParams {
    pub fn point(&self) -> Result<Point, QueryError> {
        let latitude = required_number("latitude", self.latitude.as_deref())?;
        let longitude = required_number("longitude", self.longitude.as_deref())?;
        Point::new(latitude, longitude).map_err(|err| QueryError::InvalidQuery(err.to_string()))
    }

    pub fn options(&self) -> Result<NearestOptions, QueryError> {
        let mut options = NearestOptions::default();

        if let Some(unit) = self.unit.as_deref().filter(|u| !u.trim().is_empty()) {
            options.unit = unit
                .parse::<DistanceUnit>()
                .map_err(|err| QueryError::InvalidQuery(err.to_string()))?;
        }
        if let Some(raw) = self.max_results.as_deref().filter(|v| !v.trim().is_empty()) {
            options.max_results = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=MAX_RESULTS_LIMIT).contains(n))
                .ok_or_else(|| {
                    QueryError::InvalidQuery(format!(
                        "max_results must be between 1 and {MAX_RESULTS_LIMIT}"
                    ))
                })?;
        }
        if self.max_distance.as_deref().is_some_and(|v| !v.trim().is_empty()) {
            let distance = required_number("max_distance", self.max_distance.as_deref())?;
            if distance <= 0.0 {
                return Err(QueryError::InvalidQuery(
                    "max_distance must be positive".to_string(),
                ));
            }
            options.max_distance = Some(distance);
        }
        Ok(options)
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn EventStore>,
    table: String,
    timeout: Duration,
}

impl QueryService {
    pub fn new(store: Arc<dyn EventStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        query: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, QueryError> {
        tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| QueryError::Timeout(self.timeout))?
            .map_err(QueryError::Store)
    }

    /// Every event, largest magnitude first.
    pub async fn list_all(&self) -> Result<Vec<Event>, QueryError> {
        self.bounded(self.store.query_ordered_by_magnitude_desc(&self.table))
            .await
    }

    /// Events nearest to the requested point, closest first. Parameters are
    /// validated before the store is touched.
    pub async fn find_nearest(&self, params: &NearestParams) -> Result<Vec<NearestMatch>, QueryError> {
        let point = params.point()?;
        let options = params.options()?;
        self.bounded(self.store.query_nearest(&self.table, point, &options))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quake_storage::{EventPredicate, MemoryEventStore, SetupOutcome, UpsertSummary};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TABLE: &str = "quakes";

    /// Counts read queries so tests can assert the store was never reached.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryEventStore,
        reads: AtomicUsize,
        stall: bool,
    }

    #[async_trait]
    impl EventStore for CountingStore {
        async fn create_database_if_absent(&self, database: &str) -> Result<SetupOutcome, StoreError> {
            self.inner.create_database_if_absent(database).await
        }

        async fn create_table_if_absent(&self, table: &str) -> Result<SetupOutcome, StoreError> {
            self.inner.create_table_if_absent(table).await
        }

        async fn create_geo_index_if_absent(
            &self,
            table: &str,
            field: &str,
        ) -> Result<SetupOutcome, StoreError> {
            self.inner.create_geo_index_if_absent(table, field).await
        }

        async fn upsert_many(&self, table: &str, events: &[Event]) -> Result<UpsertSummary, StoreError> {
            self.inner.upsert_many(table, events).await
        }

        async fn delete_where(&self, table: &str, predicate: EventPredicate) -> Result<u64, StoreError> {
            self.inner.delete_where(table, predicate).await
        }

        async fn query_ordered_by_magnitude_desc(&self, table: &str) -> Result<Vec<Event>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.inner.query_ordered_by_magnitude_desc(table).await
        }

        async fn query_nearest(
            &self,
            table: &str,
            point: Point,
            options: &NearestOptions,
        ) -> Result<Vec<NearestMatch>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.query_nearest(table, point, options).await
        }
    }

    fn mk_event(id: &str, magnitude: f64, lat: f64, lon: f64) -> Event {
        Event {
            id: id.to_string(),
            magnitude,
            occurred_at_epoch_millis: 1_700_000_000_000,
            depth_km: Some(10.0),
            location: Point::new(lat, lon).unwrap(),
            properties: Map::new(),
        }
    }

    async fn seeded(events: &[Event]) -> Arc<CountingStore> {
        let store = Arc::new(CountingStore::default());
        store.create_table_if_absent(TABLE).await.unwrap();
        store.upsert_many(TABLE, events).await.unwrap();
        store
    }

    fn params(lat: Option<&str>, lon: Option<&str>) -> NearestParams {
        NearestParams {
            latitude: lat.map(String::from),
            longitude: lon.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_all_orders_by_magnitude_descending() {
        let store = seeded(&[
            mk_event("a", 5.1, 0.0, 0.0),
            mk_event("b", 6.7, 1.0, 1.0),
            mk_event("c", 4.0, 2.0, 2.0),
        ])
        .await;
        let service = QueryService::new(store, TABLE);
        let mags = service
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.magnitude)
            .collect::<Vec<_>>();
        assert_eq!(mags, vec![6.7, 5.1, 4.0]);
    }

    #[tokio::test]
    async fn find_nearest_returns_closest_first() {
        let store = seeded(&[
            mk_event("origin", 5.0, 0.0, 0.0),
            mk_event("one", 5.0, 1.0, 1.0),
            mk_event("ten", 5.0, 10.0, 10.0),
        ])
        .await;
        let service = QueryService::new(store, TABLE);

        let hits = service
            .find_nearest(&params(Some("0.1"), Some("0.1")))
            .await
            .unwrap();
        assert_eq!(hits[0].event.id, "origin");
        assert_eq!(hits[1].event.id, "one");
        assert!(hits[0].distance < hits[1].distance);
        assert_eq!(hits[0].unit, DistanceUnit::Miles);
    }

    #[tokio::test]
    async fn find_nearest_honors_radius_and_unit() {
        let store = seeded(&[
            mk_event("origin", 5.0, 0.0, 0.0),
            mk_event("ten", 5.0, 10.0, 10.0),
        ])
        .await;
        let service = QueryService::new(store, TABLE);
        let hits = service
            .find_nearest(&NearestParams {
                max_distance: Some("50".into()),
                unit: Some("km".into()),
                ..params(Some("0.1"), Some("0.1"))
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit, DistanceUnit::Kilometers);
        assert!(hits[0].distance < 50.0);
    }

    #[tokio::test]
    async fn invalid_coordinates_never_reach_the_store() {
        let store = seeded(&[mk_event("origin", 5.0, 0.0, 0.0)]).await;
        let service = QueryService::new(store.clone(), TABLE);

        for bad in [
            params(None, Some("5")),
            params(Some("1"), None),
            params(Some(""), Some("5")),
            params(Some("north"), Some("5")),
            params(Some("NaN"), Some("5")),
            params(Some("95"), Some("5")),
            NearestParams {
                max_results: Some("0".into()),
                ..params(Some("1"), Some("1"))
            },
            NearestParams {
                max_distance: Some("-3".into()),
                ..params(Some("1"), Some("1"))
            },
            NearestParams {
                unit: Some("parsec".into()),
                ..params(Some("1"), Some("1"))
            },
        ] {
            let err = service.find_nearest(&bad).await.unwrap_err();
            assert!(matches!(err, QueryError::InvalidQuery(_)), "{bad:?} -> {err}");
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failures_surface_as_query_errors() {
        let service = QueryService::new(Arc::new(MemoryEventStore::new()), "missing");
        let err = service.list_all().await.unwrap_err();
        assert!(matches!(err, QueryError::Store(StoreError::MissingTable(_))));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn slow_queries_time_out() {
        let store = Arc::new(CountingStore {
            stall: true,
            ..Default::default()
        });
        let service = QueryService::new(store, TABLE).with_timeout(Duration::from_millis(20));
        let err = service.list_all().await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
