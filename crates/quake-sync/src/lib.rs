//! Sync pipeline: initial store setup, feed refresh, retention expiry and the
//! recurring cycle that combines them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use quake_feed::{
    normalize_batch, FeedClientConfig, FeedSource, FetchError, FileFeed, HttpFeedClient,
    DEFAULT_FEED_URL,
};
use quake_storage::{DatabaseConfig, EventPredicate, EventStore, SetupOutcome, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const GEO_FIELD: &str = "location";
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Retention window for a day count; values too large for a `TimeDelta`
/// fall back to the default.
pub fn retention_from_days(days: i64) -> chrono::Duration {
    chrono::Duration::try_days(days.max(1)).unwrap_or_else(|| {
        warn!(days, "retention out of range; using default");
        chrono::Duration::days(DEFAULT_RETENTION_DAYS)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_kind: StoreKind,
    pub database: DatabaseConfig,
    pub table: String,
    pub feed_url: String,
    pub feed_file: Option<PathBuf>,
    pub refresh_interval: Duration,
    pub retention_days: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_kind: match std::env::var("QUAKES_STORE").as_deref() {
                Ok("memory") => StoreKind::Memory,
                _ => StoreKind::Postgres,
            },
            database: DatabaseConfig::from_env(),
            table: std::env::var("QUAKES_TABLE").unwrap_or_else(|_| "quakes".to_string()),
            feed_url: std::env::var("QUAKES_FEED_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_URL.to_string()),
            feed_file: std::env::var("QUAKES_FEED_FILE").ok().map(PathBuf::from),
            refresh_interval: Duration::from_secs(
                std::env::var("QUAKES_REFRESH_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1800),
            ),
            retention_days: std::env::var("QUAKES_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            http_timeout_secs: std::env::var("QUAKES_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("QUAKES_USER_AGENT")
                .unwrap_or_else(|_| "quake-sync/0.1".to_string()),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            database: self.database.database.clone(),
            table: self.table.clone(),
            geo_field: GEO_FIELD.to_string(),
            retention: retention_from_days(self.retention_days),
        }
    }

    pub fn build_feed(&self) -> Result<Arc<dyn FeedSource>, FetchError> {
        if let Some(path) = &self.feed_file {
            return Ok(Arc::new(FileFeed::new(path)));
        }
        let client = HttpFeedClient::new(FeedClientConfig {
            url: self.feed_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Arc::new(client))
    }
}

/// Names and retention used by a [`Syncer`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub database: String,
    pub table: String,
    pub geo_field: String,
    pub retention: chrono::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database: "quakes".to_string(),
            table: "quakes".to_string(),
            geo_field: GEO_FIELD.to_string(),
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    Database,
    Table,
    GeoIndex,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetupStep::Database => "create database",
            SetupStep::Table => "create table",
            SetupStep::GeoIndex => "create geo index",
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("setup aborted at {step}: {source}")]
    Setup {
        step: SetupStep,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Refreshing,
    CycleRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub fetched: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub errored: usize,
    /// Rows removed before repopulating; only non-zero for a full replace.
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupReport {
    pub database: SetupOutcome,
    pub table: SetupOutcome,
    pub geo_index: SetupOutcome,
    pub refresh: RefreshReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub refresh: Option<RefreshReport>,
    pub expired: Option<u64>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_cycle: Option<CycleReport>,
}

/// Resets the published state to `Idle` on every exit path.
struct StateGuard<'a> {
    state: &'a watch::Sender<SyncState>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(SyncState::Idle);
    }
}

pub struct Syncer {
    store: Arc<dyn EventStore>,
    feed: Arc<dyn FeedSource>,
    settings: SyncSettings,
    state: watch::Sender<SyncState>,
    last_cycle: RwLock<Option<CycleReport>>,
    cycle_guard: Mutex<()>,
}

impl Syncer {
    pub fn new(store: Arc<dyn EventStore>, feed: Arc<dyn FeedSource>, settings: SyncSettings) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            store,
            feed,
            settings,
            state,
            last_cycle: RwLock::new(None),
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state(),
            last_cycle: self.last_cycle.read().await.clone(),
        }
    }

    fn enter(&self, state: SyncState) -> StateGuard<'_> {
        self.state.send_replace(state);
        StateGuard { state: &self.state }
    }

    /// Database, table, geo index, then one refresh. Stops at the first step
    /// that fails with anything other than "already exists". Serialized with
    /// cycles through the cycle guard.
    pub async fn initial_setup(&self) -> Result<SetupReport, SyncError> {
        let _cycle = self.cycle_guard.lock().await;
        let _state = self.enter(SyncState::Refreshing);
        let result = self.run_setup().instrument(info_span!("initial_setup")).await;
        match &result {
            Ok(report) => info!(
                inserted = report.refresh.inserted,
                replaced = report.refresh.replaced,
                skipped = report.refresh.skipped,
                "initial setup complete"
            ),
            Err(err) => error!(error = %err, "initial setup aborted; ingestion disabled until next cycle"),
        }
        result
    }

    async fn run_setup(&self) -> Result<SetupReport, SyncError> {
        let s = &self.settings;
        let database = self
            .store
            .create_database_if_absent(&s.database)
            .await
            .map_err(|source| SyncError::Setup { step: SetupStep::Database, source })?;
        let table = self
            .store
            .create_table_if_absent(&s.table)
            .await
            .map_err(|source| SyncError::Setup { step: SetupStep::Table, source })?;
        let geo_index = self
            .store
            .create_geo_index_if_absent(&s.table, &s.geo_field)
            .await
            .map_err(|source| SyncError::Setup { step: SetupStep::GeoIndex, source })?;
        let refresh = self.refresh().await?;

        Ok(SetupReport {
            database,
            table,
            geo_index,
            refresh,
        })
    }

    /// Fetch, normalize and upsert. Nothing is written if the fetch fails.
    pub async fn refresh(&self) -> Result<RefreshReport, SyncError> {
        let records = self.feed.fetch().await?;
        let batch = normalize_batch(&records);
        let summary = self.store.upsert_many(&self.settings.table, &batch.events).await?;

        let report = RefreshReport {
            fetched: records.len(),
            normalized: batch.events.len(),
            skipped: batch.skipped,
            duplicates: batch.duplicates,
            inserted: summary.inserted,
            replaced: summary.replaced,
            errored: summary.errored,
            deleted: 0,
        };
        info!(
            feed = %self.feed.describe(),
            fetched = report.fetched,
            inserted = report.inserted,
            replaced = report.replaced,
            skipped = report.skipped,
            errored = report.errored,
            "refresh complete"
        );
        Ok(report)
    }

    /// Delete events that occurred before `now - retention`. A window reaching
    /// past the earliest representable time deletes nothing.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<u64, SyncError> {
        let cutoff = now
            .checked_sub_signed(self.settings.retention)
            .map_or(i64::MIN, |cutoff| cutoff.timestamp_millis());
        let deleted = self
            .store
            .delete_where(&self.settings.table, EventPredicate::OccurredBefore(cutoff))
            .await?;
        info!(deleted, cutoff, "expired stale events");
        Ok(deleted)
    }

    /// Refresh and expiry run concurrently; a failure in either is recorded
    /// in the report and logged. Returns `None` when a cycle is already in
    /// flight.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Option<CycleReport> {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            warn!("previous sync cycle still running; skipping this tick");
            return None;
        };
        let _state = self.enter(SyncState::CycleRunning);
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let (refresh, expired) = async { tokio::join!(self.refresh(), self.expire(now)) }
            .instrument(info_span!("sync_cycle", %run_id))
            .await;

        let mut errors = Vec::new();
        let refresh = refresh
            .map_err(|err| {
                error!(%run_id, error = %err, "refresh failed");
                errors.push(format!("refresh: {err}"));
            })
            .ok();
        let expired = expired
            .map_err(|err| {
                error!(%run_id, error = %err, "expiry failed");
                errors.push(format!("expire: {err}"));
            })
            .ok();

        let report = CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            refresh,
            expired,
            errors,
        };
        *self.last_cycle.write().await = Some(report.clone());
        Some(report)
    }

    /// Replace the whole table with a fresh copy of the feed. The feed is
    /// fetched and normalized before anything is deleted. Waits for any
    /// running cycle. Delete and re-populate are separate statements, so a
    /// concurrent reader can briefly see an empty table.
    pub async fn replace_all(&self) -> Result<RefreshReport, SyncError> {
        let _cycle = self.cycle_guard.lock().await;
        let _state = self.enter(SyncState::Refreshing);
        let records = self.feed.fetch().await?;
        let batch = normalize_batch(&records);

        let deleted = self
            .store
            .delete_where(&self.settings.table, EventPredicate::All)
            .await?;
        let summary = self.store.upsert_many(&self.settings.table, &batch.events).await?;

        info!(deleted, inserted = summary.inserted, skipped = batch.skipped, "table replaced from feed");
        Ok(RefreshReport {
            fetched: records.len(),
            normalized: batch.events.len(),
            skipped: batch.skipped,
            duplicates: batch.duplicates,
            inserted: summary.inserted,
            replaced: summary.replaced,
            errored: summary.errored,
            deleted,
        })
    }

    /// Wait until no cycle is in flight.
    pub async fn wait_for_cycle(&self) {
        let _cycle = self.cycle_guard.lock().await;
    }
}

/// Handle to the recurring sync job.
pub struct SyncScheduler {
    scheduler: JobScheduler,
    syncer: Arc<Syncer>,
}

impl SyncScheduler {
    /// Register and start the recurring cycle. The first cycle fires one
    /// `interval` after start; initial population is done by setup.
    pub async fn start(syncer: Arc<Syncer>, interval: Duration) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job_syncer = syncer.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let syncer = job_syncer.clone();
            Box::pin(async move {
                let _ = syncer.run_cycle(Utc::now()).await;
            })
        })
        .context("creating sync cycle job")?;
        scheduler.add(job).await.context("adding sync cycle job")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(interval_secs = interval.as_secs(), "sync scheduler started");
        Ok(Self { scheduler, syncer })
    }

    /// Stop scheduling new cycles, then drain the one in flight.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        self.syncer.wait_for_cycle().await;
        info!("sync scheduler stopped");
        Ok(())
    }
}
