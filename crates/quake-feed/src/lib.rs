//! Earthquake feed client: fetch a GeoJSON feature collection and hand back
//! raw per-feature records for normalization.

pub mod normalize;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub use normalize::{normalize, normalize_batch, NormalizationError, NormalizedBatch};

pub const DEFAULT_FEED_URL: &str =
    "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/4.5_month.geojson";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("feed body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("feed document is not a feature collection: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reading feed file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One feature from the feed, before any validation. Each part is kept as
/// loose JSON so a single malformed feature cannot fail the whole document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub id: Option<JsonValue>,
    pub properties: Option<JsonValue>,
    pub geometry: Option<JsonValue>,
}

impl RawRecord {
    pub fn from_feature(feature: JsonValue) -> Self {
        match feature {
            JsonValue::Object(mut map) => Self {
                id: map.remove("id"),
                properties: map.remove("properties"),
                geometry: map.remove("geometry"),
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<JsonValue>,
}

pub fn parse_feed_document(bytes: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let collection: FeatureCollection = serde_json::from_slice(bytes)?;
    Ok(collection
        .features
        .into_iter()
        .map(RawRecord::from_feature)
        .collect())
}

/// A source of raw feed records. Implementations do not retry.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
    url: String,
    max_body_bytes: usize,
}

impl HttpFeedClient {
    pub fn new(config: FeedClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            url: config.url,
            max_body_bytes: config.max_body_bytes,
        })
    }

    async fn fetch_body(&self) -> Result<Vec<u8>, FetchError> {
        let mut resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let limit = self.max_body_bytes;
        if resp.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::BodyTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl FeedSource for HttpFeedClient {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!("feed_fetch", url = %self.url);
        async {
            let body = self.fetch_body().await?;
            let records = parse_feed_document(&body)?;
            info!(bytes = body.len(), features = records.len(), "feed fetched");
            Ok::<_, FetchError>(records)
        }
        .instrument(span)
        .await
    }
}

/// Reads the feed document from disk; for offline runs against a saved feed.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeed {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_feed_document(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "id": "us7000abcd",
             "properties": {"mag": 5.2, "time": 1700000000000, "place": "off the coast"},
             "geometry": {"type": "Point", "coordinates": [142.1, 38.3, 10.0]}},
            "not-a-feature"
        ]
    }"#;

    /// Serves `body` with `status` at `/feed.geojson` and returns its URL.
    async fn serve_feed(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/feed.geojson",
            get(move || async move { (status, [(header::CONTENT_TYPE, "application/json")], body) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/feed.geojson")
    }

    fn client_for(url: String) -> HttpFeedClient {
        HttpFeedClient::new(FeedClientConfig {
            url,
            timeout: Duration::from_secs(5),
            user_agent: Some("quake-feed-test".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn parses_features_leniently() {
        let records = parse_feed_document(SAMPLE.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(json!("us7000abcd")));
        assert_eq!(records[1], RawRecord::default());
    }

    #[test]
    fn document_without_features_is_a_parse_error() {
        assert!(matches!(
            parse_feed_document(br#"{"type": "FeatureCollection"}"#),
            Err(FetchError::Parse(_))
        ));
        assert!(matches!(parse_feed_document(b"<html>"), Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn http_client_fetches_and_parses() {
        let url = serve_feed(StatusCode::OK, SAMPLE).await;
        let records = client_for(url).fetch().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn http_client_reports_non_success_status() {
        let url = serve_feed(StatusCode::SERVICE_UNAVAILABLE, "{}").await;
        let err = client_for(url).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err}");
    }

    #[tokio::test]
    async fn http_client_enforces_body_limit() {
        let url = serve_feed(StatusCode::OK, SAMPLE).await;
        let client = HttpFeedClient::new(FeedClientConfig {
            url,
            max_body_bytes: 16,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            client.fetch().await,
            Err(FetchError::BodyTooLarge { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn file_feed_reads_document_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.geojson");
        std::fs::write(&path, SAMPLE).unwrap();

        let feed = FileFeed::new(&path);
        assert!(feed.describe().starts_with("file://"));
        assert_eq!(feed.fetch().await.unwrap().len(), 2);

        let missing = FileFeed::new(dir.path().join("missing.geojson"));
        assert!(matches!(missing.fetch().await, Err(FetchError::Io { .. })));
    }
}
