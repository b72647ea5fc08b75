//! Raw feed record -> canonical [`Event`].

use std::collections::HashMap;

use quake_core::{CoordinateError, Event, Point};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

use crate::RawRecord;

pub const MAGNITUDE_PROPERTY: &str = "mag";
pub const TIME_PROPERTY: &str = "time";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("record has no usable id")]
    MissingId,
    #[error("record {id}: missing geometry coordinates")]
    MissingCoordinates { id: String },
    #[error("record {id}: geometry coordinates are not numeric")]
    NonNumericCoordinates { id: String },
    #[error("record {id}: {source}")]
    InvalidCoordinates {
        id: String,
        #[source]
        source: CoordinateError,
    },
    #[error("record {id}: missing or non-numeric property {field:?}")]
    MissingProperty { id: String, field: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub events: Vec<Event>,
    pub skipped: usize,
    /// Records whose id appeared earlier in the same batch; the later one wins.
    pub duplicates: usize,
    pub rejections: Vec<NormalizationError>,
}

fn record_id(raw: &RawRecord) -> Result<String, NormalizationError> {
    match &raw.id {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(NormalizationError::MissingId),
    }
}

fn coordinates(raw: &RawRecord, id: &str) -> Result<(Point, Option<f64>), NormalizationError> {
    let values = raw
        .geometry
        .as_ref()
        .and_then(|g| g.get("coordinates"))
        .and_then(JsonValue::as_array)
        .filter(|values| !values.is_empty())
        .ok_or_else(|| NormalizationError::MissingCoordinates { id: id.to_string() })?;

    let mut position = Vec::with_capacity(2);
    for value in values.iter().take(2) {
        let number = value
            .as_f64()
            .ok_or_else(|| NormalizationError::NonNumericCoordinates { id: id.to_string() })?;
        position.push(number);
    }

    let point = Point::from_lon_lat(&position).map_err(|source| {
        NormalizationError::InvalidCoordinates {
            id: id.to_string(),
            source,
        }
    })?;
    let depth_km = values.get(2).and_then(JsonValue::as_f64);
    Ok((point, depth_km))
}

/// Convert one raw feed record into an [`Event`].
///
/// Required: `id`, `geometry.coordinates` as `[longitude, latitude, depth?]`,
/// numeric `properties.mag` and integer `properties.time` (epoch millis).
pub fn normalize(raw: &RawRecord) -> Result<Event, NormalizationError> {
    let id = record_id(raw)?;
    let (location, depth_km) = coordinates(raw, &id)?;

    let properties = match &raw.properties {
        Some(JsonValue::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let magnitude = properties
        .get(MAGNITUDE_PROPERTY)
        .and_then(JsonValue::as_f64)
        .filter(|m| m.is_finite())
        .ok_or_else(|| NormalizationError::MissingProperty {
            id: id.clone(),
            field: MAGNITUDE_PROPERTY,
        })?;
    let occurred_at_epoch_millis = properties
        .get(TIME_PROPERTY)
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| NormalizationError::MissingProperty {
            id: id.clone(),
            field: TIME_PROPERTY,
        })?;

    Ok(Event {
        id,
        magnitude,
        occurred_at_epoch_millis,
        depth_km,
        location,
        properties,
    })
}

/// Normalize a whole feed; bad records are skipped and counted, never fatal.
pub fn normalize_batch(records: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());

    for raw in records {
        match normalize(raw) {
            Ok(event) => {
                if let Some(&idx) = positions.get(&event.id) {
                    batch.duplicates += 1;
                    batch.events[idx] = event;
                } else {
                    positions.insert(event.id.clone(), batch.events.len());
                    batch.events.push(event);
                }
            }
            Err(err) => {
                warn!(error = %err, "skipping feed record");
                batch.skipped += 1;
                batch.rejections.push(err);
            }
        }
    }
    batch
}
