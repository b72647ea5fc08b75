//! Core domain model for the earthquake feed: points, events and distance units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Mean earth radius (IUGG) used for great-circle distances.
pub const EARTH_MEAN_RADIUS_METERS: f64 = 6_371_008.8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("coordinate is not a finite number")]
    NotFinite,
    #[error("expected [longitude, latitude, ..], got {0} value(s)")]
    TooFewValues(usize),
}

/// Geographic point in WGS84 degrees.
///
/// The canonical order everywhere in the workspace is latitude first. Feed
/// geometry arrives as `[longitude, latitude]` and is mapped exactly once, in
/// [`Point::from_lon_lat`]. Fields are private so a `Point` is always in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PointRepr")]
pub struct Point {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct PointRepr {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<PointRepr> for Point {
    type Error = CoordinateError;

    fn try_from(repr: PointRepr) -> Result<Self, Self::Error> {
        Point::new(repr.latitude, repr.longitude)
    }
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(CoordinateError::NotFinite);
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Build a point from a GeoJSON position: `[longitude, latitude, ..]`.
    /// Values past the second (depth, etc.) are ignored here.
    pub fn from_lon_lat(position: &[f64]) -> Result<Self, CoordinateError> {
        match position {
            [longitude, latitude, ..] => Self::new(*latitude, *longitude),
            _ => Err(CoordinateError::TooFewValues(position.len())),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle (haversine) distance in meters on a spherical earth.
    pub fn haversine_meters(&self, other: &Point) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
        EARTH_MEAN_RADIUS_METERS * c
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DistanceUnit {
    #[serde(rename = "m")]
    Meters,
    #[serde(rename = "km")]
    Kilometers,
    #[default]
    #[serde(rename = "mi")]
    Miles,
    #[serde(rename = "nm")]
    NauticalMiles,
    #[serde(rename = "ft")]
    Feet,
}

impl DistanceUnit {
    pub fn meters_per_unit(self) -> f64 {
        match self {
            DistanceUnit::Meters => 1.0,
            DistanceUnit::Kilometers => 1_000.0,
            DistanceUnit::Miles => 1_609.344,
            DistanceUnit::NauticalMiles => 1_852.0,
            DistanceUnit::Feet => 0.3048,
        }
    }

    pub fn from_meters(self, meters: f64) -> f64 {
        meters / self.meters_per_unit()
    }

    pub fn to_meters(self, value: f64) -> f64 {
        value * self.meters_per_unit()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceUnit::Meters => "m",
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
            DistanceUnit::NauticalMiles => "nm",
            DistanceUnit::Feet => "ft",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown distance unit {0:?} (expected m, km, mi, nm or ft)")]
pub struct UnknownUnit(pub String);

impl FromStr for DistanceUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" => Ok(DistanceUnit::Meters),
            "km" => Ok(DistanceUnit::Kilometers),
            "mi" => Ok(DistanceUnit::Miles),
            "nm" => Ok(DistanceUnit::NauticalMiles),
            "ft" => Ok(DistanceUnit::Feet),
            other => Err(UnknownUnit(other.to_string())),
        }
    }
}

impl fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted earthquake event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub magnitude: f64,
    pub occurred_at_epoch_millis: i64,
    pub depth_km: Option<f64>,
    pub location: Point,
    /// Full feed `properties` object, kept verbatim.
    pub properties: Map<String, JsonValue>,
}

impl Event {
    pub fn occurred_before(&self, cutoff_epoch_millis: i64) -> bool {
        self.occurred_at_epoch_millis < cutoff_epoch_millis
    }
}

/// Bounds for a nearest-point query. `max_distance` is expressed in `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NearestOptions {
    pub max_results: usize,
    pub max_distance: Option<f64>,
    pub unit: DistanceUnit,
}

impl NearestOptions {
    pub const DEFAULT_MAX_RESULTS: usize = 100;

    pub fn max_distance_meters(&self) -> Option<f64> {
        self.max_distance.map(|d| self.unit.to_meters(d))
    }
}

impl Default for NearestOptions {
    fn default() -> Self {
        Self {
            max_results: Self::DEFAULT_MAX_RESULTS,
            max_distance: None,
            unit: DistanceUnit::Miles,
        }
    }
}

/// One nearest-query hit; `distance` is in `unit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestMatch {
    pub distance: f64,
    pub unit: DistanceUnit,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_position_maps_longitude_first_to_latitude_first() {
        let point = Point::from_lon_lat(&[-122.5, 37.75, 8.0]).unwrap();
        assert_eq!(point.latitude(), 37.75);
        assert_eq!(point.longitude(), -122.5);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert_eq!(
            Point::new(91.0, 0.0),
            Err(CoordinateError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            Point::new(0.0, -180.5),
            Err(CoordinateError::LongitudeOutOfRange(-180.5))
        );
        assert_eq!(Point::new(f64::NAN, 0.0), Err(CoordinateError::NotFinite));
        // latitude 120 is only reachable if the feed order were swapped
        assert!(Point::from_lon_lat(&[45.0, 120.0]).is_err());
        assert_eq!(
            Point::from_lon_lat(&[1.0]),
            Err(CoordinateError::TooFewValues(1))
        );
    }

    #[test]
    fn boundary_coordinates_are_valid() {
        assert!(Point::new(90.0, 180.0).is_ok());
        assert!(Point::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn haversine_one_degree_of_latitude() {
        let a = Point::new(0.0, 0.0).unwrap();
        let b = Point::new(1.0, 0.0).unwrap();
        let km = DistanceUnit::Kilometers.from_meters(a.haversine_meters(&b));
        assert!((km - 111.19).abs() < 0.05, "got {km}");
        assert_eq!(a.haversine_meters(&a), 0.0);
    }

    #[test]
    fn unit_parsing_and_conversion() {
        assert_eq!("MI".parse::<DistanceUnit>().unwrap(), DistanceUnit::Miles);
        assert_eq!("nm".parse::<DistanceUnit>().unwrap(), DistanceUnit::NauticalMiles);
        assert!("parsecs".parse::<DistanceUnit>().is_err());
        assert!((DistanceUnit::Miles.to_meters(1.0) - 1_609.344).abs() < 1e-9);

        let opts = NearestOptions {
            max_results: 5,
            max_distance: Some(2.0),
            unit: DistanceUnit::Kilometers,
        };
        assert_eq!(opts.max_distance_meters(), Some(2_000.0));
        assert_eq!(NearestOptions::default().max_distance_meters(), None);
    }

    #[test]
    fn point_deserialization_validates_range() {
        let ok: Point = serde_json::from_str(r#"{"latitude": 10.0, "longitude": 20.0}"#).unwrap();
        assert_eq!(ok.latitude(), 10.0);
        assert!(serde_json::from_str::<Point>(r#"{"latitude": 100.0, "longitude": 20.0}"#).is_err());
    }
}
