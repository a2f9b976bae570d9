//! Core data models used throughout the harness.
//!
//! [`TripRecord`] is the unit of storage. The remaining types are the row
//! shapes returned by the query catalogue; their field names are the contract
//! consumed by the presentation layer.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Persisted field names.
pub mod fields {
    pub const RIDE_ID: &str = "ride_id";
    pub const STARTED_AT: &str = "started_at";
    pub const ENDED_AT: &str = "ended_at";
    pub const START_STATION_NAME: &str = "start_station_name";
    pub const START_STATION_ID: &str = "start_station_id";
    pub const END_STATION_NAME: &str = "end_station_name";
    pub const END_STATION_ID: &str = "end_station_id";
    pub const START_LAT: &str = "start_lat";
    pub const START_LNG: &str = "start_lng";
    pub const END_LAT: &str = "end_lat";
    pub const END_LNG: &str = "end_lng";
    pub const RIDEABLE_TYPE: &str = "rideable_type";
    pub const MEMBER_CASUAL: &str = "member_casual";

    /// The ten fields every stored trip carries.
    pub const REQUIRED: [&str; 10] = [
        STARTED_AT,
        ENDED_AT,
        START_STATION_NAME,
        END_STATION_NAME,
        START_LAT,
        START_LNG,
        END_LAT,
        END_LNG,
        RIDEABLE_TYPE,
        MEMBER_CASUAL,
    ];
}

/// Vehicle category used for a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RideableType {
    #[serde(rename = "classic_bike")]
    Classic,
    #[serde(rename = "electric_bike")]
    Electric,
    #[serde(rename = "docked_bike")]
    Docked,
}

impl RideableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideableType::Classic => "classic_bike",
            RideableType::Electric => "electric_bike",
            RideableType::Docked => "docked_bike",
        }
    }
}

impl FromStr for RideableType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "classic_bike" => Ok(RideableType::Classic),
            "electric_bike" => Ok(RideableType::Electric),
            "docked_bike" => Ok(RideableType::Docked),
            other => Err(Error::Transform(format!("unknown rideable_type '{}'", other))),
        }
    }
}

impl fmt::Display for RideableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rider category: subscribed member or pay-per-ride casual rider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberCasual {
    Member,
    Casual,
}

impl MemberCasual {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberCasual::Member => "member",
            MemberCasual::Casual => "casual",
        }
    }
}

impl FromStr for MemberCasual {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "member" => Ok(MemberCasual::Member),
            "casual" => Ok(MemberCasual::Casual),
            other => Err(Error::Transform(format!("unknown member_casual '{}'", other))),
        }
    }
}

impl fmt::Display for MemberCasual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bike-share ride as persisted in the trip collection.
///
/// Timestamps are stored as native store dates so that date operators such as
/// `$month` and `$hour` apply to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub ended_at: DateTime<Utc>,
    pub start_station_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_station_id: Option<String>,
    pub end_station_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_station_id: Option<String>,
    pub start_lat: f64,
    pub start_lng: f64,
    pub end_lat: f64,
    pub end_lng: f64,
    pub rideable_type: RideableType,
    pub member_casual: MemberCasual,
}

impl TripRecord {
    /// Trip duration in milliseconds (end minus start).
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(|e| Error::Transform(format!("cannot encode trip: {}", e)))
    }
}

/// A geo-tagged trip projection. Which fields are populated depends on the
/// query that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoTrip {
    #[serde(default, with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_station_name: Option<String>,
    #[serde(default)]
    pub end_station_name: Option<String>,
    #[serde(default)]
    pub start_lat: Option<f64>,
    #[serde(default)]
    pub start_lng: Option<f64>,
    #[serde(default)]
    pub end_lat: Option<f64>,
    #[serde(default)]
    pub end_lng: Option<f64>,
    #[serde(default)]
    pub rideable_type: Option<RideableType>,
    #[serde(default)]
    pub member_casual: Option<MemberCasual>,
}

impl GeoTrip {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Paginated listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripListing {
    pub start_station_name: Option<String>,
    pub end_station_name: Option<String>,
    pub rideable_type: Option<String>,
    pub member_casual: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BikeTypeCount {
    pub bike_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageDuration {
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BikeTypeDuration {
    pub bike_type: String,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderTypeDuration {
    pub member_type: String,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderTypeCount {
    pub usertype: String,
    pub count: i64,
}

/// Member trip row: rider type and vehicle type only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberTrip {
    pub member_casual: String,
    pub rideable_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationCount {
    pub station: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTrips {
    pub month: i32,
    pub total_trips: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularStations {
    pub popular_start_stations: Vec<StationCount>,
    pub popular_end_stations: Vec<StationCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourCount {
    pub hour: i32,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourDayCount {
    pub hour: i32,
    /// Day of week, 1 = Sunday through 7 = Saturday.
    pub day: i32,
    pub count: i64,
}

/// Inclusive time range on one field, e.g. `{started_at: {$gte: from}}`.
pub fn time_bound(op: &str, value: &DateTime<Utc>) -> Document {
    doc! { op: bson::DateTime::from_chrono(*value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;
    use chrono::TimeZone;

    fn sample() -> TripRecord {
        TripRecord {
            ride_id: Some("ABC123".to_string()),
            started_at: Utc.with_ymd_and_hms(2023, 1, 5, 8, 0, 0).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2023, 1, 5, 8, 12, 30).unwrap(),
            start_station_name: "W 21 St & 6 Ave".to_string(),
            start_station_id: None,
            end_station_name: "Broadway & E 14 St".to_string(),
            end_station_id: Some("5905.06".to_string()),
            start_lat: 40.7417,
            start_lng: -73.9942,
            end_lat: 40.7345,
            end_lng: -73.9907,
            rideable_type: RideableType::Classic,
            member_casual: MemberCasual::Member,
        }
    }

    #[test]
    fn document_uses_contract_field_names() {
        let document = sample().to_document().unwrap();
        for field in fields::REQUIRED {
            assert!(document.contains_key(field), "missing {}", field);
        }
        assert!(!document.contains_key(fields::START_STATION_ID));
        assert!(matches!(
            document.get(fields::STARTED_AT),
            Some(Bson::DateTime(_))
        ));
        assert_eq!(
            document.get_str(fields::RIDEABLE_TYPE).unwrap(),
            "classic_bike"
        );
    }

    #[test]
    fn stored_document_decodes_back_into_record() {
        let trip = sample();
        let mut document = trip.to_document().unwrap();
        document.insert("_id", bson::oid::ObjectId::new());
        let decoded: TripRecord = bson::from_document(document).unwrap();
        assert_eq!(decoded, trip);
        assert_eq!(decoded.duration_ms(), 750_000);
    }

    #[test]
    fn decoding_reports_missing_field() {
        let mut document = sample().to_document().unwrap();
        document.remove(fields::END_LAT);
        let err = bson::from_document::<TripRecord>(document).unwrap_err();
        assert!(err.to_string().contains("end_lat"));
    }

    #[test]
    fn geo_trip_tolerates_partial_projection() {
        let document = doc! {
            "start_lat": 40.0,
            "start_lng": -73,
            "member_casual": "casual",
        };
        let geo: GeoTrip = bson::from_document(document).unwrap();
        assert_eq!(geo.start_lat, Some(40.0));
        assert_eq!(geo.start_lng, Some(-73.0));
        assert_eq!(geo.member_casual, Some(MemberCasual::Casual));
        assert!(geo.started_at.is_none());
        assert!(geo.duration_ms().is_none());
    }

    #[test]
    fn enums_parse_raw_values() {
        assert_eq!(
            "electric_bike".parse::<RideableType>().unwrap(),
            RideableType::Electric
        );
        assert!("scooter".parse::<RideableType>().is_err());
        assert_eq!(" member ".parse::<MemberCasual>().unwrap(), MemberCasual::Member);
        assert_eq!(
            serde_json::to_string(&RideableType::Docked).unwrap(),
            "\"docked_bike\""
        );
    }
}
