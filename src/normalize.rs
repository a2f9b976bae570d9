//! Tabular trip rows → validated [`TripRecord`]s.
//!
//! Rows that fail timestamp parsing, miss a required field, or carry an
//! unknown vehicle or rider category are dropped and counted, never raised.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{fields, TripRecord};

/// Naive timestamp layouts seen across the published exports. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Result of reading one tabular file.
#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<TripRecord>,
    pub dropped: usize,
}

/// One raw row. Every column is optional so that missing values surface as
/// drops rather than reader failures.
#[derive(Debug, Deserialize)]
struct RawTripRow {
    #[serde(default)]
    ride_id: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    ended_at: Option<String>,
    #[serde(default)]
    start_station_name: Option<String>,
    #[serde(default)]
    start_station_id: Option<String>,
    #[serde(default)]
    end_station_name: Option<String>,
    #[serde(default)]
    end_station_id: Option<String>,
    #[serde(default)]
    start_lat: Option<String>,
    #[serde(default)]
    start_lng: Option<String>,
    #[serde(default)]
    end_lat: Option<String>,
    #[serde(default)]
    end_lng: Option<String>,
    #[serde(default)]
    rideable_type: Option<String>,
    #[serde(default)]
    member_casual: Option<String>,
}

impl RawTripRow {
    fn into_record(self) -> Result<TripRecord> {
        Ok(TripRecord {
            started_at: parse_timestamp(required(self.started_at, fields::STARTED_AT)?)?,
            ended_at: parse_timestamp(required(self.ended_at, fields::ENDED_AT)?)?,
            start_station_name: required(self.start_station_name, fields::START_STATION_NAME)?,
            end_station_name: required(self.end_station_name, fields::END_STATION_NAME)?,
            start_lat: parse_coordinate(required(self.start_lat, fields::START_LAT)?)?,
            start_lng: parse_coordinate(required(self.start_lng, fields::START_LNG)?)?,
            end_lat: parse_coordinate(required(self.end_lat, fields::END_LAT)?)?,
            end_lng: parse_coordinate(required(self.end_lng, fields::END_LNG)?)?,
            rideable_type: required(self.rideable_type, fields::RIDEABLE_TYPE)?.parse()?,
            member_casual: required(self.member_casual, fields::MEMBER_CASUAL)?.parse()?,
            ride_id: non_blank(self.ride_id),
            start_station_id: non_blank(self.start_station_id),
            end_station_id: non_blank(self.end_station_id),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    non_blank(value).ok_or_else(|| Error::Transform(format!("missing required field '{}'", field)))
}

fn parse_coordinate(value: String) -> Result<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Transform(format!("invalid coordinate '{}'", value)))
}

/// Parse a trip timestamp. Offsets are honoured; naive values are UTC.
pub fn parse_timestamp(value: String) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::Transform(format!("unparseable timestamp '{}'", value)))
}

/// Read every row of the CSV file at `path`.
///
/// A missing file or unreadable header is an [`Error::TransientIo`]; bad rows
/// only increase [`Normalized::dropped`].
pub fn read_trips(path: &Path) -> Result<Normalized> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .map_err(|e| Error::TransientIo(format!("cannot read {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| Error::TransientIo(format!("unreadable header in {}: {}", path.display(), e)))?
        .clone();
    let absent: Vec<&str> = fields::REQUIRED
        .iter()
        .copied()
        .filter(|field| !headers.iter().any(|h| h == *field))
        .collect();
    if !absent.is_empty() {
        tracing::warn!(
            file = %path.display(),
            missing = ?absent,
            "table lacks required columns; every row will be dropped"
        );
    }

    let mut normalized = Normalized::default();
    for row in reader.deserialize::<RawTripRow>() {
        let record = row
            .map_err(|e| Error::Transform(e.to_string()))
            .and_then(RawTripRow::into_record);
        match record {
            Ok(record) => normalized.records.push(record),
            Err(e) => {
                tracing::trace!(error = %e, "row dropped");
                normalized.dropped += 1;
            }
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberCasual, RideableType};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const HEADER: &str = "ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual";

    fn write_table(dir: &TempDir, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("trips.csv");
        let mut body = String::from(HEADER);
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        body.push('\n');
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn bad_start_timestamp_drops_only_that_row() {
        let tmp = TempDir::new().unwrap();
        let path = write_table(
            &tmp,
            &[
                "A1,classic_bike,not-a-time,2023-01-01 10:10:00,Pier 40,P40,Pier 40,P40,40.72,-74.01,40.72,-74.01,member",
                "A2,electric_bike,2023-01-01 10:00:00.123,2023-01-01 10:10:00,W 21 St,,E 14 St,,40.74,-73.99,40.73,-73.99,casual",
            ],
        );

        let normalized = read_trips(&path).unwrap();
        assert_eq!(normalized.dropped, 1);
        assert_eq!(normalized.records.len(), 1);

        let kept = &normalized.records[0];
        assert_eq!(kept.ride_id.as_deref(), Some("A2"));
        assert_eq!(kept.rideable_type, RideableType::Electric);
        assert_eq!(kept.member_casual, MemberCasual::Casual);
        assert!(kept.start_station_id.is_none());
        assert_eq!(kept.duration_ms(), 599_877);
    }

    #[test]
    fn missing_required_values_and_unknown_categories_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = write_table(
            &tmp,
            &[
                "B1,classic_bike,2023-01-01 10:00:00,,A,,B,,40.7,-74.0,40.7,-74.0,member",
                "B2,scooter,2023-01-01 10:00:00,2023-01-01 10:05:00,A,,B,,40.7,-74.0,40.7,-74.0,member",
                "B3,classic_bike,2023-01-01 10:00:00,2023-01-01 10:05:00,A,,B,,north,-74.0,40.7,-74.0,member",
                "B4,classic_bike,2023-01-01 10:00:00",
                "B5,docked_bike,2023-01-01 10:00:00,2023-01-01 10:05:00,A,,B,,40.7,-74.0,40.7,-74.0,member",
            ],
        );

        let normalized = read_trips(&path).unwrap();
        assert_eq!(normalized.dropped, 4);
        assert_eq!(normalized.records.len(), 1);
        assert_eq!(normalized.records[0].rideable_type, RideableType::Docked);
    }

    #[test]
    fn timestamp_layouts() {
        let expected = Utc.with_ymd_and_hms(2023, 3, 7, 9, 5, 0).unwrap();
        for raw in [
            "2023-03-07 09:05:00",
            "2023-03-07T09:05:00",
            "2023-03-07T10:05:00+01:00",
            "3/7/2023 9:05",
            "03/07/2023 09:05:00",
        ] {
            assert_eq!(parse_timestamp(raw.to_string()).unwrap(), expected, "{}", raw);
        }
        assert!(matches!(
            parse_timestamp("yesterday".to_string()),
            Err(Error::Transform(_))
        ));
    }

    #[test]
    fn missing_file_is_transient() {
        let tmp = TempDir::new().unwrap();
        let err = read_trips(&tmp.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, Error::TransientIo(_)));
    }

    #[test]
    fn table_without_required_columns_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("legacy.csv");
        std::fs::write(&path, "tripduration,starttime\n600,2013-07-01 00:00:00\n").unwrap();
        let normalized = read_trips(&path).unwrap();
        assert!(normalized.records.is_empty());
        assert_eq!(normalized.dropped, 1);
    }
}
