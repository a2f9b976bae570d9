//! Distance and speed post-processing over projected trips.
//!
//! Pure numeric work on rows from [`crate::queries::TripQueries::raw_projection`]
//! or a sample; nothing here touches the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::GeoTrip;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Average speed for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedRow {
    pub key: String,
    pub avg_speed_kmh: f64,
}

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(start_lat: f64, start_lng: f64, end_lat: f64, end_lng: f64) -> f64 {
    let (lat1, lat2) = (start_lat.to_radians(), end_lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (end_lng - start_lng).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Speed of one trip in km/h, if it has coordinates and a positive duration.
pub fn trip_speed_kmh(trip: &GeoTrip) -> Option<f64> {
    let duration_ms = trip.duration_ms().filter(|ms| *ms > 0)?;
    let km = haversine_km(trip.start_lat?, trip.start_lng?, trip.end_lat?, trip.end_lng?);
    Some(km / (duration_ms as f64 / 3_600_000.0))
}

pub fn average_speed_by_rider_type(trips: &[GeoTrip]) -> Vec<SpeedRow> {
    average_speed_by(trips, |t| t.member_casual.map(|m| m.as_str()))
}

pub fn average_speed_by_bike_type(trips: &[GeoTrip]) -> Vec<SpeedRow> {
    average_speed_by(trips, |t| t.rideable_type.map(|r| r.as_str()))
}

fn average_speed_by<F>(trips: &[GeoTrip], key: F) -> Vec<SpeedRow>
where
    F: Fn(&GeoTrip) -> Option<&'static str>,
{
    let mut groups: BTreeMap<&'static str, (f64, u32)> = BTreeMap::new();
    for trip in trips {
        let (Some(key), Some(speed)) = (key(trip), trip_speed_kmh(trip)) else {
            continue;
        };
        let entry = groups.entry(key).or_insert((0.0, 0));
        entry.0 += speed;
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|(key, (total, n))| SpeedRow {
            key: key.to_string(),
            avg_speed_kmh: round2(total / f64::from(n)),
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberCasual, RideableType};
    use chrono::{Duration, TimeZone, Utc};

    fn geo(minutes: i64, end_lat: f64, rider: MemberCasual, bike: RideableType) -> GeoTrip {
        let start = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        GeoTrip {
            started_at: Some(start),
            ended_at: Some(start + Duration::minutes(minutes)),
            start_lat: Some(0.0),
            start_lng: Some(0.0),
            end_lat: Some(end_lat),
            end_lng: Some(0.0),
            rideable_type: Some(bike),
            member_casual: Some(rider),
            ..Default::default()
        }
    }

    #[test]
    fn one_degree_of_latitude() {
        let km = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!((km - 111.19).abs() < 0.01, "{}", km);
        assert_eq!(haversine_km(40.7, -74.0, 40.7, -74.0), 0.0);
    }

    #[test]
    fn groups_average_and_round() {
        let trips = vec![
            // 111.19 km in one hour and in two hours.
            geo(60, 1.0, MemberCasual::Member, RideableType::Classic),
            geo(120, 1.0, MemberCasual::Member, RideableType::Electric),
            geo(60, 0.5, MemberCasual::Casual, RideableType::Classic),
        ];

        let by_rider = average_speed_by_rider_type(&trips);
        assert_eq!(by_rider.len(), 2);
        assert_eq!(by_rider[0].key, "casual");
        assert_eq!(by_rider[1].key, "member");
        assert!((by_rider[1].avg_speed_kmh - 83.39).abs() < 0.011);
        assert_eq!(by_rider[1].avg_speed_kmh, round2(by_rider[1].avg_speed_kmh));

        let by_bike = average_speed_by_bike_type(&trips);
        assert_eq!(
            by_bike.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["classic_bike", "electric_bike"]
        );
    }

    #[test]
    fn unusable_trips_are_skipped() {
        let mut no_coords = geo(10, 1.0, MemberCasual::Member, RideableType::Classic);
        no_coords.end_lat = None;
        let zero_duration = geo(0, 1.0, MemberCasual::Member, RideableType::Classic);
        let backwards = geo(-5, 1.0, MemberCasual::Member, RideableType::Classic);

        assert!(trip_speed_kmh(&no_coords).is_none());
        assert!(trip_speed_kmh(&zero_duration).is_none());
        assert!(average_speed_by_rider_type(&[no_coords, zero_duration, backwards]).is_empty());
    }
}
