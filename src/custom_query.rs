//! Custom query builder.
//!
//! Turns user-chosen date range, stations, vehicle type and rider type into
//! a store predicate, then resolves it to a table of trips or a geo sample.
//! The `"All"` sentinel leaves a dimension unconstrained.

use bson::{doc, Bson, Document};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::models::{fields, time_bound, GeoTrip, TripRecord};
use crate::queries::{decode_rows, geo_projection};
use crate::store::{CollectionHandle, FindOptions};

/// Sentinel meaning "no constraint" in choice lists and CLI arguments.
pub const ALL: &str = "All";

/// A categorical choice: everything, or one exact value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    Only(String),
}

impl Selection {
    pub fn parse(value: &str) -> Self {
        if value == ALL {
            Selection::All
        } else {
            Selection::Only(value.to_string())
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Selection::All => None,
            Selection::Only(value) => Some(value),
        }
    }
}

impl From<&str> for Selection {
    fn from(value: &str) -> Self {
        Selection::parse(value)
    }
}

/// Builder inputs. The default constrains nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    /// Earliest start day, from 00:00:00.
    pub start_date: Option<NaiveDate>,
    /// Latest end day, through 23:59:59.999.
    pub end_date: Option<NaiveDate>,
    pub start_station: Selection,
    pub end_station: Selection,
    pub ride_type: Selection,
    pub rider_type: Selection,
}

/// Build the predicate for `params`. With every dimension unconstrained the
/// result is the empty document, which matches everything.
pub fn build_filter(params: &FilterParams) -> Document {
    let mut filter = Document::new();

    if let Some(day) = params.start_date {
        let from = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
        filter.insert(fields::STARTED_AT, time_bound("$gte", &from));
    }
    if let Some(day) = params.end_date {
        let through = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        let until = Utc.from_utc_datetime(&day.and_time(through));
        filter.insert(fields::ENDED_AT, time_bound("$lte", &until));
    }

    let categorical = [
        (fields::START_STATION_NAME, &params.start_station),
        (fields::END_STATION_NAME, &params.end_station),
        (fields::RIDEABLE_TYPE, &params.ride_type),
        (fields::MEMBER_CASUAL, &params.rider_type),
    ];
    for (field, selection) in categorical {
        if let Some(value) = selection.value() {
            filter.insert(field, value);
        }
    }

    filter
}

/// Choice lists for building a filter; each starts with [`ALL`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FilterOptions {
    pub start_stations: Vec<String>,
    pub end_stations: Vec<String>,
    pub ride_types: Vec<String>,
    pub rider_types: Vec<String>,
}

/// Resolves predicates against one collection.
#[derive(Clone)]
pub struct CustomQuery {
    collection: CollectionHandle,
}

impl CustomQuery {
    pub fn new(collection: CollectionHandle) -> Self {
        Self { collection }
    }

    /// Matching trips with every stored field except the store identifier.
    pub async fn run_filtered(&self, predicate: Document) -> Result<Vec<TripRecord>> {
        let rows = self
            .collection
            .find(
                predicate,
                FindOptions {
                    projection: Some(doc! { "_id": 0 }),
                    ..Default::default()
                },
            )
            .await?;
        decode_rows(rows)
    }

    /// Up to `size` matching trips sampled for map rendering. The predicate
    /// is applied before sampling.
    pub async fn run_filtered_sample(&self, predicate: Document, size: i64) -> Result<Vec<GeoTrip>> {
        if size < 1 {
            return Err(Error::Query("sample size must be at least 1".to_string()));
        }
        let rows = self
            .collection
            .aggregate(vec![
                doc! { "$match": predicate },
                doc! { "$sample": { "size": size } },
                geo_projection(),
            ])
            .await?;
        decode_rows(rows)
    }

    pub async fn filter_options(&self) -> Result<FilterOptions> {
        Ok(FilterOptions {
            start_stations: self.choices(fields::START_STATION_NAME).await?,
            end_stations: self.choices(fields::END_STATION_NAME).await?,
            ride_types: self.choices(fields::RIDEABLE_TYPE).await?,
            rider_types: self.choices(fields::MEMBER_CASUAL).await?,
        })
    }

    async fn choices(&self, field: &str) -> Result<Vec<String>> {
        let mut values: Vec<String> = self
            .collection
            .distinct(field, doc! {})
            .await?
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect();
        values.sort();
        values.dedup();
        values.insert(0, ALL.to_string());
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberCasual, RideableType};
    use crate::store::DataStore;
    use chrono::Duration;

    fn trip(day: u32, from: &str, to: &str, bike: RideableType, rider: MemberCasual) -> TripRecord {
        let started_at = Utc.with_ymd_and_hms(2023, 4, day, 23, 50, 0).unwrap();
        TripRecord {
            ride_id: Some(format!("R{}", day)),
            started_at,
            ended_at: started_at + Duration::minutes(5),
            start_station_name: from.to_string(),
            start_station_id: None,
            end_station_name: to.to_string(),
            end_station_id: None,
            start_lat: 40.7,
            start_lng: -74.0,
            end_lat: 40.71,
            end_lng: -74.01,
            rideable_type: bike,
            member_casual: rider,
        }
    }

    async fn seeded() -> CustomQuery {
        let collection = DataStore::in_memory(Some("trips")).get_collection(None).unwrap();
        collection
            .insert_many(
                vec![
                    trip(1, "A", "B", RideableType::Classic, MemberCasual::Member),
                    trip(2, "B", "A", RideableType::Electric, MemberCasual::Casual),
                    trip(3, "A", "C", RideableType::Electric, MemberCasual::Member),
                ]
                .iter()
                .map(|t| t.to_document().unwrap())
                .collect(),
            )
            .await
            .unwrap();
        CustomQuery::new(collection)
    }

    #[test]
    fn all_sentinels_match_everything() {
        assert!(build_filter(&FilterParams::default()).is_empty());
        let params = FilterParams {
            start_station: Selection::parse("All"),
            rider_type: "All".into(),
            ..Default::default()
        };
        assert!(build_filter(&params).is_empty());
    }

    #[test]
    fn dates_become_inclusive_bounds() {
        let params = FilterParams {
            start_date: NaiveDate::from_ymd_opt(2023, 4, 2),
            end_date: NaiveDate::from_ymd_opt(2023, 4, 2),
            ride_type: Selection::Only("electric_bike".to_string()),
            ..Default::default()
        };
        let filter = build_filter(&params);
        let from = Utc.with_ymd_and_hms(2023, 4, 2, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2023, 4, 2, 23, 59, 59).unwrap() + Duration::milliseconds(999);
        assert_eq!(
            filter,
            doc! {
                "started_at": time_bound("$gte", &from),
                "ended_at": time_bound("$lte", &until),
                "rideable_type": "electric_bike",
            }
        );
    }

    #[tokio::test]
    async fn unconstrained_filter_returns_whole_collection() {
        let query = seeded().await;
        let rows = query
            .run_filtered(build_filter(&FilterParams::default()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].ride_id.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn categorical_and_date_constraints_combine() {
        let query = seeded().await;
        let params = FilterParams {
            start_station: Selection::parse("A"),
            rider_type: Selection::parse("member"),
            start_date: NaiveDate::from_ymd_opt(2023, 4, 2),
            ..Default::default()
        };
        let rows = query.run_filtered(build_filter(&params)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].end_station_name, "C");

        // Trip 1 ends at 23:55 on April 1st; the day bound includes it.
        let params = FilterParams {
            end_date: NaiveDate::from_ymd_opt(2023, 4, 1),
            ..Default::default()
        };
        let rows = query.run_filtered(build_filter(&params)).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn sample_applies_predicate_first() {
        let query = seeded().await;
        let params = FilterParams {
            ride_type: Selection::parse("electric_bike"),
            ..Default::default()
        };
        let sample = query
            .run_filtered_sample(build_filter(&params), 1000)
            .await
            .unwrap();
        assert_eq!(sample.len(), 2);
        assert!(sample
            .iter()
            .all(|t| t.rideable_type == Some(RideableType::Electric)));
        assert!(query.run_filtered_sample(doc! {}, 0).await.is_err());
    }

    #[tokio::test]
    async fn options_are_sorted_and_prefixed() {
        let options = seeded().await.filter_options().await.unwrap();
        assert_eq!(options.start_stations, vec!["All", "A", "B"]);
        assert_eq!(options.end_stations, vec!["All", "A", "B", "C"]);
        assert_eq!(options.ride_types, vec!["All", "classic_bike", "electric_bike"]);
        assert_eq!(options.rider_types, vec!["All", "casual", "member"]);
    }
}
