//! Query catalogue over the trip collection.
//!
//! Every entry is a read-only aggregation returning a fixed row shape from
//! [`crate::models`]. Entries never recover locally: store errors propagate
//! to the caller. Grouped entries return an empty `Vec` on an empty
//! collection.
//!
//! Ranking entries sort by count descending and break ties on the grouped key
//! ascending, so results are deterministic across backends.

use std::collections::BTreeSet;

use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::models::{
    fields, AverageDuration, BikeTypeCount, BikeTypeDuration, GeoTrip, HourCount, HourDayCount,
    MemberTrip, MonthlyTrips, PopularStations, RiderTypeCount, RiderTypeDuration, StationCount,
    TripListing, TripRecord,
};
use crate::store::{CollectionHandle, FindOptions};

/// Default number of rows per facet in [`TripQueries::most_popular_stations`].
pub const DEFAULT_POPULAR_LIMIT: i64 = 10;
/// Default size of [`TripQueries::random_sample`].
pub const DEFAULT_SAMPLE_SIZE: i64 = 1000;

/// The query catalogue, bound to one collection.
#[derive(Clone)]
pub struct TripQueries {
    collection: CollectionHandle,
}

impl TripQueries {
    pub fn new(collection: CollectionHandle) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    pub async fn total_document_count(&self) -> Result<u64> {
        self.collection.count_documents(doc! {}).await
    }

    /// Records `[(page_num - 1) * page_size, page_num * page_size)` in
    /// store-native order.
    pub async fn paginated_listing(&self, page_num: u64, page_size: u64) -> Result<Vec<TripListing>> {
        if page_num < 1 {
            return Err(Error::Query("page_num must be at least 1".to_string()));
        }
        if page_size == 0 {
            return Err(Error::Query("page_size must be positive".to_string()));
        }
        let limit = i64::try_from(page_size)
            .map_err(|_| Error::Query(format!("page_size too large: {}", page_size)))?;
        let skip = (page_num - 1)
            .checked_mul(page_size)
            .ok_or_else(|| Error::Query("page offset overflows".to_string()))?;

        let rows = self
            .collection
            .find(
                doc! {},
                FindOptions {
                    projection: Some(doc! {
                        "_id": 0,
                        "start_station_name": 1,
                        "end_station_name": 1,
                        "rideable_type": 1,
                        "member_casual": 1,
                    }),
                    skip: Some(skip),
                    limit: Some(limit),
                },
            )
            .await?;
        decode_rows(rows)
    }

    pub async fn distinct_start_stations(&self) -> Result<BTreeSet<String>> {
        let values = self
            .collection
            .distinct(fields::START_STATION_NAME, doc! {})
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// One row per vehicle type.
    pub async fn bike_type_counts(&self) -> Result<Vec<BikeTypeCount>> {
        self.aggregate(vec![
            doc! { "$match": { "rideable_type": { "$type": "string" } } },
            doc! { "$group": { "_id": "$rideable_type", "count": { "$sum": 1 } } },
            doc! { "$sort": { "count": -1, "_id": 1 } },
            doc! { "$project": { "_id": 0, "bike_type": "$_id", "count": 1 } },
        ])
        .await
    }

    /// Mean of `ended_at - started_at` in milliseconds; `None` when there is
    /// nothing to average.
    pub async fn average_trip_duration(&self) -> Result<Option<AverageDuration>> {
        let mut rows: Vec<AverageDuration> = self
            .aggregate(vec![
                timed_trips(),
                doc! { "$group": { "_id": null, "avg_duration_ms": duration_avg() } },
                doc! { "$project": { "_id": 0, "avg_duration_ms": 1 } },
            ])
            .await?;
        Ok(rows.pop())
    }

    pub async fn average_trip_duration_by_bike_type(&self) -> Result<Vec<BikeTypeDuration>> {
        self.aggregate(vec![
            timed_trips(),
            doc! { "$group": { "_id": "$rideable_type", "avg_duration_ms": duration_avg() } },
            doc! { "$match": { "_id": { "$type": "string" } } },
            doc! { "$sort": { "_id": 1 } },
            doc! { "$project": { "_id": 0, "bike_type": "$_id", "avg_duration_ms": 1 } },
        ])
        .await
    }

    pub async fn average_trip_duration_by_rider_type(&self) -> Result<Vec<RiderTypeDuration>> {
        self.aggregate(vec![
            timed_trips(),
            doc! { "$group": { "_id": "$member_casual", "average_duration_ms": duration_avg() } },
            doc! { "$match": { "_id": { "$type": "string" } } },
            doc! { "$sort": { "_id": 1 } },
            doc! { "$project": { "_id": 0, "member_type": "$_id", "average_duration_ms": 1 } },
        ])
        .await
    }

    pub async fn rider_type_counts(&self) -> Result<Vec<RiderTypeCount>> {
        self.aggregate(vec![
            doc! { "$match": { "member_casual": { "$type": "string" } } },
            doc! { "$group": { "_id": "$member_casual", "count": { "$sum": 1 } } },
            doc! { "$sort": { "count": -1, "_id": 1 } },
            doc! { "$project": { "_id": 0, "usertype": "$_id", "count": 1 } },
        ])
        .await
    }

    /// Rider and vehicle type of every member trip, in store-native order.
    pub async fn member_trips(&self) -> Result<Vec<MemberTrip>> {
        let rows = self
            .collection
            .find(
                doc! { "member_casual": "member" },
                FindOptions {
                    projection: Some(doc! {
                        "_id": 0,
                        "member_casual": 1,
                        "rideable_type": 1,
                    }),
                    ..Default::default()
                },
            )
            .await?;
        decode_rows(rows)
    }

    pub async fn trips_grouped_by_start_station(&self) -> Result<Vec<StationCount>> {
        self.aggregate(station_counts(fields::START_STATION_NAME, None))
            .await
    }

    /// Full trips whose start and end station names are equal
    /// (case-sensitive). Trips missing either name never match.
    pub async fn trips_with_identical_start_end_station(&self) -> Result<Vec<TripRecord>> {
        let rows = self
            .collection
            .find(
                doc! {
                    "start_station_name": { "$type": "string" },
                    "end_station_name": { "$type": "string" },
                    "$expr": { "$eq": ["$start_station_name", "$end_station_name"] },
                },
                FindOptions {
                    projection: Some(doc! { "_id": 0 }),
                    ..Default::default()
                },
            )
            .await?;
        decode_rows(rows)
    }

    /// Trip counts per calendar month of `started_at`, ascending by month.
    pub async fn trips_per_month(&self) -> Result<Vec<MonthlyTrips>> {
        self.aggregate(vec![
            started_trips(),
            doc! { "$group": { "_id": { "$month": "$started_at" }, "total_trips": { "$sum": 1 } } },
            doc! { "$sort": { "_id": 1 } },
            doc! { "$project": { "_id": 0, "month": "$_id", "total_trips": 1 } },
        ])
        .await
    }

    /// Top `limit` start and end stations by trip count.
    pub async fn most_popular_stations(&self, limit: i64) -> Result<PopularStations> {
        if limit < 1 {
            return Err(Error::Query("limit must be at least 1".to_string()));
        }
        let mut rows: Vec<PopularStations> = self
            .aggregate(vec![doc! { "$facet": {
                "popular_start_stations": station_counts(fields::START_STATION_NAME, Some(limit)),
                "popular_end_stations": station_counts(fields::END_STATION_NAME, Some(limit)),
            } }])
            .await?;
        Ok(rows.pop().unwrap_or(PopularStations {
            popular_start_stations: Vec::new(),
            popular_end_stations: Vec::new(),
        }))
    }

    pub async fn bike_types_used_by_members(&self) -> Result<Vec<BikeTypeCount>> {
        self.aggregate(vec![
            doc! { "$match": {
                "member_casual": "member",
                "rideable_type": { "$type": "string" },
            } },
            doc! { "$group": { "_id": "$rideable_type", "count": { "$sum": 1 } } },
            doc! { "$sort": { "count": -1, "_id": 1 } },
            doc! { "$project": { "_id": 0, "bike_type": "$_id", "count": 1 } },
        ])
        .await
    }

    /// Trip counts per hour of day (0-23), busiest first.
    pub async fn peak_usage_hours(&self) -> Result<Vec<HourCount>> {
        self.aggregate(vec![
            started_trips(),
            doc! { "$group": { "_id": { "$hour": "$started_at" }, "count": { "$sum": 1 } } },
            doc! { "$sort": { "count": -1, "_id": 1 } },
            doc! { "$project": { "_id": 0, "hour": "$_id", "count": 1 } },
        ])
        .await
    }

    /// Trip counts per (hour, day of week), ascending by hour then day.
    pub async fn peak_usage_hours_by_day(&self) -> Result<Vec<HourDayCount>> {
        self.aggregate(vec![
            started_trips(),
            doc! { "$group": {
                "_id": {
                    "hour": { "$hour": "$started_at" },
                    "day": { "$dayOfWeek": "$started_at" },
                },
                "count": { "$sum": 1 },
            } },
            doc! { "$sort": { "_id.hour": 1, "_id.day": 1 } },
            doc! { "$project": { "_id": 0, "hour": "$_id.hour", "day": "$_id.day", "count": 1 } },
        ])
        .await
    }

    /// Up to `size` trips drawn without replacement. Composition varies
    /// between calls.
    pub async fn random_sample(&self, size: i64) -> Result<Vec<GeoTrip>> {
        if size < 1 {
            return Err(Error::Query("sample size must be at least 1".to_string()));
        }
        let rows = self
            .collection
            .aggregate(vec![
                doc! { "$sample": { "size": size } },
                geo_projection(),
            ])
            .await?;
        decode_rows(rows)
    }

    /// Geo, time and type fields of every trip, unfiltered.
    pub async fn raw_projection(&self) -> Result<Vec<GeoTrip>> {
        let rows = self
            .collection
            .find(
                doc! {},
                FindOptions {
                    projection: Some(geo_projection_spec()),
                    ..Default::default()
                },
            )
            .await?;
        decode_rows(rows)
    }

    async fn aggregate<T: DeserializeOwned>(&self, pipeline: Vec<Document>) -> Result<Vec<T>> {
        let rows = self.collection.aggregate(pipeline).await?;
        decode_rows(rows)
    }
}

/// Decode result documents into a row type.
pub(crate) fn decode_rows<T: DeserializeOwned>(rows: Vec<Document>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            bson::from_document(row).map_err(|e| Error::Query(format!("unexpected row shape: {}", e)))
        })
        .collect()
}

/// Fields returned for map and speed computations.
pub(crate) fn geo_projection_spec() -> Document {
    doc! {
        "_id": 0,
        "started_at": 1,
        "ended_at": 1,
        "start_station_name": 1,
        "end_station_name": 1,
        "start_lat": 1,
        "start_lng": 1,
        "end_lat": 1,
        "end_lng": 1,
        "rideable_type": 1,
        "member_casual": 1,
    }
}

pub(crate) fn geo_projection() -> Document {
    doc! { "$project": geo_projection_spec() }
}

fn started_trips() -> Document {
    doc! { "$match": { "started_at": { "$type": "date" } } }
}

fn timed_trips() -> Document {
    doc! { "$match": {
        "started_at": { "$type": "date" },
        "ended_at": { "$type": "date" },
    } }
}

fn duration_avg() -> Document {
    doc! { "$avg": { "$subtract": ["$ended_at", "$started_at"] } }
}

fn station_counts(field: &str, limit: Option<i64>) -> Vec<Document> {
    let mut pipeline = vec![
        doc! { "$group": { "_id": format!("${}", field), "count": { "$sum": 1 } } },
        doc! { "$sort": { "count": -1, "_id": 1 } },
    ];
    if let Some(limit) = limit {
        pipeline.push(doc! { "$limit": limit });
    }
    pipeline.push(doc! { "$project": { "_id": 0, "station": "$_id", "count": 1 } });
    pipeline
}
