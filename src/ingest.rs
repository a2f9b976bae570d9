//! Ingestion pipeline orchestration.
//!
//! Populates the trip collection for a full year, one calendar month at a
//! time: download → extract → normalize → bulk insert → cleanup. Periods run
//! strictly one after another because every step shares the working
//! directory and the target collection.
//!
//! Failures inside a period (download, extraction, unreadable tables,
//! rejected inserts) are logged and contained to that period. Configuration
//! errors (bad template, unresolvable collection, missing working directory)
//! abort the run before any period starts.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::extract::extract_first_table;
use crate::models::TripRecord;
use crate::normalize::{read_trips, Normalized};
use crate::source::{self, periods_for_year};
use crate::store::DataStore;

/// Lifecycle of one source period. `Cleaned` is always the terminal step;
/// a period whose fetch or extraction yields nothing goes from `Pending`
/// straight there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeriodState {
    Pending,
    Fetched,
    Extracted,
    Loaded,
    Cleaned,
}

impl fmt::Display for PeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeriodState::Pending => "pending",
            PeriodState::Fetched => "fetched",
            PeriodState::Extracted => "extracted",
            PeriodState::Loaded => "loaded",
            PeriodState::Cleaned => "cleaned",
        };
        f.write_str(label)
    }
}

/// Outcome of [`IngestPipeline::normalize_and_load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub kept: usize,
    pub dropped: usize,
    pub inserted: u64,
}

/// Outcome of one period of [`IngestPipeline::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodReport {
    pub url: String,
    /// Furthest state reached before cleanup.
    pub reached: PeriodState,
    pub kept: usize,
    pub dropped: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub collection: String,
    pub periods: Vec<PeriodReport>,
}

impl IngestReport {
    pub fn total_inserted(&self) -> u64 {
        self.periods.iter().map(|p| p.inserted).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.periods.iter().map(|p| p.dropped).sum()
    }

    /// Periods that produced a table and reached the load step.
    pub fn loaded_periods(&self) -> usize {
        self.periods
            .iter()
            .filter(|p| p.reached == PeriodState::Loaded)
            .count()
    }
}

/// Ingestion pipeline bound to one [`DataStore`].
pub struct IngestPipeline {
    store: DataStore,
    client: reqwest::Client,
}

impl IngestPipeline {
    pub fn new(store: DataStore) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Download the payload at `url` into `dir` and extract its first table.
    ///
    /// Returns `Ok(None)` when the archive has no qualifying entry. The
    /// downloaded archive is left in place; [`ingest`](Self::ingest) removes it.
    pub async fn fetch(&self, url: &str, dir: &Path) -> Result<Option<PathBuf>> {
        let archive = source::download(&self.client, url, dir).await?;
        tracing::debug!(%url, archive = %archive.display(), state = %PeriodState::Fetched, "downloaded");
        extract_in_background(archive, dir.to_path_buf()).await
    }

    /// Normalize the table at `table` (if any), persist the surviving rows,
    /// then delete the table. Never fails: problems are logged and reflected
    /// in the returned counts.
    pub async fn normalize_and_load(
        &self,
        table: Option<&Path>,
        collection_name: Option<&str>,
    ) -> LoadReport {
        let Some(table) = table else {
            tracing::info!("no table to load");
            return LoadReport::default();
        };

        let mut report = LoadReport::default();
        match read_in_background(table.to_path_buf()).await {
            Ok(Normalized { records, dropped }) => {
                report.kept = records.len();
                report.dropped = dropped;
                if dropped > 0 {
                    tracing::info!(
                        file = %table.display(),
                        kept = report.kept,
                        dropped,
                        "rows dropped during normalization"
                    );
                }
                report.inserted = self.load(collection_name, records).await;
            }
            Err(e) => {
                tracing::warn!(file = %table.display(), error = %e, kind = e.kind(), "table could not be read");
            }
        }

        remove_if_present(table).await;
        report
    }

    /// Insert `records` in one bulk operation. Failures are logged and count
    /// as zero inserted.
    pub async fn load(&self, collection_name: Option<&str>, records: Vec<TripRecord>) -> u64 {
        if records.is_empty() {
            tracing::debug!("empty batch; nothing to insert");
            return 0;
        }

        let collection = match self.store.get_collection(collection_name) {
            Ok(collection) => collection,
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "cannot resolve collection for load");
                return 0;
            }
        };

        let documents = match records.iter().map(TripRecord::to_document).collect::<Result<Vec<_>>>() {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(collection = collection.name(), error = %e, kind = e.kind(), "cannot encode batch");
                return 0;
            }
        };
        match collection.insert_many(documents).await {
            Ok(inserted) => {
                tracing::info!(collection = collection.name(), inserted, "batch inserted");
                inserted
            }
            Err(e) => {
                tracing::warn!(collection = collection.name(), error = %e, kind = e.kind(), "bulk insert rejected");
                0
            }
        }
    }

    /// Ingest all twelve months of `year` from `base_url`.
    pub async fn ingest(
        &self,
        base_url: &str,
        year: i32,
        working_dir: &Path,
        collection_name: Option<&str>,
    ) -> Result<IngestReport> {
        let periods = periods_for_year(base_url, year)?;
        if !working_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }
        let collection = self.store.get_collection(collection_name)?;
        let collection_name = collection.name().to_string();

        let mut reports = Vec::with_capacity(periods.len());
        for period in &periods {
            let url = period.url()?;
            let token = period.token();
            let archive = source::archive_path(&url, working_dir);
            let mut report = PeriodReport {
                url: url.clone(),
                reached: PeriodState::Pending,
                kept: 0,
                dropped: 0,
                inserted: 0,
            };

            let table = match self.fetch(&url, working_dir).await {
                Ok(Some(table)) => {
                    report.reached = PeriodState::Extracted;
                    tracing::debug!(period = %token, table = %table.display(), "extracted");
                    Some(table)
                }
                Ok(None) => {
                    tracing::warn!(period = %token, %url, "archive holds no table");
                    None
                }
                Err(e) => {
                    tracing::warn!(period = %token, %url, error = %e, kind = e.kind(), "fetch failed");
                    None
                }
            };

            if let Some(table) = table {
                let loaded = self
                    .normalize_and_load(Some(&table), Some(&collection_name))
                    .await;
                report.reached = PeriodState::Loaded;
                report.kept = loaded.kept;
                report.dropped = loaded.dropped;
                report.inserted = loaded.inserted;
                tracing::debug!(period = %token, inserted = loaded.inserted, "loaded");
            }

            remove_if_present(&archive).await;
            tracing::debug!(period = %token, reached = %report.reached, "cleaned");
            reports.push(report);
        }

        let report = IngestReport {
            collection: collection_name,
            periods: reports,
        };
        tracing::info!(
            year,
            collection = %report.collection,
            periods_loaded = report.loaded_periods(),
            inserted = report.total_inserted(),
            dropped = report.total_dropped(),
            "ingestion finished"
        );
        Ok(report)
    }
}

async fn extract_in_background(archive: PathBuf, dir: PathBuf) -> Result<Option<PathBuf>> {
    tokio::task::spawn_blocking(move || extract_first_table(&archive, &dir))
        .await
        .map_err(|e| Error::TransientIo(format!("extraction task failed: {}", e)))?
}

async fn read_in_background(table: PathBuf) -> Result<Normalized> {
    tokio::task::spawn_blocking(move || read_trips(&table))
        .await
        .map_err(|e| Error::TransientIo(format!("normalization task failed: {}", e)))?
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), error = %e, "cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    const HEADER: &str = "ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual";

    fn table_body(rows: &[&str]) -> String {
        let mut body = String::from(HEADER);
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        body.push('\n');
        body
    }

    fn write_archive(path: &Path, entry: &str, body: &str) {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        zip.start_file(entry, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn normalize_and_load_persists_only_valid_rows() {
        let tmp = TempDir::new().unwrap();
        let table = tmp.path().join("trips.csv");
        std::fs::write(
            &table,
            table_body(&[
                "X1,classic_bike,garbage,2023-01-01 10:10:00,A,,B,,40.7,-74.0,40.7,-74.0,member",
                "X2,classic_bike,2023-01-01 10:00:00,2023-01-01 10:10:00,A,,B,,40.7,-74.0,40.7,-74.0,member",
            ]),
        )
        .unwrap();

        let store = DataStore::in_memory(Some("trips"));
        let pipeline = IngestPipeline::new(store.clone());
        let report = pipeline.normalize_and_load(Some(&table), None).await;

        assert_eq!(
            report,
            LoadReport {
                kept: 1,
                dropped: 1,
                inserted: 1
            }
        );
        assert!(!table.exists());

        let trips = store.get_collection(None).unwrap();
        assert_eq!(trips.count_documents(doc! {}).await.unwrap(), 1);
        assert_eq!(
            trips.count_documents(doc! { "ride_id": "X2" }).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn normalize_and_load_without_table_is_noop() {
        let pipeline = IngestPipeline::new(DataStore::in_memory(Some("trips")));
        let report = pipeline.normalize_and_load(None, None).await;
        assert_eq!(report, LoadReport::default());
    }

    #[tokio::test]
    async fn load_without_collection_is_logged_not_raised() {
        let pipeline = IngestPipeline::new(DataStore::in_memory(None));
        let tmp = TempDir::new().unwrap();
        let table = tmp.path().join("t.csv");
        std::fs::write(
            &table,
            table_body(&["Z,classic_bike,2023-01-01 10:00:00,2023-01-01 10:10:00,A,,B,,40.7,-74.0,40.7,-74.0,member"]),
        )
        .unwrap();
        let report = pipeline.normalize_and_load(Some(&table), None).await;
        assert_eq!(report.kept, 1);
        assert_eq!(report.inserted, 0);
    }

    #[tokio::test]
    async fn fetch_extracts_table_and_keeps_archive() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let source = mirror.path().join("202305-tripdata.zip");
        write_archive(&source, "202305-tripdata.csv", &table_body(&[]));

        let pipeline = IngestPipeline::new(DataStore::in_memory(Some("trips")));
        let url = format!("file://{}", source.display());
        let table = pipeline.fetch(&url, work.path()).await.unwrap().unwrap();

        assert_eq!(table, work.path().join("202305-tripdata.csv"));
        assert!(work.path().join("202305-tripdata.zip").exists());
    }

    #[tokio::test]
    async fn ingest_contains_failures_per_period() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        // March: one valid row. June: not an archive. July: no table inside.
        // Everything else missing.
        write_archive(
            &mirror.path().join("202303-tripdata.zip"),
            "202303-tripdata.csv",
            &table_body(&["M1,electric_bike,2023-03-02 08:00:00,2023-03-02 08:30:00,A,,B,,40.7,-74.0,40.7,-74.0,casual"]),
        );
        std::fs::write(mirror.path().join("202306-tripdata.zip"), "not a zip").unwrap();
        write_archive(&mirror.path().join("202307-tripdata.zip"), "README.txt", "no table");

        let store = DataStore::in_memory(None);
        let pipeline = IngestPipeline::new(store.clone());
        let template = format!("file://{}/202301-tripdata.zip", mirror.path().display());
        let report = pipeline
            .ingest(&template, 2023, work.path(), Some("trips_2023"))
            .await
            .unwrap();

        assert_eq!(report.collection, "trips_2023");
        assert_eq!(report.periods.len(), 12);
        assert_eq!(report.periods[0].reached, PeriodState::Pending);
        assert_eq!(report.periods[2].reached, PeriodState::Loaded);
        assert_eq!(report.periods[2].inserted, 1);
        // A payload that is not an archive skips straight to cleanup.
        assert_eq!(report.periods[5].reached, PeriodState::Pending);
        assert_eq!(report.periods[6].reached, PeriodState::Pending);
        assert_eq!(report.total_inserted(), 1);
        assert_eq!(report.loaded_periods(), 1);

        let leftovers: Vec<_> = std::fs::read_dir(work.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "working directory not cleaned");

        let trips = store.get_collection(Some("trips_2023")).unwrap();
        assert_eq!(trips.count_documents(doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ingest_rejects_bad_template_and_missing_dir() {
        let pipeline = IngestPipeline::new(DataStore::in_memory(Some("trips")));
        let tmp = TempDir::new().unwrap();

        let err = pipeline
            .ingest("https://host/trips.zip", 2023, tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = pipeline
            .ingest(
                "https://host/202301-trips.zip",
                2023,
                &tmp.path().join("absent"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
