//! # Bike-share harness CLI (`bikeshare`)
//!
//! Ingests monthly bike-share trip archives into a document store and runs
//! the analytical query catalogue against it.
//!
//! ## Usage
//!
//! ```bash
//! bikeshare --config ./config/bikeshare.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bikeshare init` | Prepare the store (tables and indexes for `sqlite:` stores) |
//! | `bikeshare ingest` | Fetch, unpack, normalize and load twelve months of trips |
//! | `bikeshare query <name>...` | Run catalogue entries and print JSON |
//! | `bikeshare custom` | Filter trips by date, station, vehicle and rider type |
//!
//! ## Examples
//!
//! ```bash
//! bikeshare ingest --year 2023
//! bikeshare query total_document_count rider_type_counts
//! bikeshare query most_popular_stations --limit 5
//! bikeshare custom --start-date 2023-06-01 --end-date 2023-06-30 --rider-type member --sample 500
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use bikeshare_harness::cache::QueryCache;
use bikeshare_harness::config::{self, Config};
use bikeshare_harness::custom_query::{build_filter, CustomQuery, FilterParams, Selection, ALL};
use bikeshare_harness::error::Error;
use bikeshare_harness::ingest::IngestPipeline;
use bikeshare_harness::queries::TripQueries;
use bikeshare_harness::speed;
use bikeshare_harness::store::DataStore;

/// Catalogue entries accepted by `bikeshare query`.
const QUERY_NAMES: &[&str] = &[
    "total_document_count",
    "paginated_listing",
    "distinct_start_stations",
    "bike_type_counts",
    "average_trip_duration",
    "average_trip_duration_by_bike_type",
    "average_trip_duration_by_rider_type",
    "rider_type_counts",
    "member_trips",
    "trips_grouped_by_start_station",
    "trips_with_identical_start_end_station",
    "trips_per_month",
    "most_popular_stations",
    "bike_types_used_by_members",
    "peak_usage_hours",
    "peak_usage_hours_by_day",
    "random_sample",
    "raw_projection",
    "average_speed_by_rider_type",
    "average_speed_by_bike_type",
];

/// Bike-share trip ingestion and analytics.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bikeshare.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bikeshare",
    about = "Ingest bike-share trip archives and query them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bikeshare.toml")]
    config: PathBuf,

    /// Log progress at info level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the store. Idempotent.
    Init,

    /// Ingest one year of monthly trip archives.
    ///
    /// Months that fail to download or unpack are logged and skipped; the
    /// run continues with the next month.
    Ingest {
        /// Source template containing a six-digit year-month token,
        /// e.g. `https://host/202301-citibike-tripdata.csv.zip`.
        #[arg(long)]
        base_url: Option<String>,

        /// Year to ingest.
        #[arg(long)]
        year: Option<i32>,

        /// Directory for downloads and extracted tables.
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Target collection (defaults to `[store].collection`).
        #[arg(long)]
        collection: Option<String>,
    },

    /// Run query catalogue entries and print one JSON object per entry.
    ///
    /// Repeating a name within one invocation is served from the cache.
    Query {
        /// Entry names, e.g. `rider_type_counts trips_per_month`.
        #[arg(required = true)]
        names: Vec<String>,

        /// Page number for `paginated_listing` (1-based).
        #[arg(long, default_value_t = 1)]
        page: u64,

        /// Page size for `paginated_listing` (defaults to `[queries].page_size`).
        #[arg(long)]
        page_size: Option<u64>,

        /// Rows per facet for `most_popular_stations`.
        #[arg(long)]
        limit: Option<i64>,

        /// Sample size for `random_sample`.
        #[arg(long)]
        size: Option<i64>,

        /// Collection to query (defaults to `[store].collection`).
        #[arg(long)]
        collection: Option<String>,
    },

    /// Filter trips with the custom query builder.
    Custom {
        /// Earliest start day (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<String>,

        /// Latest end day (YYYY-MM-DD).
        #[arg(long)]
        end_date: Option<String>,

        #[arg(long, default_value = ALL)]
        start_station: String,

        #[arg(long, default_value = ALL)]
        end_station: String,

        /// Vehicle type, e.g. `electric_bike`.
        #[arg(long, default_value = ALL)]
        ride_type: String,

        /// Rider type, `member` or `casual`.
        #[arg(long, default_value = ALL)]
        rider_type: String,

        /// Return a geo sample of this many trips instead of the full table.
        #[arg(long)]
        sample: Option<i64>,

        /// Print the available choices for each filter instead of running one.
        #[arg(long)]
        options: bool,

        /// Collection to query (defaults to `[store].collection`).
        #[arg(long)]
        collection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;
    let store = DataStore::connect(&cfg.store)
        .await
        .context("failed to connect to store")?;

    match cli.command {
        Commands::Init => {
            store.init().await?;
            println!("Store initialized ({} backend).", store.backend());
        }
        Commands::Ingest {
            base_url,
            year,
            working_dir,
            collection,
        } => {
            run_ingest(&cfg, store, base_url, year, working_dir, collection).await?;
        }
        Commands::Query {
            names,
            page,
            page_size,
            limit,
            size,
            collection,
        } => {
            let args = QueryArgs {
                page,
                page_size: page_size.unwrap_or(cfg.queries.page_size),
                limit: limit.unwrap_or(cfg.queries.popular_limit),
                size: size.unwrap_or(cfg.queries.sample_size),
            };
            let queries = TripQueries::new(store.get_collection(collection.as_deref())?);
            let cache = QueryCache::new(Duration::from_secs(cfg.queries.cache_ttl_secs));
            for name in &names {
                let signature = args.signature(name)?;
                let result = cache
                    .get_or_try_insert_with(&signature, || run_query(&queries, name, &args))
                    .await
                    .with_context(|| format!("query {} failed", signature))?;
                println!("{}", json!({ "query": signature, "result": result }));
            }
        }
        Commands::Custom {
            start_date,
            end_date,
            start_station,
            end_station,
            ride_type,
            rider_type,
            sample,
            options,
            collection,
        } => {
            let custom = CustomQuery::new(store.get_collection(collection.as_deref())?);
            if options {
                println!("{}", serde_json::to_string(&custom.filter_options().await?)?);
                return Ok(());
            }

            let params = FilterParams {
                start_date: parse_day(start_date.as_deref())?,
                end_date: parse_day(end_date.as_deref())?,
                start_station: Selection::parse(&start_station),
                end_station: Selection::parse(&end_station),
                ride_type: Selection::parse(&ride_type),
                rider_type: Selection::parse(&rider_type),
            };
            let predicate = build_filter(&params);
            let rows = match sample {
                Some(size) => to_json(custom.run_filtered_sample(predicate, size).await?)?,
                None => to_json(custom.run_filtered(predicate).await?)?,
            };
            println!("{}", rows);
        }
    }

    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    store: DataStore,
    base_url: Option<String>,
    year: Option<i32>,
    working_dir: Option<PathBuf>,
    collection: Option<String>,
) -> anyhow::Result<()> {
    let Some(base_url) = base_url.or_else(|| cfg.ingest.base_url.clone()) else {
        bail!("no source template: pass --base-url or set [ingest].base_url");
    };
    let Some(year) = year.or(cfg.ingest.year) else {
        bail!("no year: pass --year or set [ingest].year");
    };
    let working_dir = working_dir.unwrap_or_else(|| cfg.ingest.working_dir.clone());
    std::fs::create_dir_all(&working_dir).with_context(|| {
        format!("failed to create working directory {}", working_dir.display())
    })?;

    let pipeline = IngestPipeline::new(store);
    let report = pipeline
        .ingest(&base_url, year, &working_dir, collection.as_deref())
        .await?;

    println!("ingest {} -> {}", year, report.collection);
    for period in &report.periods {
        println!(
            "  {:<10} kept {:>8}  dropped {:>6}  inserted {:>8}  {}",
            period.reached.to_string(),
            period.kept,
            period.dropped,
            period.inserted,
            period.url
        );
    }
    println!("  months loaded: {}", report.loaded_periods());
    println!("  inserted: {}", report.total_inserted());
    println!("  dropped: {}", report.total_dropped());
    println!("ok");
    Ok(())
}

struct QueryArgs {
    page: u64,
    page_size: u64,
    limit: i64,
    size: i64,
}

impl QueryArgs {
    /// Cache key: the entry name plus the arguments it uses.
    fn signature(&self, name: &str) -> anyhow::Result<String> {
        if !QUERY_NAMES.contains(&name) {
            bail!(
                "unknown query '{}'. Available: {}",
                name,
                QUERY_NAMES.join(", ")
            );
        }
        Ok(match name {
            "paginated_listing" => format!(
                "paginated_listing(page_num={}, page_size={})",
                self.page, self.page_size
            ),
            "most_popular_stations" => format!("most_popular_stations(limit={})", self.limit),
            "random_sample" => format!("random_sample(size={})", self.size),
            other => format!("{}()", other),
        })
    }
}

async fn run_query(queries: &TripQueries, name: &str, args: &QueryArgs) -> Result<Value, Error> {
    match name {
        "total_document_count" => to_json(queries.total_document_count().await?),
        "paginated_listing" => to_json(queries.paginated_listing(args.page, args.page_size).await?),
        "distinct_start_stations" => to_json(queries.distinct_start_stations().await?),
        "bike_type_counts" => to_json(queries.bike_type_counts().await?),
        "average_trip_duration" => to_json(queries.average_trip_duration().await?),
        "average_trip_duration_by_bike_type" => {
            to_json(queries.average_trip_duration_by_bike_type().await?)
        }
        "average_trip_duration_by_rider_type" => {
            to_json(queries.average_trip_duration_by_rider_type().await?)
        }
        "rider_type_counts" => to_json(queries.rider_type_counts().await?),
        "member_trips" => to_json(queries.member_trips().await?),
        "trips_grouped_by_start_station" => to_json(queries.trips_grouped_by_start_station().await?),
        "trips_with_identical_start_end_station" => {
            to_json(queries.trips_with_identical_start_end_station().await?)
        }
        "trips_per_month" => to_json(queries.trips_per_month().await?),
        "most_popular_stations" => to_json(queries.most_popular_stations(args.limit).await?),
        "bike_types_used_by_members" => to_json(queries.bike_types_used_by_members().await?),
        "peak_usage_hours" => to_json(queries.peak_usage_hours().await?),
        "peak_usage_hours_by_day" => to_json(queries.peak_usage_hours_by_day().await?),
        "random_sample" => to_json(queries.random_sample(args.size).await?),
        "raw_projection" => to_json(queries.raw_projection().await?),
        "average_speed_by_rider_type" => to_json(speed::average_speed_by_rider_type(
            &queries.raw_projection().await?,
        )),
        "average_speed_by_bike_type" => to_json(speed::average_speed_by_bike_type(
            &queries.raw_projection().await?,
        )),
        other => Err(Error::Query(format!("unknown query '{}'", other))),
    }
}

/// Results print as relaxed extended JSON: stored dates render as
/// `{"$date": "<ISO-8601>"}`.
fn to_json<T: Serialize>(value: T) -> Result<Value, Error> {
    bson::to_bson(&value)
        .map(bson::Bson::into_relaxed_extjson)
        .map_err(|e| Error::Query(format!("cannot encode result: {}", e)))
}

fn parse_day(value: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    value
        .map(|day| {
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", day))
        })
        .transpose()
}
