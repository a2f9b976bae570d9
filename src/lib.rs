//! # Bike-share Harness
//!
//! Ingests public bike-share trip records into a document store and exposes
//! a catalogue of analytical read operations over them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Source     │──▶│  Ingestion   │──▶│  DataStore   │
//! │ 12 monthly   │   │ fetch/unpack │   │ mongo/sqlite │
//! │  archives    │   │ normalize    │   │   /memory    │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!                         ┌────────────────────┤
//!                         ▼                    ▼
//!                  ┌─────────────┐     ┌──────────────┐
//!                  │   Query     │     │   Custom     │
//!                  │  Catalogue  │     │ Query Builder│
//!                  └─────────────┘     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bikeshare init
//! bikeshare ingest --year 2023
//! bikeshare query total_document_count trips_per_month
//! bikeshare custom --rider-type member --sample 500
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Trip record and query row types |
//! | [`store`] | Data store adapter and backends |
//! | [`source`] | Source periods and payload download |
//! | [`extract`] | Archive unpacking |
//! | [`normalize`] | Row validation and timestamp parsing |
//! | [`ingest`] | Ingestion pipeline |
//! | [`queries`] | Query catalogue |
//! | [`custom_query`] | Custom query builder |
//! | [`speed`] | Distance and speed post-processing |
//! | [`cache`] | Expiring result cache for callers |

pub mod cache;
pub mod config;
pub mod custom_query;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod queries;
pub mod source;
pub mod speed;
pub mod store;
