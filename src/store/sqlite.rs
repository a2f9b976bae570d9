//! Embedded SQLite [`Database`] for single-machine use (`sqlite:<path>`).
//!
//! Each document is stored as a BSON blob in the `documents` table, tagged
//! with its collection name; `seq` preserves insertion order.
//!
//! Rows are decoded one at a time as they stream out of SQLite. Unfiltered
//! `find` windows become `LIMIT`/`OFFSET`, filtered ones stop reading once
//! the limit is reached. Filters and leading per-document pipeline stages
//! (`$match`, `$project`, `$addFields`) run through [`super::eval`] while
//! streaming. Stages that need their whole input (`$group`, `$sort`,
//! `$sample`, `$facet`) hold every document that reaches them, so this
//! backend suits a single machine and a few months of trips; a full year of
//! a large system belongs on the document database.

use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};

use super::memory::with_object_id;
use super::{eval, Collection, CollectionHandle, Database, FindOptions};

const SELECT_BODIES: &str =
    "SELECT body FROM documents WHERE collection = ? ORDER BY seq LIMIT ? OFFSET ?";

/// SQLite reads a negative `LIMIT` as no limit.
const UNBOUNDED: i64 = -1;

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open (creating if missing) the database file and ensure the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let path = Path::new(path.trim_start_matches("//"));
        if path.as_os_str().is_empty() {
            return Err(Error::Configuration("sqlite uri has no path".to_string()));
        }

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Configuration(format!(
                        "cannot create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::Configuration(format!("cannot open {}: {}", path.display(), e)))?;

        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                body BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn collection(&self, name: &str) -> CollectionHandle {
        Arc::new(SqliteCollection {
            name: name.to_string(),
            pool: self.pool.clone(),
        })
    }

    async fn init(&self) -> Result<()> {
        self.migrate().await
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

pub struct SqliteCollection {
    name: String,
    pool: SqlitePool,
}

impl SqliteCollection {
    /// Documents in insertion order, `offset` rows in, at most `limit` rows.
    fn scan(&self, offset: i64, limit: i64) -> impl Stream<Item = Result<Document>> + Send + '_ {
        sqlx::query_scalar::<_, Vec<u8>>(SELECT_BODIES)
            .bind(&self.name)
            .bind(limit)
            .bind(offset)
            .fetch(&self.pool)
            .map(move |row| {
                let body = row.map_err(|e| Error::Query(e.to_string()))?;
                Document::from_reader(&mut body.as_slice())
                    .map_err(|e| Error::Query(format!("corrupt document in {}: {}", self.name, e)))
            })
    }
}

fn shape(doc: Document, projection: Option<&Document>) -> Result<Document> {
    match projection {
        Some(spec) => eval::project(&doc, spec),
        None => Ok(doc),
    }
}

#[async_trait]
impl Collection for SqliteCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(persistence)?;
        let mut inserted = 0u64;

        for doc in docs {
            let mut body = Vec::new();
            with_object_id(doc)
                .to_writer(&mut body)
                .map_err(|e| Error::Persistence(e.to_string()))?;

            sqlx::query("INSERT INTO documents (collection, body) VALUES (?, ?)")
                .bind(&self.name)
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(persistence)?;
            inserted += 1;
        }

        tx.commit().await.map_err(persistence)?;
        Ok(inserted)
    }

    async fn count_documents(&self, filter: Document) -> Result<u64> {
        if filter.is_empty() {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
                    .bind(&self.name)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| Error::Query(e.to_string()))?;
            return Ok(count as u64);
        }

        let mut docs = pin!(self.scan(0, UNBOUNDED));
        let mut count = 0u64;
        while let Some(doc) = docs.try_next().await? {
            if eval::matches(&doc, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        let skip = i64::try_from(options.skip.unwrap_or(0))
            .map_err(|_| Error::Query("skip too large".to_string()))?;
        let limit = match options.limit {
            Some(limit) if limit != 0 => Some(limit.unsigned_abs()),
            _ => None,
        };
        let projection = options.projection.as_ref();
        let mut rows = Vec::new();

        if filter.is_empty() {
            let window = limit.map_or(UNBOUNDED, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let mut docs = pin!(self.scan(skip, window));
            while let Some(doc) = docs.try_next().await? {
                rows.push(shape(doc, projection)?);
            }
            return Ok(rows);
        }

        let mut docs = pin!(self.scan(0, UNBOUNDED));
        let mut skipped = 0i64;
        while let Some(doc) = docs.try_next().await? {
            if !eval::matches(&doc, &filter)? {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            rows.push(shape(doc, projection)?);
            if limit.is_some_and(|l| rows.len() as u64 >= l) {
                break;
            }
        }
        Ok(rows)
    }

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        let mut docs = pin!(self.scan(0, UNBOUNDED));
        let mut values = eval::DistinctValues::new(field);
        while let Some(doc) = docs.try_next().await? {
            if eval::matches(&doc, &filter)? {
                values.add(&doc);
            }
        }
        Ok(values.into_values())
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let head = pipeline
            .iter()
            .take_while(|stage| eval::is_per_document(stage))
            .count();
        let (head, rest) = pipeline.split_at(head);

        let mut docs = pin!(self.scan(0, UNBOUNDED));
        let mut kept = Vec::new();
        while let Some(doc) = docs.try_next().await? {
            if let Some(doc) = eval::apply_per_document(doc, head)? {
                kept.push(doc);
            }
        }
        eval::run_pipeline(kept, rest)
    }
}

fn persistence(e: sqlx::Error) -> Error {
    Error::Persistence(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("trips.sqlite");
        let path = path.to_str().unwrap().to_string();

        {
            let db = SqliteDatabase::open(&path).await.unwrap();
            let trips = db.collection("trips");
            let inserted = trips
                .insert_many(vec![doc! { "n": 1 }, doc! { "n": 2 }])
                .await
                .unwrap();
            assert_eq!(inserted, 2);
            db.collection("other")
                .insert_many(vec![doc! { "n": 99 }])
                .await
                .unwrap();
        }

        let db = SqliteDatabase::open(&path).await.unwrap();
        db.init().await.unwrap();
        let trips = db.collection("trips");
        assert_eq!(trips.count_documents(doc! {}).await.unwrap(), 2);
        assert_eq!(
            trips.count_documents(doc! { "n": { "$gt": 1 } }).await.unwrap(),
            1
        );
        let rows = trips
            .aggregate(vec![doc! { "$project": { "_id": 0, "n": 1 } }])
            .await
            .unwrap();
        assert_eq!(rows, vec![doc! { "n": 1 }, doc! { "n": 2 }]);
    }

    async fn numbered(tmp: &TempDir, n: i32) -> SqliteDatabase {
        let path = tmp.path().join("trips.sqlite");
        let db = SqliteDatabase::open(path.to_str().unwrap()).await.unwrap();
        db.collection("trips")
            .insert_many((1..=n).map(|n| doc! { "n": n, "even": n % 2 == 0 }).collect())
            .await
            .unwrap();
        db
    }

    /// Append a row that cannot be decoded; any read that reaches it fails.
    async fn append_corrupt_row(db: &SqliteDatabase) {
        sqlx::query("INSERT INTO documents (collection, body) VALUES (?, ?)")
            .bind("trips")
            .bind(vec![1u8, 2, 3])
            .execute(&db.pool)
            .await
            .unwrap();
    }

    fn numbers(rows: &[Document]) -> Vec<i32> {
        rows.iter().map(|row| row.get_i32("n").unwrap()).collect()
    }

    #[tokio::test]
    async fn unfiltered_window_reads_only_its_rows() {
        let tmp = TempDir::new().unwrap();
        let db = numbered(&tmp, 10).await;
        append_corrupt_row(&db).await;
        let trips = db.collection("trips");

        let rows = trips
            .find(
                doc! {},
                FindOptions {
                    projection: Some(doc! { "_id": 0, "n": 1 }),
                    skip: Some(3),
                    limit: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![doc! { "n": 4 }, doc! { "n": 5 }]);

        let err = trips.count_documents(doc! { "even": true }).await.unwrap_err();
        assert!(err.to_string().contains("corrupt document"));
    }

    #[tokio::test]
    async fn filtered_find_stops_at_the_limit() {
        let tmp = TempDir::new().unwrap();
        let db = numbered(&tmp, 10).await;
        append_corrupt_row(&db).await;

        let rows = db
            .collection("trips")
            .find(
                doc! { "even": true },
                FindOptions {
                    skip: Some(1),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(numbers(&rows), vec![4, 6]);
    }

    #[tokio::test]
    async fn streamed_reads_match_in_memory_evaluation() {
        let tmp = TempDir::new().unwrap();
        let db = numbered(&tmp, 6).await;
        let trips = db.collection("trips");

        assert_eq!(trips.count_documents(doc! { "even": false }).await.unwrap(), 3);
        assert_eq!(
            trips.distinct("even", doc! { "n": { "$gt": 1 } }).await.unwrap(),
            vec![Bson::Boolean(true), Bson::Boolean(false)]
        );

        let rows = trips
            .aggregate(vec![
                doc! { "$match": { "n": { "$gte": 2 } } },
                doc! { "$project": { "_id": 0, "even": 1 } },
                doc! { "$group": { "_id": "$even", "count": { "$sum": 1 } } },
                doc! { "$sort": { "_id": 1 } },
            ])
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "_id": false, "count": 2 },
                doc! { "_id": true, "count": 3 },
            ]
        );
    }

    #[tokio::test]
    async fn empty_path_is_rejected() {
        let err = SqliteDatabase::open("").await.err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
