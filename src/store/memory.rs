//! In-memory [`Database`] implementation for tests and `memory:` stores.
//!
//! Documents live in a `HashMap` of collection name to `Vec<Document>` behind
//! `std::sync::RwLock`. Insertion order is the store-native order. Queries are
//! answered by [`super::eval`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};

use crate::error::Result;

use super::{eval, Collection, CollectionHandle, Database, FindOptions};

type Collections = Arc<RwLock<HashMap<String, Vec<Document>>>>;

/// In-memory database shared by every collection handle it creates.
pub struct MemoryDatabase {
    collections: Collections,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn collection(&self, name: &str) -> CollectionHandle {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            collections: Arc::clone(&self.collections),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryCollection {
    name: String,
    collections: Collections,
}

impl MemoryCollection {
    fn snapshot(&self) -> Vec<Document> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.get(&self.name).cloned().unwrap_or_default()
    }
}

/// Assign an `_id` the way the document database does on insert.
pub(crate) fn with_object_id(mut doc: Document) -> Document {
    if !doc.contains_key("_id") {
        let mut stamped = Document::new();
        stamped.insert("_id", ObjectId::new());
        for (key, value) in doc {
            stamped.insert(key, value);
        }
        doc = stamped;
    }
    doc
}

/// Shared `find` semantics for backends evaluated in process.
fn find_in(docs: Vec<Document>, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
    let mut matched = Vec::new();
    for doc in docs {
        if eval::matches(&doc, filter)? {
            matched.push(doc);
        }
    }

    let skip = options.skip.unwrap_or(0) as usize;
    let mut rows: Vec<Document> = matched.into_iter().skip(skip).collect();
    if let Some(limit) = options.limit {
        if limit != 0 {
            rows.truncate(limit.unsigned_abs() as usize);
        }
    }

    match &options.projection {
        Some(spec) => rows.iter().map(|doc| eval::project(doc, spec)).collect(),
        None => Ok(rows),
    }
}

fn distinct_in(docs: &[Document], field: &str, filter: &Document) -> Result<Vec<Bson>> {
    let mut matched = Vec::new();
    for doc in docs {
        if eval::matches(doc, filter)? {
            matched.push(doc);
        }
    }
    Ok(eval::distinct(matched, field))
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<u64> {
        let count = docs.len() as u64;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .entry(self.name.clone())
            .or_default()
            .extend(docs.into_iter().map(with_object_id));
        Ok(count)
    }

    async fn count_documents(&self, filter: Document) -> Result<u64> {
        let mut count = 0u64;
        for doc in &self.snapshot() {
            if eval::matches(doc, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        find_in(self.snapshot(), &filter, &options)
    }

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        distinct_in(&self.snapshot(), field, &filter)
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        eval::run_pipeline(self.snapshot(), &pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn collection() -> CollectionHandle {
        MemoryDatabase::new().collection("trips")
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_keeps_order() {
        let trips = collection();
        trips
            .insert_many(vec![doc! { "n": 1 }, doc! { "n": 2 }, doc! { "n": 3 }])
            .await
            .unwrap();

        let rows = trips.find(doc! {}, FindOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|d| matches!(d.get("_id"), Some(Bson::ObjectId(_)))));
        let ns: Vec<i32> = rows.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn find_applies_skip_limit_and_projection() {
        let trips = collection();
        trips
            .insert_many((0..10).map(|n| doc! { "n": n, "extra": "x" }).collect())
            .await
            .unwrap();

        let rows = trips
            .find(
                doc! { "n": { "$gte": 2 } },
                FindOptions {
                    projection: Some(doc! { "_id": 0, "n": 1 }),
                    skip: Some(3),
                    limit: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![doc! { "n": 5 }, doc! { "n": 6 }]);
    }

    #[tokio::test]
    async fn distinct_respects_filter() {
        let trips = collection();
        trips
            .insert_many(vec![
                doc! { "s": "A", "k": "member" },
                doc! { "s": "B", "k": "casual" },
                doc! { "s": "A", "k": "casual" },
            ])
            .await
            .unwrap();
        let values = trips.distinct("s", doc! { "k": "casual" }).await.unwrap();
        assert_eq!(values, vec![Bson::String("B".into()), Bson::String("A".into())]);
    }

    #[tokio::test]
    async fn unknown_collection_is_empty() {
        let trips = collection();
        assert_eq!(trips.count_documents(doc! {}).await.unwrap(), 0);
        assert!(trips.aggregate(vec![doc! { "$limit": 5 }]).await.unwrap().is_empty());
    }
}
