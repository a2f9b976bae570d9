//! MongoDB-backed [`Database`].
//!
//! Filters and pipelines are passed through unchanged; the server evaluates
//! them. The client connects lazily, so unreachable servers surface on the
//! first operation rather than at construction.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::Client;

use crate::error::{Error, Result};

use super::{Collection, CollectionHandle, Database, FindOptions};

pub struct MongoDatabase {
    database: mongodb::Database,
}

impl MongoDatabase {
    pub async fn connect_uri(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| Error::Configuration(format!("invalid store uri: {}", e)))?;
        Ok(Self {
            database: client.database(database),
        })
    }

    pub async fn connect_address(host: &str, port: u16, database: &str) -> Result<Self> {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        }];
        let client = Client::with_options(options)
            .map_err(|e| Error::Configuration(format!("invalid store address: {}", e)))?;
        Ok(Self {
            database: client.database(database),
        })
    }
}

#[async_trait]
impl Database for MongoDatabase {
    fn collection(&self, name: &str) -> CollectionHandle {
        Arc::new(MongoCollection {
            name: name.to_string(),
            inner: self.database.collection::<Document>(name),
        })
    }

    fn backend(&self) -> &'static str {
        "mongodb"
    }
}

pub struct MongoCollection {
    name: String,
    inner: mongodb::Collection<Document>,
}

/// Network and server-selection failures are transient; everything else is a
/// rejected request.
fn read_error(e: mongodb::error::Error) -> Error {
    match e.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => Error::TransientIo(e.to_string()),
        _ => Error::Query(e.to_string()),
    }
}

#[async_trait]
impl Collection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let result = self
            .inner
            .insert_many(docs)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(result.inserted_ids.len() as u64)
    }

    async fn count_documents(&self, filter: Document) -> Result<u64> {
        self.inner.count_documents(filter).await.map_err(read_error)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        let mut find_options = mongodb::options::FindOptions::default();
        find_options.projection = options.projection;
        find_options.skip = options.skip;
        find_options.limit = options.limit;

        let cursor = self
            .inner
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(read_error)?;
        cursor.try_collect().await.map_err(read_error)
    }

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        self.inner.distinct(field, filter).await.map_err(read_error)
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self.inner.aggregate(pipeline).await.map_err(read_error)?;
        cursor.try_collect().await.map_err(read_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_uri_is_configuration_error() {
        let err = MongoDatabase::connect_uri("mongodb://", "citibike")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn address_form_builds_lazily() {
        let db = MongoDatabase::connect_address("localhost", 27017, "citibike")
            .await
            .unwrap();
        let trips = db.collection("trips");
        assert_eq!(trips.name(), "trips");
        assert_eq!(db.backend(), "mongodb");
    }
}
