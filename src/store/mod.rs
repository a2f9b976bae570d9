//! Storage abstraction for the trip collection.
//!
//! The [`Collection`] trait defines the operations the ingestion pipeline and
//! the query catalogue need, expressed in the document database's own filter
//! and aggregation-pipeline dialect. [`DataStore`] owns the connection and
//! resolves `(database, collection)` pairs to [`CollectionHandle`]s.
//!
//! Backends are chosen by the connection configuration:
//!
//! | Configuration | Backend |
//! |---------------|---------|
//! | `host` + `port`, `mongodb://…`, `mongodb+srv://…` | [`mongo`] |
//! | `sqlite:<path>` | [`sqlite`] |
//! | `memory:` | [`memory`] |

pub mod eval;
pub mod memory;
pub mod mongo;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::config::{Connection, StoreConfig};
use crate::error::{Error, Result};

/// Options for [`Collection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// A resolved collection of documents.
///
/// Implementations must be `Send + Sync`; handles are shared behind an
/// [`Arc`] and hold no per-call state.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Collection name inside its database.
    fn name(&self) -> &str;

    /// Insert a batch of documents in one bulk operation. Returns the number
    /// inserted.
    async fn insert_many(&self, docs: Vec<Document>) -> Result<u64>;

    /// Count documents matching `filter`.
    async fn count_documents(&self, filter: Document) -> Result<u64>;

    /// Documents matching `filter`, in store-native order.
    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>>;

    /// Distinct values of `field` among documents matching `filter`.
    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>>;

    /// Run an aggregation pipeline.
    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>>;
}

/// Shared handle to a resolved collection.
pub type CollectionHandle = Arc<dyn Collection>;

/// A connected database that can hand out collections by name.
#[async_trait]
pub trait Database: Send + Sync {
    fn collection(&self, name: &str) -> CollectionHandle;

    /// Prepare backend schema. Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Human-readable backend label for logs.
    fn backend(&self) -> &'static str;
}

/// The data store adapter: one connection, one database, an optional default
/// collection.
#[derive(Clone)]
pub struct DataStore {
    database: Arc<dyn Database>,
    default_collection: Option<CollectionHandle>,
}

impl DataStore {
    /// Connect using the configured connection form.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let database: Arc<dyn Database> = match config.connection()? {
            Connection::Address { host, port } => {
                Arc::new(mongo::MongoDatabase::connect_address(&host, port, &config.database).await?)
            }
            Connection::Uri(uri) => {
                if let Some(path) = uri.strip_prefix("sqlite:") {
                    Arc::new(sqlite::SqliteDatabase::open(path).await?)
                } else if uri.starts_with("memory:") {
                    Arc::new(memory::MemoryDatabase::new())
                } else if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
                    Arc::new(mongo::MongoDatabase::connect_uri(&uri, &config.database).await?)
                } else {
                    return Err(Error::Configuration(format!(
                        "unsupported store uri scheme: {}",
                        uri
                    )));
                }
            }
        };

        tracing::debug!(
            backend = database.backend(),
            database = %config.database,
            "store connected"
        );
        Self::from_database(database, config.collection.as_deref())
    }

    /// A process-local store, mostly for tests.
    pub fn in_memory(default_collection: Option<&str>) -> Self {
        let database: Arc<dyn Database> = Arc::new(memory::MemoryDatabase::new());
        let default_collection = default_collection.map(|name| database.collection(name));
        Self {
            database,
            default_collection,
        }
    }

    pub fn from_database(
        database: Arc<dyn Database>,
        default_collection: Option<&str>,
    ) -> Result<Self> {
        let mut store = Self {
            database,
            default_collection: None,
        };
        if let Some(name) = default_collection {
            store.default_collection = Some(store.get_collection(Some(name))?);
        }
        Ok(store)
    }

    /// Resolve a collection: the named one, else the default, else an error.
    pub fn get_collection(&self, name: Option<&str>) -> Result<CollectionHandle> {
        match (name, &self.default_collection) {
            (Some(name), _) if !name.is_empty() => Ok(self.database.collection(name)),
            (_, Some(default)) => Ok(Arc::clone(default)),
            _ => Err(Error::Configuration("no collection specified".to_string())),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.database.init().await
    }

    pub fn backend(&self) -> &'static str {
        self.database.backend()
    }
}
