//! Error taxonomy shared by the store adapter, ingestion pipeline and query
//! catalogue.
//!
//! Each variant maps to one propagation policy:
//!
//! | Variant | Raised by | Policy |
//! |---------|-----------|--------|
//! | [`Error::Configuration`] | store construction, collection resolution | fatal, returned immediately |
//! | [`Error::TransientIo`] | download, archive extraction | contained to one monthly period |
//! | [`Error::Transform`] | row normalization | row dropped and counted |
//! | [`Error::Persistence`] | bulk insert | logged, period continues |
//! | [`Error::Query`] | filters and pipelines | returned to the caller |

/// Library error type.
#[derive(Debug)]
pub enum Error {
    Configuration(String),
    TransientIo(String),
    Transform(String),
    Persistence(String),
    Query(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-friendly label for the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::TransientIo(_) => "transient_io",
            Error::Transform(_) => "transform",
            Error::Persistence(_) => "persistence",
            Error::Query(_) => "query",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Error::TransientIo(msg) => write!(f, "I/O error: {}", msg),
            Error::Transform(msg) => write!(f, "transform error: {}", msg),
            Error::Persistence(msg) => write!(f, "persistence error: {}", msg),
            Error::Query(msg) => write!(f, "query error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
