use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteMapError {
    #[error("Target is already patched")]
    AlreadyPatched,

    #[error("Anchor not found: no line contains {pattern:?}")]
    AnchorNotFound { pattern: String },

    #[error("No patch markers found")]
    NoMarkersFound,

    #[error("Corrupt patch markers: {start_markers} start marker(s), {end_markers} end marker(s)")]
    Corrupt {
        start_markers: usize,
        end_markers: usize,
    },

    #[error("Rollback is not supported for inline (replace-mode) patches")]
    UnsupportedRollback,

    #[error("Trace not found: {path}")]
    TraceNotFound { path: String },

    #[error("Hook already registered: {name}")]
    HookAlreadyRegistered { name: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<serde_json::Error> for RouteMapError {
    fn from(err: serde_json::Error) -> Self {
        RouteMapError::Serialization {
            source: Box::new(err),
        }
    }
}

impl From<csv::Error> for RouteMapError {
    fn from(err: csv::Error) -> Self {
        RouteMapError::Serialization {
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteMapError>;
