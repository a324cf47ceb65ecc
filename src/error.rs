use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StormsightError {
    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    #[error("invalid item id: {0}")]
    InvalidItemId(String),

    #[error("invalid phase: {0} (expected pre, post or any)")]
    InvalidPhase(String),

    #[error("invalid asset role: {0}")]
    InvalidRole(String),

    #[error("invalid filter criteria: {0}")]
    InvalidCriteria(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no catalog url: pass --catalog or set catalog_url in stormsight.json")]
    MissingCatalogUrl,

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("parse error at {node}: {message}")]
    Parse { node: String, message: String },

    #[error("event not found in catalog: {0}")]
    EventNotFound(String),

    #[error("item not found in event: {0}")]
    ItemNotFound(String),

    #[error("no asset with role {role} on item {item}")]
    AssetNotFound { item: String, role: String },

    #[error("asset unreachable at {url}: {reason}")]
    UnreachableAsset { url: String, reason: String },

    #[error("unsupported asset format at {url}: {media_type}")]
    UnsupportedFormat { url: String, media_type: String },

    #[error("range read failed for {url}: {reason}")]
    RangeRead { url: String, reason: RangeReadReason },

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("checksum mismatch for {item}: expected {expected}, got {actual}")]
    Integrity {
        item: String,
        expected: String,
        actual: String,
    },

    #[error("no download task with id {0}")]
    TaskNotFound(u64),

    #[error("task {id} is {state}; cannot {action}")]
    TaskTransition {
        id: u64,
        state: String,
        action: String,
    },

    #[error("downloads did not settle within {0} seconds")]
    DownloadStalled(u64),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeReadReason {
    #[error("access expired")]
    Expired,

    #[error("http status {0}")]
    Http(u16),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server ignored the range request")]
    RangesUnsupported,

    #[error("tile {0} outside the tile grid")]
    TileOutOfRange(String),

    #[error("short range response: got {got} of {wanted} bytes")]
    Truncated { got: u64, wanted: u64 },
}

impl StormsightError {
    /// Network-class failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StormsightError::CatalogHttp(_) | StormsightError::DownloadHttp(_) => true,
            StormsightError::CatalogStatus { status, .. }
            | StormsightError::DownloadStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
