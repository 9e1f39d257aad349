// =============================================================================
// error.rs - THINGS THAT GO WRONG BETWEEN THE CO-OP AND THE DATASTORE
// =============================================================================
//
// Source errors are about getting the page. Store errors are about putting
// the entry somewhere. Row-level trouble (no basis in the row) is not an
// error at all; it ends up in the skipped list.
// =============================================================================

use thiserror::Error;

use crate::models::SourceId;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no targets configured for source '{0}' (set {1}_TARGETS)")]
    NotConfigured(SourceId, &'static str),

    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} timed out after {secs}s")]
    NavigationTimeout { url: String, secs: u64 },

    #[error("browser error on {url}: {message}")]
    Browser { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("datastore returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("datastore response could not be decoded: {0}")]
    Decode(String),
}
