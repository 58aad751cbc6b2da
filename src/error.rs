use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CmgError {
    #[error("invalid materialid: {0}")]
    InvalidMaterialId(String),

    #[error("invalid PubChem CID: {0}")]
    InvalidCid(String),

    #[error("invalid group parameters: {0}")]
    InvalidParams(String),

    #[error("missing group definitions file params.json in project directory")]
    MissingConfig,

    #[error("failed to read group definitions at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse group definitions: {0}")]
    ConfigParse(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("stored data at {path} is corrupt: {reason}")]
    #[diagnostic(help("inspect or remove the file; it is never repaired automatically"))]
    StoreCorrupt { path: String, reason: String },

    #[error("structure search failed: {0}")]
    SearchFailed(String),

    #[error("property lookup failed for CID {cid}: {message}")]
    FetchFailed { cid: u64, message: String },

    #[error("PubChem request failed: {0}")]
    PubchemHttp(String),

    #[error("PubChem returned status {status}: {message}")]
    PubchemStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{failed} group(s) failed during the batch run")]
    BatchIncomplete { failed: usize },
}

impl CmgError {
    /// True for failures reported by (or on the way to) the remote service.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CmgError::SearchFailed(_)
                | CmgError::FetchFailed { .. }
                | CmgError::PubchemHttp(_)
                | CmgError::PubchemStatus { .. }
        )
    }
}
