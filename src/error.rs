use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OttError {
    #[error("invalid taxon id: {0}")]
    InvalidTaxonId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("tree download failed: {0}")]
    #[diagnostic(help("delete the cached tree file and run again to force a fresh download"))]
    TreeDownload(String),

    #[error("malformed Newick tree at byte {offset}: {message}")]
    TreeParse { offset: usize, message: String },

    #[error("OTT request failed: {0}")]
    OttHttp(String),

    #[error("OTT returned status {status}: {message}")]
    OttStatus { status: u16, message: String },

    #[error("unexpected OTT response: {0}")]
    OttResponse(String),

    #[error("taxon store error: {0}")]
    Store(String),

    #[error("taxon store has not been loaded yet")]
    #[diagnostic(help("run `ott-enricher load` first"))]
    StoreNotInitialized,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to install signal handler: {0}")]
    Signal(String),

    #[error("interrupted; progress is saved and the run can be resumed")]
    Interrupted,
}

impl From<rusqlite::Error> for OttError {
    fn from(err: rusqlite::Error) -> Self {
        OttError::Store(err.to_string())
    }
}

impl OttError {
    /// Remote failures leave the store consistent, so a re-run resumes.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            OttError::OttHttp(_) | OttError::OttStatus { .. } | OttError::OttResponse(_)
        )
    }
}
