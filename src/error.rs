use std::fmt;

use axum::http::StatusCode;

/// Terminal failures of the ingestion pipeline. Every variant maps to one
/// HTTP status; no partial or degraded result is ever returned alongside one.
#[derive(Debug)]
pub enum PipelineError {
    /// Missing local file or archive member.
    NotFound(String),
    /// Upload transfer cap or decompression ceiling exceeded.
    PayloadTooLarge(String),
    /// No parse branch produced tabular rows.
    UnsupportedFormat(String),
    /// Archive contained no readable tabular member.
    UnsupportedArchiveContents(String),
    /// Gzip/zip structure could not be read.
    InvalidArchive(String),
    /// Document parsed as JSON but held no array of row objects.
    NoTabularData(String),
    /// Remote fetch failed; `status` is the upstream HTTP status when the
    /// server answered at all.
    Fetch { status: Option<u16>, message: String },
    /// Remote fetch exceeded the request deadline.
    Timeout(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            PipelineError::UnsupportedArchiveContents(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PipelineError::InvalidArchive(_) => StatusCode::BAD_REQUEST,
            PipelineError::NoTabularData(_) => StatusCode::BAD_REQUEST,
            PipelineError::Fetch { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            PipelineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NotFound(m) => write!(f, "not found: {m}"),
            PipelineError::PayloadTooLarge(m) => write!(f, "payload too large: {m}"),
            PipelineError::UnsupportedFormat(m) => write!(f, "unsupported format: {m}"),
            PipelineError::UnsupportedArchiveContents(m) => {
                write!(f, "unsupported archive contents: {m}")
            }
            PipelineError::InvalidArchive(m) => write!(f, "invalid archive: {m}"),
            PipelineError::NoTabularData(m) => write!(f, "no tabular data found: {m}"),
            PipelineError::Fetch {
                status: Some(s),
                message,
            } => write!(f, "fetch failed (upstream {s}): {message}"),
            PipelineError::Fetch {
                status: None,
                message,
            } => write!(f, "fetch failed: {message}"),
            PipelineError::Timeout(m) => write!(f, "timed out: {m}"),
        }
    }
}

impl std::error::Error for PipelineError {}

pub type PipelineResult<T> = Result<T, PipelineError>;
