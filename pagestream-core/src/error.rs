use thiserror::Error;

use crate::PageNumber;

/// Outcome of a failed page or page-count request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request was abandoned because its token was cancelled. Callers
    /// treat this as a no-op.
    #[error("request cancelled")]
    Cancelled,
    #[error("page {page} not found")]
    NotFound { page: PageNumber },
    #[error("server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("page {page} returned an empty payload")]
    EmptyPayload { page: PageNumber },
    #[error("failed to decode page {page}: {message}")]
    Decode { page: PageNumber, message: String },
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    /// Whether this failure, for a document of unknown length, means the
    /// requested page lies past the end. A bare HTTP 500 only counts when
    /// `server_error_ends` is set.
    pub fn is_end_of_document(&self, server_error_ends: bool) -> bool {
        match self {
            FetchError::NotFound { .. } => true,
            FetchError::Http { status: 500, .. } => server_error_ends,
            _ => false,
        }
    }
}

/// Errors returned by controller entry points themselves, as opposed to the
/// per-page failures reported through status text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("no document is open")]
    NoDocument,
    #[error("viewer has been closed")]
    Closed,
    #[error("unsupported document type: {0}")]
    UnsupportedDocument(String),
}
