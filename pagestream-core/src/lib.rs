use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod paging;
pub mod prefetch;
pub mod resource;
pub mod session;
pub mod viewport;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::PageCache;
pub use cancel::CancellationToken;
pub use config::{EngineConfig, TransportConfig, ViewerConfig};
pub use error::{FetchError, ViewerError};
pub use fetch::PageFetcher;
pub use paging::{PagingPolicy, Spread};
pub use prefetch::PrefetchScheduler;
pub use resource::{HandleId, PageResource, ResourceLedger};
pub use session::Session;
pub use viewport::{
    InputBinding, NavigationOutcome, ViewSnapshot, ViewerEvent, ViewerState, ViewportController,
};

/// 1-based page number inside a document.
pub type PageNumber = u32;

/// Opaque document identity (a server-side path). Passed verbatim to every
/// endpoint; encoding is the transport's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        Path::new(&self.0)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingMode {
    Single,
    #[serde(alias = "double")]
    DoubleContiguous,
    #[serde(alias = "cover")]
    DoubleCover,
}

impl PairingMode {
    pub fn is_double(self) -> bool {
        !matches!(self, PairingMode::Single)
    }

    /// Order used by the `p` key in the terminal front end.
    pub fn cycle(self) -> Self {
        match self {
            PairingMode::Single => PairingMode::DoubleContiguous,
            PairingMode::DoubleContiguous => PairingMode::DoubleCover,
            PairingMode::DoubleCover => PairingMode::Single,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PairingMode::Single => "single",
            PairingMode::DoubleContiguous => "double",
            PairingMode::DoubleCover => "cover",
        }
    }
}

/// The closed set of paginated document kinds the engine can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Comic,
    Pdf,
}

impl DocumentKind {
    pub fn detect(document: &DocumentId) -> Option<Self> {
        let ext = Path::new(document.as_str())
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "cbz" | "cbr" | "cb7" | "cbt" | "zip" | "rar" | "7z" => Some(DocumentKind::Comic),
            "pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }

    pub fn default_pairing(self) -> PairingMode {
        match self {
            DocumentKind::Comic => PairingMode::DoubleCover,
            DocumentKind::Pdf => PairingMode::Single,
        }
    }

    /// Comic archives may never learn their length up front; the end is
    /// found when a page fetch fails.
    pub fn server_error_may_end(self) -> bool {
        matches!(self, DocumentKind::Comic)
    }

    pub fn endpoint_prefix(self) -> &'static str {
        match self {
            DocumentKind::Comic => "comic",
            DocumentKind::Pdf => "pdf",
        }
    }
}

/// Decoded RGBA8 page image, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Answer of the page-count endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCountInfo {
    pub total_pages: u32,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavCommand {
    Previous,
    Next,
    First,
    Last,
    JumpTo(PageNumber),
}

/// The two collaborator endpoints the engine consumes.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn page_count(&self, document: &DocumentId) -> Result<PageCountInfo, FetchError>;

    /// Issues exactly one request for the raw bytes of `page`.
    async fn page_image(&self, document: &DocumentId, page: PageNumber)
        -> Result<Bytes, FetchError>;
}

pub trait PageDecoder: Send + Sync {
    fn decode(&self, page: PageNumber, payload: &[u8]) -> Result<RenderImage, FetchError>;
}

pub type SharedTransport = Arc<dyn PageTransport>;
pub type SharedDecoder = Arc<dyn PageDecoder>;
