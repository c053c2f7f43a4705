//! Fakes shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    DocumentId, FetchError, PageCountInfo, PageDecoder, PageNumber, PageTransport, RenderImage,
};

/// Serves pages `1..=pages`; anything past that is `NotFound`. Individual
/// responses can be overridden and individual pages held back behind a gate.
pub(crate) struct ScriptedTransport {
    pages: u32,
    announce_total: bool,
    overrides: Mutex<HashMap<PageNumber, Result<Bytes, FetchError>>>,
    gates: Mutex<HashMap<PageNumber, Arc<watch::Sender<bool>>>>,
    requests: Mutex<Vec<PageNumber>>,
    count_requests: Mutex<usize>,
}

impl ScriptedTransport {
    pub(crate) fn with_pages(pages: u32) -> Self {
        Self {
            pages,
            announce_total: true,
            overrides: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            count_requests: Mutex::new(0),
        }
    }

    /// Same pages, but the page-count endpoint is unsupported.
    pub(crate) fn without_count(pages: u32) -> Self {
        Self {
            announce_total: false,
            ..Self::with_pages(pages)
        }
    }

    pub(crate) fn respond(&self, page: PageNumber, response: Result<Bytes, FetchError>) {
        self.overrides.lock().insert(page, response);
    }

    /// Drops an override so `page` is served normally again.
    pub(crate) fn restore(&self, page: PageNumber) {
        self.overrides.lock().remove(&page);
    }

    /// Holds requests for `page` until the returned gate is opened.
    pub(crate) fn gate(&self, page: PageNumber) -> Gate {
        let tx = Arc::clone(
            self.gates
                .lock()
                .entry(page)
                .or_insert_with(|| Arc::new(watch::channel(false).0)),
        );
        Gate { tx }
    }

    pub(crate) fn requests(&self) -> Vec<PageNumber> {
        self.requests.lock().clone()
    }

    pub(crate) fn request_count(&self, page: PageNumber) -> usize {
        self.requests.lock().iter().filter(|&&p| p == page).count()
    }

    pub(crate) fn count_requests(&self) -> usize {
        *self.count_requests.lock()
    }
}

#[async_trait]
impl PageTransport for ScriptedTransport {
    async fn page_count(&self, _document: &DocumentId) -> Result<PageCountInfo, FetchError> {
        *self.count_requests.lock() += 1;
        if self.announce_total {
            Ok(PageCountInfo {
                total_pages: self.pages,
                format: "test".into(),
            })
        } else {
            Err(FetchError::Http {
                status: 501,
                message: "page count unsupported".into(),
            })
        }
    }

    async fn page_image(
        &self,
        _document: &DocumentId,
        page: PageNumber,
    ) -> Result<Bytes, FetchError> {
        self.requests.lock().push(page);
        let gate = self.gates.lock().get(&page).map(|tx| tx.subscribe());
        if let Some(mut opened) = gate {
            while !*opened.borrow_and_update() {
                if opened.changed().await.is_err() {
                    break;
                }
            }
        }
        if let Some(response) = self.overrides.lock().get(&page) {
            return response.clone();
        }
        if page >= 1 && page <= self.pages {
            Ok(Bytes::from(vec![page as u8, 0xAB, 0xCD]))
        } else {
            Err(FetchError::NotFound { page })
        }
    }
}

/// Latch that releases every held request for one page, now and later.
pub(crate) struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub(crate) fn open(&self) {
        self.tx.send_replace(true);
    }
}

/// Turns the first payload byte into a 1x1 pixel.
pub(crate) struct RawDecoder;

impl RawDecoder {
    pub(crate) const CORRUPT: &'static [u8] = b"corrupt";
}

impl PageDecoder for RawDecoder {
    fn decode(&self, page: PageNumber, payload: &[u8]) -> Result<RenderImage, FetchError> {
        if payload == Self::CORRUPT {
            return Err(FetchError::Decode {
                page,
                message: "not an image".into(),
            });
        }
        Ok(RenderImage {
            width: 1,
            height: 1,
            pixels: vec![payload[0], 0, 0, 255],
        })
    }
}
