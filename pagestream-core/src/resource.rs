//! Owned page handles and the ledger that accounts for them.
//!
//! Every [`PageResource`] holds a lease on a [`ResourceLedger`]. The lease is
//! returned exactly once, when the resource is released or dropped, so the
//! ledger always reports how many page payloads are alive and how many bytes
//! they retain.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::{PageNumber, RenderImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

#[derive(Debug, Default)]
struct LedgerInner {
    next_id: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
    retained_bytes: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    inner: Arc<LedgerInner>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    pub fn retained_bytes(&self) -> usize {
        self.inner.retained_bytes.load(Ordering::Acquire)
    }

    fn lease(&self, bytes: usize) -> Lease {
        let id = HandleId(self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1);
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        self.inner.retained_bytes.fetch_add(bytes, Ordering::AcqRel);
        Lease {
            ledger: Arc::clone(&self.inner),
            id,
            bytes,
        }
    }
}

#[derive(Debug)]
struct Lease {
    ledger: Arc<LedgerInner>,
    id: HandleId,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::AcqRel);
        self.ledger
            .retained_bytes
            .fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A fetched page: its raw payload plus the decoded display form.
///
/// Not `Clone`: the payload handle has exactly one owner, normally the page
/// cache. The decoded image is shared with the display surface through an
/// `Arc`.
#[derive(Debug)]
pub struct PageResource {
    page: PageNumber,
    payload: Bytes,
    image: Arc<RenderImage>,
    lease: Lease,
}

impl PageResource {
    pub fn new(
        ledger: &ResourceLedger,
        page: PageNumber,
        payload: Bytes,
        image: RenderImage,
    ) -> Self {
        let lease = ledger.lease(payload.len() + image.byte_len());
        Self {
            page,
            payload,
            image: Arc::new(image),
            lease,
        }
    }

    pub fn page(&self) -> PageNumber {
        self.page
    }

    pub fn handle_id(&self) -> HandleId {
        self.lease.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn image(&self) -> Arc<RenderImage> {
        Arc::clone(&self.image)
    }

    pub fn retained_bytes(&self) -> usize {
        self.lease.bytes
    }

    /// Releases the handle now.
    pub fn release(self) {
        trace!(page = self.page, handle = self.lease.id.0, "releasing page resource");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> RenderImage {
        RenderImage {
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0, 255],
        }
    }

    #[test]
    fn ledger_tracks_acquire_and_release() {
        let ledger = ResourceLedger::new();
        let first = PageResource::new(&ledger, 1, Bytes::from_static(b"abc"), image());
        let second = PageResource::new(&ledger, 2, Bytes::from_static(b"de"), image());
        assert_ne!(first.handle_id(), second.handle_id());
        assert_eq!(ledger.live(), 2);
        assert_eq!(ledger.retained_bytes(), 3 + 4 + 2 + 4);

        first.release();
        assert_eq!(ledger.released(), 1);
        assert_eq!(ledger.retained_bytes(), 2 + 4);

        drop(second);
        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.retained_bytes(), 0);
    }

    #[test]
    fn decoded_image_outlives_released_handle() {
        let ledger = ResourceLedger::new();
        let resource = PageResource::new(&ledger, 3, Bytes::from_static(b"x"), image());
        let shown = resource.image();
        resource.release();
        assert_eq!(ledger.live(), 0);
        assert_eq!(shown.width, 1);
    }
}
