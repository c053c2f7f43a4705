//! One open document: its cache, its in-flight requests and the token that
//! ends them all.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::PageCache;
use crate::cancel::CancellationToken;
use crate::error::FetchError;
use crate::fetch::PageFetcher;
use crate::resource::PageResource;
use crate::{DocumentId, DocumentKind, PageNumber};

pub struct Session {
    id: Uuid,
    document: DocumentId,
    kind: DocumentKind,
    token: CancellationToken,
    cache: Mutex<PageCache>,
    in_flight: Mutex<HashMap<PageNumber, watch::Sender<bool>>>,
}

/// Result of trying to become the single fetcher of a page.
pub enum Claim<'a> {
    Acquired(InFlightGuard<'a>),
    /// Another request is already fetching the page; the receiver changes
    /// when it finishes, successfully or not.
    Pending(watch::Receiver<bool>),
    Cached,
}

/// Marks a page as in flight until dropped.
pub struct InFlightGuard<'a> {
    session: &'a Session,
    page: PageNumber,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(done) = self.session.in_flight.lock().remove(&self.page) {
            done.send_replace(true);
        }
    }
}

impl Session {
    pub fn new(document: DocumentId, kind: DocumentKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            document,
            kind,
            token: CancellationToken::new(),
            cache: Mutex::new(PageCache::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cache(&self) -> &Mutex<PageCache> {
        &self.cache
    }

    pub fn is_cached(&self, page: PageNumber) -> bool {
        self.cache.lock().has(page)
    }

    pub fn is_in_flight(&self, page: PageNumber) -> bool {
        self.in_flight.lock().contains_key(&page)
    }

    pub fn claim(&self, page: PageNumber) -> Claim<'_> {
        // Lock order: in-flight set, then cache. The owner stores before it
        // leaves the in-flight set, so a page is always seen in one of them.
        let mut in_flight = self.in_flight.lock();
        if self.cache.lock().has(page) {
            return Claim::Cached;
        }
        if let Some(done) = in_flight.get(&page) {
            return Claim::Pending(done.subscribe());
        }
        let (done, _rx) = watch::channel(false);
        in_flight.insert(page, done);
        Claim::Acquired(InFlightGuard {
            session: self,
            page,
        })
    }

    /// Stores a fetched page unless `token` (or the session) was cancelled
    /// in the meantime, in which case the resource is released instead.
    pub fn store(
        &self,
        page: PageNumber,
        resource: PageResource,
        token: &CancellationToken,
    ) -> Result<(), FetchError> {
        let mut cache = self.cache.lock();
        if token.is_cancelled() || self.token.is_cancelled() {
            drop(cache);
            trace!(page, "dropping page fetched for a cancelled request");
            resource.release();
            return Err(FetchError::Cancelled);
        }
        cache.put(page, resource);
        Ok(())
    }

    /// Makes sure `page` is cached, fetching it at most once across all
    /// concurrent callers. Waits for another caller's fetch rather than
    /// issuing a duplicate; retries itself if that fetch failed.
    pub async fn ensure_page(
        &self,
        fetcher: &PageFetcher,
        page: PageNumber,
        token: &CancellationToken,
    ) -> Result<(), FetchError> {
        loop {
            if token.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.claim(page) {
                Claim::Cached => return Ok(()),
                Claim::Pending(mut done) => {
                    debug!(page, "waiting for in-flight request");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(FetchError::Cancelled),
                        _ = done.changed() => continue,
                    }
                }
                Claim::Acquired(guard) => {
                    let result = fetcher.fetch(&self.document, page, token).await;
                    let stored = result.and_then(|resource| self.store(page, resource, token));
                    drop(guard);
                    return stored;
                }
            }
        }
    }

    /// Cancels all work derived from this session and releases the cache.
    /// Idempotent.
    pub fn close(&self) {
        self.token.cancel();
        self.cache.lock().clear();
        debug!(session = %self.id, document = %self.document, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::resource::ResourceLedger;
    use crate::testing::{RawDecoder, ScriptedTransport};

    fn setup(pages: u32) -> (Arc<ScriptedTransport>, PageFetcher, Session) {
        let transport = Arc::new(ScriptedTransport::with_pages(pages));
        let fetcher = PageFetcher::new(
            transport.clone(),
            Arc::new(RawDecoder),
            ResourceLedger::new(),
        );
        let session = Session::new(DocumentId::from("book.cbz"), DocumentKind::Comic);
        (transport, fetcher, session)
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_page_issue_a_single_fetch() {
        let (transport, fetcher, session) = setup(5);
        let gate = transport.gate(2);
        let token = CancellationToken::new();

        let first = session.ensure_page(&fetcher, 2, &token);
        let second = session.ensure_page(&fetcher, 2, &token);
        let release = async {
            tokio::task::yield_now().await;
            gate.open();
        };
        let (a, b, ()) = tokio::join!(first, second, release);
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(transport.request_count(2), 1);
        assert!(session.is_cached(2));
        assert!(!session.is_in_flight(2));
    }

    #[tokio::test]
    async fn waiter_retries_when_the_owner_is_cancelled() {
        let (transport, fetcher, session) = setup(5);
        let gate = transport.gate(3);
        let owner_token = CancellationToken::new();
        let waiter_token = CancellationToken::new();

        let owner = session.ensure_page(&fetcher, 3, &owner_token);
        let waiter = session.ensure_page(&fetcher, 3, &waiter_token);
        let cancel = async {
            tokio::task::yield_now().await;
            owner_token.cancel();
            gate.open();
        };
        let (a, b, ()) = tokio::join!(owner, waiter, cancel);
        assert_eq!(a.unwrap_err(), FetchError::Cancelled);
        assert!(b.is_ok());
        assert!(session.is_cached(3));
        assert_eq!(transport.request_count(3), 2);
    }

    #[tokio::test]
    async fn nothing_is_stored_after_close() {
        let (_transport, fetcher, session) = setup(5);
        let token = session.token().child();
        let resource = fetcher
            .fetch(session.document(), 1, &CancellationToken::new())
            .await
            .unwrap();
        session.close();
        assert_eq!(
            session.store(1, resource, &token).unwrap_err(),
            FetchError::Cancelled
        );
        assert!(session.cache().lock().is_empty());
        assert_eq!(fetcher.ledger().live(), 0);
        session.close();
    }
}
