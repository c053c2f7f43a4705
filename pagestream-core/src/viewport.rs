//! The viewer state machine.
//!
//! `Idle → Loading → Ready ⇄ Navigating → Closed`. Navigations are
//! last-write-wins: each one takes a sequence number and only the newest
//! may change the anchor, the status text or the state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::{FetchError, ViewerError};
use crate::fetch::PageFetcher;
use crate::paging::{PagingPolicy, Spread};
use crate::prefetch::PrefetchScheduler;
use crate::resource::ResourceLedger;
use crate::session::Session;
use crate::{
    DocumentId, DocumentKind, NavCommand, PageNumber, PairingMode, RenderImage, SharedDecoder,
    SharedTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Idle,
    Loading,
    Ready,
    Navigating,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    Displayed(Spread),
    /// The target is the spread already shown, or cannot be computed yet.
    Unchanged,
    /// The document turned out to end before the target.
    ReachedEnd { total: u32 },
    /// A jump to a page that cannot exist; `total` is `None` while unknown.
    OutOfRange {
        page: PageNumber,
        total: Option<u32>,
    },
    Failed(FetchError),
    /// A newer navigation, a document switch or `close` replaced this one.
    Superseded,
    /// Navigation is not accepted while the document is still loading.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    StateChanged(ViewerState),
    StatusChanged(Option<String>),
    SpreadChanged(Spread),
    TotalPagesDiscovered(u32),
    Closed,
}

/// A scoped input subscription (key and wheel handlers) owned by the
/// controller for as long as a document is open.
pub trait InputBinding: Send {
    fn release(&mut self);
}

#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub state: ViewerState,
    pub spread: Option<Spread>,
    pub left: Option<Arc<RenderImage>>,
    pub right: Option<Arc<RenderImage>>,
    pub status: Option<String>,
    pub page_info: String,
}

struct Inner {
    state: ViewerState,
    session: Option<Arc<Session>>,
    prefetch: Option<Arc<PrefetchScheduler>>,
    mode: PairingMode,
    pinned_mode: Option<PairingMode>,
    total: Option<u32>,
    anchor: PageNumber,
    /// Anchor the newest navigation is heading to.
    pending: Option<PageNumber>,
    spread: Option<Spread>,
    status: Option<String>,
    foreground: Option<CancellationToken>,
    input: Option<Box<dyn InputBinding>>,
}

impl Inner {
    fn policy(&self) -> PagingPolicy {
        PagingPolicy::new(self.mode, self.total)
    }
}

struct Ticket {
    seq: u64,
    target: PageNumber,
    session: Arc<Session>,
    token: CancellationToken,
}

pub struct ViewportController {
    config: EngineConfig,
    fetcher: Arc<PageFetcher>,
    inner: Mutex<Inner>,
    nav_seq: AtomicU64,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

impl ViewportController {
    pub fn new(config: EngineConfig, transport: SharedTransport, decoder: SharedDecoder) -> Self {
        let fetcher = PageFetcher::new(transport, decoder, ResourceLedger::new());
        Self {
            inner: Mutex::new(Inner {
                state: ViewerState::Idle,
                session: None,
                prefetch: None,
                mode: config.pairing.unwrap_or(PairingMode::Single),
                pinned_mode: config.pairing,
                total: None,
                anchor: 1,
                pending: None,
                spread: None,
                status: None,
                foreground: None,
                input: None,
            }),
            config,
            fetcher: Arc::new(fetcher),
            nav_seq: AtomicU64::new(0),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn take_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.fetcher.ledger()
    }

    pub fn state(&self) -> ViewerState {
        self.inner.lock().state
    }

    pub fn anchor(&self) -> PageNumber {
        self.inner.lock().anchor
    }

    pub fn spread(&self) -> Option<Spread> {
        self.inner.lock().spread
    }

    pub fn total_pages(&self) -> Option<u32> {
        self.inner.lock().total
    }

    pub fn pairing_mode(&self) -> PairingMode {
        self.inner.lock().mode
    }

    pub fn status(&self) -> Option<String> {
        self.inner.lock().status.clone()
    }

    pub fn document(&self) -> Option<DocumentId> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|session| session.document().clone())
    }

    pub fn cached_pages(&self) -> Vec<PageNumber> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|session| session.cache().lock().pages())
            .unwrap_or_default()
    }

    /// "Page 4–5 of 120", "Page 1 of ?".
    pub fn page_info(&self) -> String {
        let inner = self.inner.lock();
        format_page_info(inner.spread, inner.total)
    }

    pub fn view(&self) -> ViewSnapshot {
        let inner = self.inner.lock();
        let image = |page: Option<PageNumber>| {
            let session = inner.session.as_ref()?;
            session.cache().lock().image(page?)
        };
        ViewSnapshot {
            state: inner.state,
            spread: inner.spread,
            left: image(inner.spread.map(|s| s.left)),
            right: image(inner.spread.and_then(|s| s.right)),
            status: inner.status.clone(),
            page_info: format_page_info(inner.spread, inner.total),
        }
    }

    /// Takes ownership of an input subscription; it is released on `close`
    /// or when replaced.
    pub fn attach_input(&self, binding: Box<dyn InputBinding>) {
        let previous = self.inner.lock().input.replace(binding);
        if let Some(mut previous) = previous {
            previous.release();
        }
    }

    /// Resolves once background prefetching for the open document is idle.
    pub async fn prefetch_idle(&self) {
        let prefetch = self.inner.lock().prefetch.clone();
        if let Some(prefetch) = prefetch {
            prefetch.wait_idle().await;
        }
    }

    #[instrument(skip(self, document), fields(document = %document))]
    pub async fn open(&self, document: DocumentId) -> Result<NavigationOutcome, ViewerError> {
        let kind = DocumentKind::detect(&document)
            .ok_or_else(|| ViewerError::UnsupportedDocument(document.to_string()))?;

        let ticket = {
            let mut inner = self.inner.lock();
            if inner.state == ViewerState::Closed {
                return Err(ViewerError::Closed);
            }
            self.teardown(&mut inner);

            let session = Arc::new(Session::new(document, kind));
            info!(session = %session.id(), ?kind, "opening document");
            inner.prefetch = Some(Arc::new(PrefetchScheduler::new(
                Arc::clone(&session),
                Arc::clone(&self.fetcher),
                self.config.prefetch_radius,
                self.config.cache_limit,
            )));
            inner.mode = inner
                .pinned_mode
                .unwrap_or_else(|| self.config.pairing_for(kind));
            inner.total = None;
            inner.anchor = 1;
            inner.pending = Some(1);
            let token = session.token().child();
            inner.foreground = Some(token.clone());
            inner.session = Some(Arc::clone(&session));
            self.set_state(&mut inner, ViewerState::Loading);
            self.set_status(&mut inner, Some("Loading document…".to_string()));
            Ticket {
                seq: self.nav_seq.fetch_add(1, Ordering::AcqRel) + 1,
                target: 1,
                session,
                token,
            }
        };

        let total = match self
            .fetcher
            .page_count(ticket.session.document(), &ticket.token)
            .await
        {
            Ok(info) => {
                debug!(total = info.total_pages, format = %info.format, "page count known");
                Some(info.total_pages)
            }
            Err(FetchError::Cancelled) => return Ok(NavigationOutcome::Superseded),
            Err(err) => {
                debug!(%err, "page count unavailable, total stays unknown");
                None
            }
        };

        {
            let mut inner = self.inner.lock();
            if !self.is_latest(ticket.seq) || ticket.token.is_cancelled() {
                return Ok(NavigationOutcome::Superseded);
            }
            if let Some(total) = total {
                inner.total = Some(total);
                self.push_event(ViewerEvent::TotalPagesDiscovered(total));
                if total == 0 {
                    return Ok(self.mark_empty(&mut inner));
                }
            }
            let spread = inner.policy().spread(1);
            self.set_status(&mut inner, Some(loading_message(spread)));
        }

        Ok(self.show(ticket).await)
    }

    #[instrument(skip(self))]
    pub async fn navigate(&self, command: NavCommand) -> Result<NavigationOutcome, ViewerError> {
        let ticket = {
            let mut inner = self.inner.lock();
            match inner.state {
                ViewerState::Ready | ViewerState::Navigating => {}
                ViewerState::Loading => return Ok(NavigationOutcome::Ignored),
                ViewerState::Idle => return Err(ViewerError::NoDocument),
                ViewerState::Closed => return Err(ViewerError::Closed),
            }
            if inner.total == Some(0) {
                return Ok(NavigationOutcome::Unchanged);
            }
            let policy = inner.policy();
            let base = inner.pending.unwrap_or(inner.anchor);
            // Nothing shown yet: stepping retries the anchor that failed.
            let retry = inner.spread.is_none() && inner.pending.is_none();
            let target = match command {
                NavCommand::Next | NavCommand::Previous if retry => base,
                NavCommand::Next => policy.next_anchor(base),
                NavCommand::Previous => policy.previous_anchor(base),
                NavCommand::First => policy.first_anchor(),
                NavCommand::Last => match policy.last_anchor() {
                    Some(anchor) => anchor,
                    None => return Ok(NavigationOutcome::Unchanged),
                },
                NavCommand::JumpTo(page) => {
                    if page == PageNumber::MAX || !policy.contains(page) {
                        let message = match inner.total {
                            Some(total) => format!("page {page} is out of range (1–{total})"),
                            None if page == 0 => "page numbers start at 1".to_string(),
                            None => format!("page {page} is out of range"),
                        };
                        self.set_status(&mut inner, Some(format!("Error: {message}")));
                        return Ok(NavigationOutcome::OutOfRange {
                            page,
                            total: inner.total,
                        });
                    }
                    policy.align(page)
                }
            };
            if target == base && (inner.pending.is_some() || inner.spread.is_some()) {
                return Ok(NavigationOutcome::Unchanged);
            }
            match self.begin(&mut inner, target) {
                Some(ticket) => ticket,
                None => return Err(ViewerError::NoDocument),
            }
        };
        Ok(self.show(ticket).await)
    }

    /// Switches pairing mode and re-aligns the current spread. The mode is
    /// kept for documents opened later.
    #[instrument(skip(self))]
    pub async fn set_pairing_mode(
        &self,
        mode: PairingMode,
    ) -> Result<NavigationOutcome, ViewerError> {
        let ticket = {
            let mut inner = self.inner.lock();
            if inner.state == ViewerState::Closed {
                return Err(ViewerError::Closed);
            }
            inner.pinned_mode = Some(mode);
            if inner.mode == mode {
                return Ok(NavigationOutcome::Unchanged);
            }
            inner.mode = mode;
            if !matches!(inner.state, ViewerState::Ready | ViewerState::Navigating) {
                return Ok(NavigationOutcome::Unchanged);
            }
            let base = inner.pending.unwrap_or(inner.anchor);
            let target = inner.policy().align(base);
            match self.begin(&mut inner, target) {
                Some(ticket) => ticket,
                None => return Ok(NavigationOutcome::Unchanged),
            }
        };
        Ok(self.show(ticket).await)
    }

    /// Cancels all outstanding work, releases every cached page and the
    /// input binding. Terminal and idempotent.
    #[instrument(skip(self))]
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ViewerState::Closed {
            return;
        }
        self.teardown(&mut inner);
        if let Some(mut input) = inner.input.take() {
            input.release();
        }
        self.set_state(&mut inner, ViewerState::Closed);
        self.push_event(ViewerEvent::Closed);
        info!("viewer closed");
    }

    fn teardown(&self, inner: &mut Inner) {
        self.nav_seq.fetch_add(1, Ordering::AcqRel);
        if let Some(token) = inner.foreground.take() {
            token.cancel();
        }
        if let Some(prefetch) = inner.prefetch.take() {
            prefetch.cancel();
        }
        if let Some(session) = inner.session.take() {
            session.close();
        }
        inner.spread = None;
        inner.pending = None;
        inner.total = None;
        if inner.status.is_some() {
            self.set_status(inner, None);
        }
    }

    /// Supersedes the current navigation and starts a new one to `target`.
    fn begin(&self, inner: &mut Inner, target: PageNumber) -> Option<Ticket> {
        let session = inner.session.clone()?;
        if let Some(previous) = inner.foreground.take() {
            previous.cancel();
        }
        let token = session.token().child();
        inner.foreground = Some(token.clone());
        inner.pending = Some(target);
        let seq = self.nav_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let spread = inner.policy().spread(target);
        self.set_state(inner, ViewerState::Navigating);
        self.set_status(inner, Some(loading_message(spread)));
        Some(Ticket {
            seq,
            target,
            session,
            token,
        })
    }

    /// Loads the spread for `ticket.target` (left page first) and applies it
    /// if the ticket is still the newest.
    async fn show(&self, ticket: Ticket) -> NavigationOutcome {
        let policy = self.inner.lock().policy();
        let server_error_ends = self.config.server_error_ends(ticket.session.kind());
        let mut spread = policy.spread(ticket.target);

        if let Err(err) = ticket
            .session
            .ensure_page(&self.fetcher, spread.left, &ticket.token)
            .await
        {
            return self.fail(&ticket, spread.left, err, policy, server_error_ends);
        }

        let mut discovered = None;
        if let Some(right) = spread.right {
            match ticket
                .session
                .ensure_page(&self.fetcher, right, &ticket.token)
                .await
            {
                Ok(()) => {}
                Err(err)
                    if policy.total().is_none() && err.is_end_of_document(server_error_ends) =>
                {
                    debug!(page = right, "right page is past the end");
                    spread.right = None;
                    discovered = Some(right - 1);
                }
                Err(err) => return self.fail(&ticket, right, err, policy, server_error_ends),
            }
        }

        self.commit(&ticket, spread, discovered)
    }

    fn commit(
        &self,
        ticket: &Ticket,
        spread: Spread,
        discovered: Option<u32>,
    ) -> NavigationOutcome {
        let mut inner = self.inner.lock();
        if !self.is_latest(ticket.seq) || ticket.token.is_cancelled() {
            return NavigationOutcome::Superseded;
        }
        if let Some(total) = discovered {
            inner.total = Some(total);
            self.push_event(ViewerEvent::TotalPagesDiscovered(total));
        }
        inner.anchor = spread.left;
        inner.spread = Some(spread);
        inner.pending = None;
        self.push_event(ViewerEvent::SpreadChanged(spread));
        self.set_status(&mut inner, None);
        self.set_state(&mut inner, ViewerState::Ready);

        if let Some(limit) = self.config.cache_limit {
            ticket.session.cache().lock().trim_around(spread.left, limit);
        }
        let policy = inner.policy();
        if let Some(prefetch) = inner.prefetch.as_ref() {
            prefetch.schedule(spread.left, &policy);
        }
        debug!(left = spread.left, right = ?spread.right, "spread displayed");
        NavigationOutcome::Displayed(spread)
    }

    fn fail(
        &self,
        ticket: &Ticket,
        page: PageNumber,
        err: FetchError,
        policy: PagingPolicy,
        server_error_ends: bool,
    ) -> NavigationOutcome {
        let mut inner = self.inner.lock();
        if err.is_cancelled() || !self.is_latest(ticket.seq) || ticket.token.is_cancelled() {
            return NavigationOutcome::Superseded;
        }
        inner.pending = None;

        if policy.total().is_none() && err.is_end_of_document(server_error_ends) {
            let total = page - 1;
            info!(total, "end of document inferred");
            inner.total = Some(total);
            self.push_event(ViewerEvent::TotalPagesDiscovered(total));
            if total == 0 {
                return self.mark_empty(&mut inner);
            }
            self.set_status(&mut inner, None);
            self.set_state(&mut inner, ViewerState::Ready);
            return NavigationOutcome::ReachedEnd { total };
        }

        warn!(page, %err, "page load failed");
        self.set_status(&mut inner, Some(format!("Error: {err}")));
        self.set_state(&mut inner, ViewerState::Ready);
        NavigationOutcome::Failed(err)
    }

    fn mark_empty(&self, inner: &mut Inner) -> NavigationOutcome {
        inner.spread = None;
        inner.pending = None;
        self.set_status(inner, Some("Document has no pages".to_string()));
        self.set_state(inner, ViewerState::Ready);
        NavigationOutcome::ReachedEnd { total: 0 }
    }

    fn is_latest(&self, seq: u64) -> bool {
        self.nav_seq.load(Ordering::Acquire) == seq
    }

    fn set_state(&self, inner: &mut Inner, state: ViewerState) {
        if inner.state != state {
            inner.state = state;
            self.push_event(ViewerEvent::StateChanged(state));
        }
    }

    fn set_status(&self, inner: &mut Inner, status: Option<String>) {
        if inner.status != status {
            inner.status = status.clone();
            self.push_event(ViewerEvent::StatusChanged(status));
        }
    }

    fn push_event(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }
}

impl Drop for ViewportController {
    fn drop(&mut self) {
        self.close();
    }
}

fn loading_message(spread: Spread) -> String {
    match spread.right {
        Some(right) => format!("Loading pages {}–{}…", spread.left, right),
        None => format!("Loading page {}…", spread.left),
    }
}

fn format_page_info(spread: Option<Spread>, total: Option<u32>) -> String {
    let total = total.map_or_else(|| "?".to_string(), |t| t.to_string());
    match spread {
        Some(Spread {
            left,
            right: Some(right),
        }) => format!("Page {left}–{right} of {total}"),
        Some(Spread { left, right: None }) => format!("Page {left} of {total}"),
        None => format!("No page of {total}"),
    }
}
