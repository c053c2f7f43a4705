//! Background prefetching around the visible spread.
//!
//! One scheduler exists per session. Pages are fetched one at a time by a
//! single drain task so the foreground request never competes with more
//! than one background request. With a cache limit the neighbourhood is
//! clamped to the room left beside the visible spread, and the cache is
//! trimmed around the latest anchor after every stored page.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::FetchError;
use crate::fetch::PageFetcher;
use crate::paging::{PagingPolicy, Spread};
use crate::session::{Claim, Session};
use crate::PageNumber;

#[derive(Debug, Default)]
struct QueueState {
    pages: VecDeque<PageNumber>,
    anchor: PageNumber,
    draining: bool,
}

pub struct PrefetchScheduler {
    session: Arc<Session>,
    fetcher: Arc<PageFetcher>,
    token: CancellationToken,
    radius: u32,
    cache_limit: Option<usize>,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<watch::Sender<bool>>,
}

impl PrefetchScheduler {
    pub fn new(
        session: Arc<Session>,
        fetcher: Arc<PageFetcher>,
        radius: u32,
        cache_limit: Option<usize>,
    ) -> Self {
        let token = session.token().child();
        Self {
            session,
            fetcher,
            token,
            radius,
            cache_limit,
            state: Arc::new(Mutex::new(QueueState::default())),
            idle: Arc::new(watch::channel(true).0),
        }
    }

    /// Pages worth having around `anchor`: `radius` pages on each side of
    /// the visible spread, widened to whole spreads, nearest first and
    /// forward before backward.
    pub fn neighborhood(anchor: PageNumber, policy: &PagingPolicy, radius: u32) -> Vec<PageNumber> {
        if radius == 0 {
            return Vec::new();
        }
        let visible = policy.spread(anchor);
        let start = visible.left.saturating_sub(radius).max(1);
        let end = visible.last().saturating_add(radius);

        let mut pages = Vec::new();
        for page in start..=end {
            if !policy.contains(page) {
                continue;
            }
            for partner in policy.spread(page).pages() {
                if policy.contains(partner) && !visible.contains(partner) && !pages.contains(&partner)
                {
                    pages.push(partner);
                }
            }
        }
        pages.sort_by_key(|&page| priority(page, &visible));
        pages
    }

    /// Queues the missing neighbours of `anchor` and makes sure a drain task
    /// is running. Returns the queue length.
    pub fn schedule(&self, anchor: PageNumber, policy: &PagingPolicy) -> usize {
        if self.token.is_cancelled() {
            return 0;
        }
        let visible = policy.spread(anchor);
        let wanted = Self::neighborhood(anchor, policy, self.radius);
        let keep_within = self.radius.saturating_mul(2);

        let mut state = self.state.lock();
        let mut pages: Vec<PageNumber> = wanted;
        for &queued in &state.pages {
            if !pages.contains(&queued)
                && policy.contains(queued)
                && !visible.contains(queued)
                && distance(queued, &visible) <= keep_within
            {
                pages.push(queued);
            }
        }
        pages.sort_by_key(|&page| priority(page, &visible));
        if let Some(limit) = self.cache_limit {
            pages.truncate(limit.saturating_sub(visible.pages().count()));
        }
        pages.retain(|&page| !self.session.is_cached(page) && !self.session.is_in_flight(page));
        state.pages = pages.into();
        state.anchor = visible.left;

        let queued = state.pages.len();
        debug!(anchor, queued, "prefetch scheduled");
        if queued > 0 && !state.draining {
            state.draining = true;
            self.idle.send_replace(false);
            tokio::spawn(drain(
                Arc::clone(&self.session),
                Arc::clone(&self.fetcher),
                self.token.clone(),
                Arc::clone(&self.state),
                Arc::clone(&self.idle),
                self.cache_limit,
            ));
        }
        queued
    }

    pub fn pending(&self) -> Vec<PageNumber> {
        self.state.lock().pages.iter().copied().collect()
    }

    /// Stops the drain task and discards queued pages.
    pub fn cancel(&self) {
        self.token.cancel();
        self.state.lock().pages.clear();
    }

    /// Resolves once no drain task is running.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        while !*idle.borrow_and_update() {
            if idle.changed().await.is_err() {
                break;
            }
        }
    }
}

fn distance(page: PageNumber, visible: &Spread) -> u32 {
    if page > visible.last() {
        page - visible.last()
    } else {
        visible.left.saturating_sub(page)
    }
}

fn priority(page: PageNumber, visible: &Spread) -> (u32, bool) {
    (distance(page, visible), page < visible.left)
}

async fn drain(
    session: Arc<Session>,
    fetcher: Arc<PageFetcher>,
    token: CancellationToken,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<watch::Sender<bool>>,
    cache_limit: Option<usize>,
) {
    loop {
        let next = {
            let mut state = state.lock();
            if token.is_cancelled() {
                state.pages.clear();
            }
            match state.pages.pop_front() {
                Some(page) => page,
                None => {
                    state.draining = false;
                    idle.send_replace(true);
                    return;
                }
            }
        };

        let guard = match session.claim(next) {
            Claim::Acquired(guard) => guard,
            Claim::Cached | Claim::Pending(_) => continue,
        };
        let result = fetcher
            .fetch(session.document(), next, &token)
            .await
            .and_then(|resource| session.store(next, resource, &token));
        drop(guard);

        if let (Ok(()), Some(limit)) = (&result, cache_limit) {
            let anchor = state.lock().anchor;
            session.cache().lock().trim_around(anchor, limit);
        }
        match result {
            Ok(()) => debug!(page = next, "prefetched page"),
            Err(FetchError::Cancelled) => {}
            Err(err @ FetchError::NotFound { .. }) => {
                debug!(page = next, %err, "prefetch past end of document")
            }
            Err(err) => warn!(page = next, %err, "prefetch failed"),
        }
    }
}
