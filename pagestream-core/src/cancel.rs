//! Cooperative cancellation tokens.
//!
//! A token can be polled with [`CancellationToken::is_cancelled`] or awaited
//! with [`CancellationToken::cancelled`]. Child tokens observe their parent's
//! cancellation, so closing a session stops every navigation and prefetch
//! derived from it.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancellationToken {
    own: Arc<watch::Sender<bool>>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            parent: None,
        }
    }

    /// Creates a token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        let mut child = Self::new();
        child.parent = Some(Box::new(self.clone()));
        child
    }

    /// Idempotent; all clones observe the cancellation.
    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.own.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut token = self;
        let mut receivers = Vec::new();
        loop {
            receivers.push(token.own.subscribe());
            match token.parent.as_deref() {
                Some(parent) => token = parent,
                None => break,
            }
        }

        loop {
            if receivers.iter().any(|rx| *rx.borrow()) {
                return;
            }
            let changes: Vec<_> = receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.changed()))
                .collect();
            // A sender is owned by the token itself, so `changed` only
            // completes when a value is sent.
            let _ = first_completed(changes).await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

async fn first_completed<F: Future>(mut futures: Vec<Pin<Box<F>>>) -> F::Output {
    future::poll_fn(move |cx| {
        for fut in futures.iter_mut() {
            if let Poll::Ready(out) = fut.as_mut().poll(cx) {
                return Poll::Ready(out);
            }
        }
        Poll::Pending
    })
    .await
}
