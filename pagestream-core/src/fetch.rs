use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cancel::CancellationToken;
use crate::error::FetchError;
use crate::resource::{PageResource, ResourceLedger};
use crate::{DocumentId, PageCountInfo, PageNumber, SharedDecoder, SharedTransport};

/// Fetches and decodes single pages, honouring cancellation at every step.
///
/// The fetcher never touches a cache; storing the result is the caller's
/// job.
pub struct PageFetcher {
    transport: SharedTransport,
    decoder: SharedDecoder,
    ledger: ResourceLedger,
}

impl PageFetcher {
    pub fn new(transport: SharedTransport, decoder: SharedDecoder, ledger: ResourceLedger) -> Self {
        Self {
            transport,
            decoder,
            ledger,
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    #[instrument(skip(self, document, token), fields(document = %document))]
    pub async fn page_count(
        &self,
        document: &DocumentId,
        token: &CancellationToken,
    ) -> Result<PageCountInfo, FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let info = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            info = self.transport.page_count(document) => info?,
        };
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(info)
    }

    #[instrument(skip(self, document, token), fields(document = %document))]
    pub async fn fetch(
        &self,
        document: &DocumentId,
        page: PageNumber,
        token: &CancellationToken,
    ) -> Result<PageResource, FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(page, "page request abandoned");
                return Err(FetchError::Cancelled);
            }
            payload = self.transport.page_image(document, page) => payload?,
        };
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if payload.is_empty() {
            return Err(FetchError::EmptyPayload { page });
        }

        let decoder = Arc::clone(&self.decoder);
        let raw = payload.clone();
        let image = tokio::task::spawn_blocking(move || decoder.decode(page, &raw))
            .await
            .map_err(|err| FetchError::Decode {
                page,
                message: err.to_string(),
            })??;

        let resource = PageResource::new(&self.ledger, page, payload, image);
        if token.is_cancelled() {
            resource.release();
            return Err(FetchError::Cancelled);
        }
        debug!(page, bytes = resource.retained_bytes(), "page fetched");
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RawDecoder, ScriptedTransport};

    fn fetcher(transport: Arc<ScriptedTransport>) -> PageFetcher {
        PageFetcher::new(transport, Arc::new(RawDecoder), ResourceLedger::new())
    }

    #[tokio::test]
    async fn fetch_returns_decoded_resource() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        let fetcher = fetcher(transport.clone());
        let token = CancellationToken::new();
        let resource = fetcher
            .fetch(&DocumentId::from("a.cbz"), 2, &token)
            .await
            .unwrap();
        assert_eq!(resource.page(), 2);
        assert_eq!(resource.image().pixels[0], 2);
        assert_eq!(transport.requests(), vec![2]);
        assert_eq!(fetcher.ledger().live(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_request() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        let fetcher = fetcher(transport.clone());
        let token = CancellationToken::new();
        token.cancel();
        let err = fetcher
            .fetch(&DocumentId::from("a.cbz"), 1, &token)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Cancelled);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_flight_returns_cancelled_without_leaking() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        let gate = transport.gate(1);
        let fetcher = fetcher(transport.clone());
        let token = CancellationToken::new();
        let document = DocumentId::from("a.cbz");

        let fetch = fetcher.fetch(&document, 1, &token);
        let cancel = async {
            tokio::task::yield_now().await;
            token.cancel();
            gate.open();
        };
        let (result, ()) = tokio::join!(fetch, cancel);
        assert_eq!(result.unwrap_err(), FetchError::Cancelled);
        assert_eq!(fetcher.ledger().live(), 0);
    }

    #[tokio::test]
    async fn empty_payload_is_an_error() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        transport.respond(2, Ok(bytes::Bytes::new()));
        let fetcher = fetcher(transport);
        let err = fetcher
            .fetch(&DocumentId::from("a.pdf"), 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::EmptyPayload { page: 2 });
    }

    #[tokio::test]
    async fn http_failure_is_passed_through() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        transport.respond(
            1,
            Err(FetchError::Http {
                status: 503,
                message: "busy".into(),
            }),
        );
        let fetcher = fetcher(transport);
        let err = fetcher
            .fetch(&DocumentId::from("a.pdf"), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn decode_failure_is_reported() {
        let transport = Arc::new(ScriptedTransport::with_pages(3));
        transport.respond(3, Ok(bytes::Bytes::from_static(RawDecoder::CORRUPT)));
        let fetcher = fetcher(transport);
        let err = fetcher
            .fetch(&DocumentId::from("a.pdf"), 3, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { page: 3, .. }));
        assert_eq!(fetcher.ledger().live(), 0);
    }
}
