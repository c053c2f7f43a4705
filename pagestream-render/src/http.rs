use std::io::Read;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagestream_core::{
    DocumentId, DocumentKind, FetchError, PageCountInfo, PageNumber, PageTransport,
    TransportConfig,
};
use tracing::{debug, instrument};
use ureq::{Agent, AgentBuilder, Error as UreqError};
use url::Url;

/// Page server client. `ureq` is blocking, so every request runs on the
/// blocking pool; a cancelled caller simply stops waiting for it.
#[derive(Clone)]
pub struct HttpTransport {
    agent: Agent,
    base: Url,
    max_page_bytes: u64,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let base = Url::parse(config.server.trim())
            .with_context(|| format!("invalid server URL {:?}", config.server))?;
        let mut builder = AgentBuilder::new().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            agent: builder.build(),
            base,
            max_page_bytes: config.max_page_bytes,
        })
    }

    /// `{server}/api/{comic|pdf}/{action}?path=…[&page=N]`.
    pub fn endpoint(
        &self,
        document: &DocumentId,
        action: &str,
        page: Option<PageNumber>,
    ) -> Result<Url, FetchError> {
        let kind = DocumentKind::detect(document).ok_or_else(|| {
            FetchError::Transport(format!("no endpoint serves {}", document.file_name()))
        })?;
        let mut url = self.base.clone();
        let path = format!(
            "{}/api/{}/{}",
            self.base.path().trim_end_matches('/'),
            kind.endpoint_prefix(),
            action
        );
        url.set_path(&path);
        {
            let mut query = url.query_pairs_mut();
            query.clear().append_pair("path", document.as_str());
            if let Some(page) = page {
                query.append_pair("page", &page.to_string());
            }
        }
        Ok(url)
    }

    async fn get(&self, url: Url, page: Option<PageNumber>) -> Result<Vec<u8>, FetchError> {
        let agent = self.agent.clone();
        let limit = self.max_page_bytes;
        tokio::task::spawn_blocking(move || get_blocking(&agent, &url, page, limit))
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?
    }
}

#[async_trait]
impl PageTransport for HttpTransport {
    #[instrument(skip(self, document), fields(document = %document))]
    async fn page_count(&self, document: &DocumentId) -> Result<PageCountInfo, FetchError> {
        let url = self.endpoint(document, "info", None)?;
        let body = self.get(url, None).await?;
        serde_json::from_slice(&body)
            .map_err(|err| FetchError::Transport(format!("invalid page count response: {err}")))
    }

    #[instrument(skip(self, document), fields(document = %document))]
    async fn page_image(
        &self,
        document: &DocumentId,
        page: PageNumber,
    ) -> Result<Bytes, FetchError> {
        let url = self.endpoint(document, "page", Some(page))?;
        let body = self.get(url, Some(page)).await?;
        debug!(page, bytes = body.len(), "page payload received");
        Ok(Bytes::from(body))
    }
}

fn get_blocking(
    agent: &Agent,
    url: &Url,
    page: Option<PageNumber>,
    limit: u64,
) -> Result<Vec<u8>, FetchError> {
    let response = match agent.get(url.as_str()).call() {
        Ok(response) => response,
        Err(UreqError::Status(status, response)) => {
            let message = response
                .into_string()
                .ok()
                .map(|body| body.trim().to_string())
                .filter(|body| !body.is_empty())
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(status_error(status, message, page));
        }
        Err(UreqError::Transport(err)) => return Err(FetchError::Transport(err.to_string())),
    };

    let mut body = Vec::new();
    response
        .into_reader()
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|err| FetchError::Transport(err.to_string()))?;
    if body.len() as u64 > limit {
        return Err(FetchError::Transport(format!(
            "response body exceeds {limit} bytes"
        )));
    }
    Ok(body)
}

fn status_error(status: u16, message: String, page: Option<PageNumber>) -> FetchError {
    match (status, page) {
        (404 | 416, Some(page)) => FetchError::NotFound { page },
        _ => FetchError::Http { status, message },
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn transport(server: &str, max_page_bytes: u64) -> HttpTransport {
        HttpTransport::new(&TransportConfig {
            server: server.to_string(),
            timeout: Some(Duration::from_secs(5)),
            max_page_bytes,
        })
        .unwrap()
    }

    /// Answers `responses` in order, one connection each, and reports every
    /// request line.
    fn serve(responses: Vec<(u16, Vec<u8>)>) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                }
                tx.send(request_line.trim().to_string()).unwrap();
                let head = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
            }
        });
        (address, rx)
    }

    #[test]
    fn endpoint_encodes_the_document_path() {
        let transport = transport("http://pages.local:3000/", 1024);
        let url = transport
            .endpoint(&DocumentId::from("shelf/Vol 1 & 2.cbz"), "page", Some(7))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://pages.local:3000/api/comic/page?path=shelf%2FVol+1+%26+2.cbz&page=7"
        );

        let info = transport
            .endpoint(&DocumentId::from("papers/report.pdf"), "info", None)
            .unwrap();
        assert_eq!(
            info.as_str(),
            "http://pages.local:3000/api/pdf/info?path=papers%2Freport.pdf"
        );
    }

    #[test]
    fn endpoint_keeps_a_base_path_prefix() {
        let transport = transport("http://host/reader", 1024);
        let url = transport
            .endpoint(&DocumentId::from("a.pdf"), "info", None)
            .unwrap();
        assert_eq!(url.path(), "/reader/api/pdf/info");
    }

    #[test]
    fn unknown_document_kinds_have_no_endpoint() {
        let transport = transport("http://host", 1024);
        let err = transport
            .endpoint(&DocumentId::from("notes.txt"), "info", None)
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[test]
    fn invalid_server_url_is_rejected() {
        let result = HttpTransport::new(&TransportConfig {
            server: "not a url".into(),
            ..TransportConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn status_codes_map_to_fetch_errors() {
        assert_eq!(
            status_error(404, "missing".into(), Some(3)),
            FetchError::NotFound { page: 3 }
        );
        assert_eq!(
            status_error(416, "range".into(), Some(9)),
            FetchError::NotFound { page: 9 }
        );
        assert_eq!(
            status_error(500, "boom".into(), Some(3)),
            FetchError::Http {
                status: 500,
                message: "boom".into()
            }
        );
        assert!(matches!(
            status_error(404, String::new(), None),
            FetchError::Http { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn fetches_page_bytes_and_page_count() {
        let (server, requests) = serve(vec![
            (200, br#"{"totalPages":12,"format":"cbz"}"#.to_vec()),
            (200, vec![1, 2, 3, 4]),
        ]);
        let transport = transport(&server, 1024);
        let document = DocumentId::from("book.cbz");

        let info = transport.page_count(&document).await.unwrap();
        assert_eq!(info.total_pages, 12);
        assert_eq!(info.format, "cbz");
        let page = transport.page_image(&document, 2).await.unwrap();
        assert_eq!(&page[..], &[1, 2, 3, 4]);

        assert_eq!(
            requests.recv().unwrap(),
            "GET /api/comic/info?path=book.cbz HTTP/1.1"
        );
        assert_eq!(
            requests.recv().unwrap(),
            "GET /api/comic/page?path=book.cbz&page=2 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn missing_page_is_not_found() {
        let (server, _requests) = serve(vec![(404, b"no such page".to_vec())]);
        let transport = transport(&server, 1024);
        let err = transport
            .page_image(&DocumentId::from("book.cbz"), 40)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotFound { page: 40 });
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let (server, _requests) = serve(vec![(500, b"archive exhausted".to_vec())]);
        let transport = transport(&server, 1024);
        let err = transport
            .page_image(&DocumentId::from("book.cbr"), 5)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Http {
                status: 500,
                message: "archive exhausted".into()
            }
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (server, _requests) = serve(vec![(200, vec![0; 64])]);
        let transport = transport(&server, 16);
        let err = transport
            .page_image(&DocumentId::from("a.pdf"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(message) if message.contains("16 bytes")));
    }

    #[tokio::test]
    async fn malformed_page_count_is_a_transport_error() {
        let (server, _requests) = serve(vec![(200, b"<html>".to_vec())]);
        let transport = transport(&server, 1024);
        let err = transport
            .page_count(&DocumentId::from("a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }
}
