//! Remote lookup over HTTP
//!
//! Posts the fragment JPEG to a configured endpoint and decodes an
//! [`InfoRecord`] from the JSON response.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{ImageFragment, InfoLookup, InfoRecord, LookupError, LookupHandle, LookupResult};

/// Lookup backed by a remote identification endpoint
#[derive(Debug, Clone)]
pub struct HttpInfoLookup {
    client: Client,
    endpoint: String,
}

impl HttpInfoLookup {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Service(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl InfoLookup for HttpInfoLookup {
    fn lookup(&self, fragment: ImageFragment) -> LookupHandle {
        let (handle, resolver) = LookupHandle::channel();
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let cancel = handle.cancel_token();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("HTTP lookup to {} cancelled", endpoint);
                    return;
                }
                result = request(&client, &endpoint, fragment) => result,
            };
            if let Err(e) = &result {
                warn!("HTTP lookup to {} failed: {}", endpoint, e);
            }
            resolver.resolve(result);
        });

        handle
    }
}

async fn request(client: &Client, endpoint: &str, fragment: ImageFragment) -> LookupResult {
    if fragment.is_empty() {
        return Err(LookupError::NoDataFound);
    }

    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "image/jpeg")
        .query(&[("width", fragment.width), ("height", fragment.height)])
        .body(fragment.bytes)
        .send()
        .await
        .map_err(classify)?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(LookupError::NoDataFound);
    }
    if !status.is_success() {
        return Err(LookupError::Service(format!(
            "lookup failed with status {status}"
        )));
    }

    let body = response.bytes().await.map_err(classify)?;
    serde_json::from_slice::<InfoRecord>(&body)
        .map_err(|e| LookupError::Service(format!("invalid lookup response: {e}")))
}

fn classify(error: reqwest::Error) -> LookupError {
    if error.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Service(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response after reading the full request
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let headers = format!(
                "content-type: application/json\r\ncontent-length: {}\r\nconnection: close",
                body.len()
            );
            let response = format!("{status_line}\r\n{headers}\r\n\r\n{body}");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}/identify")
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn fragment() -> ImageFragment {
        ImageFragment::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 40, 30)
    }

    #[tokio::test]
    async fn test_success_decodes_record() {
        let body = r#"{"title":"Basel Dove","origin":"Switzerland","source_urls":["a","b"]}"#;
        let url = serve_once("HTTP/1.1 200 OK", body).await;
        let lookup = HttpInfoLookup::new(url, Duration::from_secs(5)).unwrap();

        let record = lookup.lookup(fragment()).outcome().await.unwrap().unwrap();
        assert_eq!(record.title, "Basel Dove");
        assert_eq!(record.origin.as_deref(), Some("Switzerland"));
        assert_eq!(record.source_urls, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_not_found_maps_to_no_data() {
        let url = serve_once("HTTP/1.1 404 Not Found", "{}").await;
        let lookup = HttpInfoLookup::new(url, Duration::from_secs(5)).unwrap();

        let outcome = lookup.lookup(fragment()).outcome().await;
        assert_eq!(outcome, Some(Err(LookupError::NoDataFound)));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_service() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error", "{}").await;
        let lookup = HttpInfoLookup::new(url, Duration::from_secs(5)).unwrap();

        let outcome = lookup.lookup(fragment()).outcome().await;
        assert!(matches!(outcome, Some(Err(LookupError::Service(_)))));
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_service() {
        let url = serve_once("HTTP/1.1 200 OK", "not json").await;
        let lookup = HttpInfoLookup::new(url, Duration::from_secs(5)).unwrap();

        let outcome = lookup.lookup(fragment()).outcome().await;
        assert!(matches!(outcome, Some(Err(LookupError::Service(_)))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/identify", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let lookup = HttpInfoLookup::new(url, Duration::from_millis(100)).unwrap();

        let outcome = lookup.lookup(fragment()).outcome().await;
        assert_eq!(outcome, Some(Err(LookupError::Timeout)));
    }

    #[tokio::test]
    async fn test_empty_fragment_skips_request() {
        let lookup =
            HttpInfoLookup::new("http://127.0.0.1:9/identify", Duration::from_secs(1)).unwrap();

        let outcome = lookup.lookup(ImageFragment::default()).outcome().await;
        assert_eq!(outcome, Some(Err(LookupError::NoDataFound)));
    }
}
