//! Transports performing one delivery attempt.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{DeliveryError, DeliveryRequest, DeliveryResult, TransportResponse};

/// Performs a single attempt. Timeouts are the transport's concern and
/// surface as [`DeliveryError::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> DeliveryResult<TransportResponse>;
}

/// Posts the request as JSON to a fixed endpoint.
///
/// Any non-2xx status is an error carrying the status and response body.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> DeliveryResult<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(DeliveryError::InvalidEndpoint(format!(
                "unsupported scheme: {}",
                endpoint.scheme()
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            headers: Vec::new(),
        })
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &DeliveryRequest) -> DeliveryResult<TransportResponse> {
        debug!(
            url = %self.endpoint,
            destination = %request.destination,
            events = request.events.len(),
            "Sending events"
        );

        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_types::{DestinationId, Event, EventData};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers one request with `status_line` and `body`, returning what it read.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/collect", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&received).to_string()
        });

        (url, handle)
    }

    fn request() -> DeliveryRequest {
        DeliveryRequest::new(
            DestinationId::from("collect"),
            vec![Event::new("page_view", EventData::new())],
        )
    }

    #[test]
    fn test_rejects_invalid_endpoints() {
        assert!(matches!(
            HttpTransport::new("not a url", Duration::from_secs(1)),
            Err(DeliveryError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpTransport::new("ftp://example.com", Duration::from_secs(1)),
            Err(DeliveryError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_posts_json_and_parses_body() {
        let (url, server) = serve_once("HTTP/1.1 200 OK", r#"{"accepted":1}"#).await;
        let transport = HttpTransport::new(&url, Duration::from_secs(5))
            .unwrap()
            .with_header("x-api-key", "secret");

        let response = transport.send(&request()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Some(serde_json::json!({"accepted": 1})));

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /collect"));
        assert!(received.to_ascii_lowercase().contains("x-api-key: secret"));
        assert!(received.contains("\"page_view\""));
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable", "busy").await;
        let transport = HttpTransport::new(&url, Duration::from_secs(5)).unwrap();

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Status {
                status: 503,
                body: "busy".to_string()
            }
        );
        assert!(err.is_retryable());
        server.await.unwrap();
    }
}
