use async_trait::async_trait;
use std::time::Duration;

use crate::models::HttpMethod;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP layer. Transient failures are worth another attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

// --- reqwest ---

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sqlbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Patch => self.client.patch(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .timeout(request.timeout)
            .body(request.body.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

/// reqwest's own message hides the hyper and io causes, so the whole source
/// chain is folded into the text before classifying.
fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    let mut message = format!("HTTP request failed: {}", e);
    let mut cause = std::error::Error::source(&e);
    while let Some(inner) = cause {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        cause = inner.source();
    }

    if e.is_timeout() || e.is_connect() || e.is_request() || is_transient_message(&message) {
        TransportError::Transient(message)
    } else {
        TransportError::Fatal(message)
    }
}

/// Reset, aborted and unreachable failures surface only through the error text.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "timed out",
        "timeout",
        "connection reset",
        "reset by peer",
        "connection aborted",
        "connection closed",
        "incomplete message",
        "unexpected eof",
        "broken pipe",
        "host unreachable",
        "network unreachable",
        "connection refused",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_message("error sending request: Connection reset by peer"));
        assert!(is_transient_message("No route to host: Host unreachable (os error 113)"));
        assert!(is_transient_message(
            "error sending request: connection closed before message completed"
        ));
        assert!(!is_transient_message("builder error: relative URL without a base"));
    }

    #[tokio::test]
    async fn test_dropped_socket_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            drop(socket);
        });

        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: format!("http://{}/x", addr),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: "[]".to_string(),
            timeout: Duration::from_secs(5),
        };

        let result = transport.send(&request).await;
        server.await.unwrap();
        assert!(matches!(result, Err(TransportError::Transient(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest {
            method: HttpMethod::Put,
            url: format!("http://{}/x", addr),
            headers: Vec::new(),
            body: String::new(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            transport.send(&request).await,
            Err(TransportError::Transient(_))
        ));
    }

    #[test]
    fn test_success_range() {
        assert!(HttpResponse { status: 204, body: String::new() }.is_success());
        assert!(!HttpResponse { status: 302, body: String::new() }.is_success());
    }
}
