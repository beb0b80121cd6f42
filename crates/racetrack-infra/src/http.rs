//! Minimal HTTP client helpers built on hyper.
//!
//! Backends talk to job servers and remote gateways with plain HTTP/1.1
//! over TCP, one connection per request.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::{InfraError, InfraResult};

/// Response captured from a single HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> InfraResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| InfraError::Http(format!("invalid JSON response: {e}")))
    }

    /// Body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issue a GET request and capture the full response.
pub async fn http_get(
    url: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> InfraResult<HttpResponse> {
    request(url, "GET", None, headers, timeout).await
}

/// POST a JSON value and capture the full response.
pub async fn http_post_json(
    url: &str,
    body: &serde_json::Value,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> InfraResult<HttpResponse> {
    let payload = serde_json::to_vec(body)
        .map_err(|e| InfraError::Http(format!("failed to encode request body: {e}")))?;
    request(url, "POST", Some(Bytes::from(payload)), headers, timeout).await
}

/// Issue a DELETE request and capture the full response.
pub async fn http_delete(
    url: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> InfraResult<HttpResponse> {
    request(url, "DELETE", None, headers, timeout).await
}

async fn request(
    url: &str,
    method: &str,
    body: Option<Bytes>,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> InfraResult<HttpResponse> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| InfraError::Http(format!("invalid url {url}: {e}")))?;
    let authority = uri
        .authority()
        .ok_or_else(|| InfraError::Http(format!("url {url} has no authority")))?
        .clone();
    let address = match authority.port_u16() {
        Some(port) => format!("{}:{port}", authority.host()),
        None => format!("{}:80", authority.host()),
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| InfraError::Http(format!("connecting to {address}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| InfraError::Http(format!("handshake with {address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(url)
            .header("host", authority.as_str())
            .header("user-agent", "racetrack/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .body(match body {
                Some(bytes) => Full::new(bytes).boxed(),
                None => Empty::<Bytes>::new().boxed(),
            })
            .map_err(|e| InfraError::Http(format!("building request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| InfraError::Http(format!("request to {url}: {e}")))?;
        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| InfraError::Http(format!("reading response from {url}: {e}")))?
            .to_bytes();

        Ok(HttpResponse { status, body })
    })
    .await;

    match result {
        Ok(resp) => resp,
        Err(_) => {
            debug!(%url, "http request timed out");
            Err(InfraError::Http(format!("request to {url} timed out")))
        }
    }
}
