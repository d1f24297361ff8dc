//! Upstream HTTP plumbing: the cached reverse-proxy target and the
//! readiness probe used after on-demand starts.

use axum::body::Body;
use axum::http::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Reverse-proxy target for one instance, keyed by its host:port.
///
/// Cached on the instance and invalidated whenever the options change, so
/// the next request rebinds to the possibly-new address.
#[derive(Clone)]
pub struct ProxyTarget {
    authority: String,
    client: Client<HttpConnector, Body>,
}

impl ProxyTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            authority: format!("{}:{}", host, port),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Forward a request to the upstream, preserving headers and streaming
    /// the response body through without buffering.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
    ) -> Result<Response<Body>, hyper_util::client::legacy::Error> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        let uri: Uri = format!("http://{}{}", self.authority, path_and_query)
            .parse()
            .expect("valid proxy URI");

        *req.uri_mut() = uri;
        req.headers_mut().remove("host");

        let resp = self.client.request(req).await?;
        let (parts, body) = resp.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Probe an upstream readiness endpoint once.
///
/// Returns `Ok(true)` on a 2xx response, `Ok(false)` on any other status,
/// and `Err` on connection failure or timeout.
pub async fn probe_ready(
    host: &str,
    port: u16,
    path: &str,
    timeout: Duration,
) -> Result<bool, String> {
    use http_body_util::Empty;

    let client: Client<_, Empty<bytes::Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    let uri: Uri = format!("http://{}:{}{}", host, port, path)
        .parse()
        .map_err(|e| format!("Invalid URL: {}", e))?;

    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| format!("Failed to build request: {}", e))?;

    match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => Ok(response.status().is_success()),
        Ok(Err(e)) => Err(format!("Request failed: {}", e)),
        Err(_) => Err("Probe timeout".to_string()),
    }
}
