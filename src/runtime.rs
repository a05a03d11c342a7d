//! Minimal container-runtime client for one worker host.
//!
//! Only the calls the gateway itself needs are implemented: a liveness ping
//! and a container listing for the admin surface. Container lifecycle
//! (launch, exec, commit) lives in a separate service.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime endpoint {endpoint}: {message}")]
    Endpoint { endpoint: String, message: String },
    #[error("runtime request {path} failed: {message}")]
    Transport { path: String, message: String },
    #[error("runtime returned {status} for {path}")]
    Status { path: String, status: StatusCode },
    #[error("runtime returned malformed JSON for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// HTTP client bound to one worker's runtime API.
#[derive(Clone)]
pub struct RuntimeClient {
    base: String,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl RuntimeClient {
    /// Build a client for `http://<host>:<port>`. Fails if that is not a
    /// valid URI authority; no connection is made yet.
    pub fn new(host: &str, port: u16) -> Result<Self, RuntimeError> {
        let base = format!("http://{host}:{port}");
        let uri: Uri = base.parse().map_err(|e: hyper::http::uri::InvalidUri| {
            RuntimeError::Endpoint {
                endpoint: base.clone(),
                message: e.to_string(),
            }
        })?;
        if uri.host().is_none_or(str::is_empty) {
            return Err(RuntimeError::Endpoint {
                endpoint: base,
                message: "missing host".to_string(),
            });
        }
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self { base, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.base
    }

    /// `GET /_ping`: true when the runtime answers 2xx.
    pub async fn ping(&self) -> Result<bool, RuntimeError> {
        let (status, _) = self.get("/_ping").await?;
        Ok(status.is_success())
    }

    /// `GET /containers/json`: running containers as reported by the runtime.
    pub async fn list_containers(&self) -> Result<Value, RuntimeError> {
        let path = "/containers/json";
        let (status, body) = self.get(path).await?;
        if !status.is_success() {
            return Err(RuntimeError::Status {
                path: path.to_string(),
                status,
            });
        }
        serde_json::from_slice(&body).map_err(|source| RuntimeError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), RuntimeError> {
        let transport = |message: String| RuntimeError::Transport {
            path: path.to_string(),
            message,
        };
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{path}", self.base))
            .body(Empty::<Bytes>::new())
            .map_err(|e| transport(e.to_string()))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}
