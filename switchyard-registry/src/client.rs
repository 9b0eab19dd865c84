//! HTTP client for the registry wire interface.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::wire::{
    HeartbeatResponse, HeartbeatStatus, QueryResponse, RegisterRequest, RegisterResponse,
};
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};

/// Registry call failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The registry could not be reached, or the call timed out.
    #[error("registry transport error: {0}")]
    Transport(String),
    /// The registry answered with an unexpected status.
    #[error("registry returned status {0}")]
    Status(u16),
    /// The registry answered with a body the client cannot decode.
    #[error("invalid registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Client for one registry base URL.
///
/// Every call is bounded by its own timeout so registry hiccups never
/// inherit a caller's (potentially long) request deadline.
#[derive(Clone)]
pub struct RegistryClient {
    base: String,
    timeout: Duration,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl RegistryClient {
    /// Creates a client with the default 2 s per-call timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(2))
    }

    /// Creates a client with an explicit per-call timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            base,
            timeout,
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Registers an endpoint, returning its lease.
    pub async fn register(
        &self,
        service: &ServiceName,
        endpoint: &Endpoint,
    ) -> Result<RegisterResponse, ClientError> {
        let body = serde_json::to_vec(&RegisterRequest {
            endpoint: endpoint.clone(),
        })?;
        let (status, raw) = self
            .send(
                Method::POST,
                &format!("/services/{service}"),
                Bytes::from(body),
            )
            .await?;
        if status != StatusCode::OK {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Renews a lease.
    pub async fn heartbeat(&self, lease_id: &str) -> Result<HeartbeatStatus, ClientError> {
        let (status, raw) = self
            .send(Method::PUT, &format!("/leases/{lease_id}"), Bytes::new())
            .await?;
        if status != StatusCode::OK {
            return Err(ClientError::Status(status.as_u16()));
        }
        let response: HeartbeatResponse = serde_json::from_slice(&raw)?;
        Ok(response.status)
    }

    /// Releases a lease.
    pub async fn deregister(&self, lease_id: &str) -> Result<(), ClientError> {
        let (status, _) = self
            .send(Method::DELETE, &format!("/leases/{lease_id}"), Bytes::new())
            .await?;
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// Queries the live endpoints of a service.
    pub async fn query(&self, service: &ServiceName) -> Result<QueryResponse, ClientError> {
        let (status, raw) = self
            .send(Method::GET, &format!("/services/{service}"), Bytes::new())
            .await?;
        if status != StatusCode::OK {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Long-polls for a view newer than `after`.
    ///
    /// The registry holds the request open, so this call uses a stretched
    /// timeout rather than the client's per-call one.
    pub async fn watch(
        &self,
        service: &ServiceName,
        after: u64,
    ) -> Result<QueryResponse, ClientError> {
        let uri = format!("{}/services/{}/watch?after={}", self.base, service, after);
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let response = tokio::time::timeout(Duration::from_secs(30), self.http.request(request))
            .await
            .map_err(|_| ClientError::Transport("watch timed out".to_string()))?
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let status = response.status();
        let raw = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?
            .to_bytes();
        if status != StatusCode::OK {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let request = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base, path))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| ClientError::Transport("request timed out".to_string()))?
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let status = response.status();
        let raw = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?
            .to_bytes();
        Ok((status, raw))
    }
}
