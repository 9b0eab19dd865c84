//! External configuration providers.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use switchyard_core::error::GatewayError;

/// A key-value configuration source consulted at startup and by the
/// change watcher.
///
/// Every failure is reported as [`GatewayError::ConfigUnavailable`]; the
/// adapter fails open around it.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Fetches the current value for `key`.
    async fn get(&self, key: &str) -> Result<serde_json::Value, GatewayError>;
}

/// HTTP provider: `GET {base}/config/{key}` returning a JSON document.
#[derive(Clone)]
pub struct HttpConfigProvider {
    base: String,
    timeout: Duration,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl HttpConfigProvider {
    /// Creates a provider for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            base,
            timeout: Duration::from_secs(2),
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn get(&self, key: &str) -> Result<serde_json::Value, GatewayError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/config/{}", self.base, key))
            .body(Full::new(Bytes::new()))
            .map_err(|err| GatewayError::ConfigUnavailable(err.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| GatewayError::ConfigUnavailable("request timed out".to_string()))?
            .map_err(|err| GatewayError::ConfigUnavailable(err.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(GatewayError::ConfigUnavailable(format!(
                "provider returned status {}",
                response.status()
            )));
        }

        let raw = response
            .into_body()
            .collect()
            .await
            .map_err(|err| GatewayError::ConfigUnavailable(err.to_string()))?
            .to_bytes();
        serde_json::from_slice(&raw).map_err(|err| GatewayError::ConfigUnavailable(err.to_string()))
    }
}
