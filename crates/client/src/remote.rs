//! HTTP client for the remote build endpoint.
//!
//! ### Protocol
//!
//! - **Endpoint**: `POST {base}/scenariodb/build` with a JSON [`RemoteBuildRequest`].
//! - **Success**: `200` with the remote's [`ResolvedSettings`], used verbatim.
//! - **Failure**: a JSON [`ErrorResponse`] whose `code` decides the error class.
//! - **Timeout**: the whole request is bounded by `remote_timeout_ms`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;
use scenariodb_core::remote::{BUILD_PATH, ErrorResponse, RemoteBuild, RemoteBuildRequest};
use scenariodb_core::{BuildConfig, Error, ResolvedSettings};
use url::Url;

use crate::error::RemoteError;

const USER_AGENT: &str = concat!("scenariodb/", env!("CARGO_PKG_VERSION"));

/// Client for one remote build instance.
#[derive(Debug, Clone)]
pub struct RemoteBuildClient {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl RemoteBuildClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(format!("{base_url}: {e}")))?;
        let endpoint = base.join(BUILD_PATH).map_err(|e| RemoteError::InvalidUrl(format!("{base_url}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(Arc::new(e)))?;

        Ok(Self { http, endpoint, timeout })
    }

    /// Client for the instance named by `remote_build_url`.
    pub fn from_config(config: &BuildConfig) -> Result<Self, RemoteError> {
        let url = config
            .remote_build_url
            .as_deref()
            .ok_or_else(|| RemoteError::InvalidUrl("remote_build_url is not set".into()))?;
        Self::new(url, config.remote_timeout())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send one build request and decode the answer.
    pub async fn send(&self, request: &RemoteBuildRequest) -> Result<ResolvedSettings, RemoteError> {
        let start = Instant::now();
        tracing::debug!("requesting remote build: connection={} url={}", request.config.connection, self.endpoint);

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        tracing::debug!("remote build answered {} in {:?}", status, start.elapsed());

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(error) => RemoteError::refused(status.as_u16(), error),
                Err(_) => RemoteError::HttpError { status: status.as_u16() },
            });
        }

        ResolvedSettings::from_payload(&body).map_err(|e| RemoteError::Parse(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout.as_millis() as u64)
        } else {
            RemoteError::Network(Arc::new(err))
        }
    }
}

#[async_trait]
impl RemoteBuild for RemoteBuildClient {
    async fn build(&self, request: &RemoteBuildRequest) -> Result<ResolvedSettings, Error> {
        self.send(request).await.map_err(|e| match Error::from(e) {
            Error::BuildFailed { reason, .. } => Error::BuildFailed {
                connection: request.config.connection.clone(),
                driver: request.config.driver.to_string(),
                hashes: format!("build={}", request.build_hash),
                reason,
            },
            other => other,
        })
    }
}
