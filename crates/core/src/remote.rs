//! Remote build protocol: shared wire types and the client seam.

use std::fmt;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::config::BuildConfig;
use crate::hash::HashTriplet;
use crate::settings::ResolvedSettings;

/// Bumped on any incompatible change to the request or response shape.
pub const PROTOCOL_VERSION: u32 = 1;

pub const BUILD_PATH: &str = "/scenariodb/build";
pub const SCHEMA_PATH: &str = "/scenariodb/schema";

/// Error codes carried in [`ErrorResponse::code`].
pub mod codes {
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
    pub const BUILD_HASH_MISMATCH: &str = "BUILD_HASH_MISMATCH";
    pub const BUILD_FAILED: &str = "BUILD_FAILED";
    pub const HASHING_ERROR: &str = "HASHING_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Body of `POST /scenariodb/build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RemoteBuildRequest {
    pub protocol_version: u32,
    pub test_name: String,
    /// The requester's build hash; the remote refuses to build from a different checkout.
    pub build_hash: String,
    pub config: BuildConfig,
}

impl RemoteBuildRequest {
    pub fn new(config: &BuildConfig, test_name: &str, hashes: &HashTriplet) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            test_name: test_name.to_string(),
            build_hash: hashes.build_hash.clone(),
            config: BuildConfig { remote_build_url: None, ..config.clone() },
        }
    }
}

/// Structured error body returned by the remote instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Performs a whole build on another instance.
#[async_trait]
pub trait RemoteBuild: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// `RemoteBuildTimeout` when the remote does not answer in time,
    /// `RemoteShare` for protocol or payload problems, `BuildFailed` when the
    /// remote build itself failed.
    async fn build(&self, request: &RemoteBuildRequest) -> Result<ResolvedSettings, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_never_forwards_remote_url() {
        let config = BuildConfig { remote_build_url: Some("http://builder:8080".into()), ..Default::default() };
        let hashes = HashTriplet { build_hash: "b".repeat(32), snapshot_hash: "s".repeat(32), scenario_hash: "c".repeat(32) };
        let request = RemoteBuildRequest::new(&config, "checkout_test", &hashes);

        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert_eq!(request.build_hash, "b".repeat(32));
        assert!(request.config.remote_build_url.is_none());
    }

    #[test]
    fn test_request_json_shape() {
        let hashes = HashTriplet { build_hash: "b".into(), snapshot_hash: "s".into(), scenario_hash: "c".into() };
        let request = RemoteBuildRequest::new(&BuildConfig::default(), "t", &hashes);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["protocol_version"], 1);
        assert_eq!(value["config"]["driver"], "sqlite");
        let back: RemoteBuildRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }
}
