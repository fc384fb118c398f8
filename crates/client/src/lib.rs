//! Client code for scenariodb.
//!
//! This crate provides the HTTP client that delegates database builds to a
//! remote scenariodb instance.

pub mod error;
pub mod remote;

pub use error::RemoteError;
pub use remote::RemoteBuildClient;
