//! Remote build server for scenariodb.
//!
//! Test processes that cannot reach a database engine directly post their
//! build configuration here; this instance builds the database in its own
//! checkout and answers with the resolved settings.

pub mod config;
pub mod error;
pub mod handler;
pub mod locks;

pub use config::ServerConfig;
pub use error::ApiError;
pub use handler::{AppState, router};
