//! Core types and shared functionality for scenariodb.
//!
//! This crate provides:
//! - Build configuration and the content-fingerprint hasher
//! - Per-engine driver adapters and the reuse-metadata table
//! - The on-disk snapshot store
//! - The database builder state machine and the stale purger
//! - Unified error types

pub mod adapters;
pub mod applier;
pub mod builder;
pub mod config;
pub mod dump;
pub mod error;
pub mod hash;
pub mod meta;
pub mod purge;
pub mod remote;
pub mod reuse;
pub mod run;
pub mod settings;
pub mod snapshots;

pub use adapters::{DbServer, DriverAdapter, ReuseSession};
pub use builder::{BuildPath, BuildServices, BuildState, DatabaseBuilder};
pub use config::{BuildConfig, Driver, SnapshotMode};
pub use error::Error;
pub use hash::{HashTriplet, ScenarioHasher};
pub use meta::{DatabaseMetaInfo, SnapshotMetaInfo};
pub use purge::{PurgeGate, PurgeReport, StalePurger};
pub use remote::RemoteBuild;
pub use run::{ConnectionDatabases, TestRun};
pub use settings::ResolvedSettings;
pub use snapshots::SnapshotStore;
