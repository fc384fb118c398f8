use std::sync::Arc;

use crate::Error;
use crate::adapters::{DbServer, DriverAdapter, adapter_for};
use crate::applier::{SchemaApplier, applier_for};
use crate::config::BuildConfig;
use crate::remote::RemoteBuild;
use crate::snapshots::SnapshotStore;

/// The collaborators a builder drives.
#[derive(Debug, Clone)]
pub struct BuildServices {
    pub adapter: Arc<dyn DriverAdapter>,
    pub snapshots: SnapshotStore,
    pub applier: Arc<dyn SchemaApplier>,
    pub remote: Option<Arc<dyn RemoteBuild>>,
}

impl BuildServices {
    /// Services for `config` using the built-in engine clients.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the engine has no built-in client.
    pub fn from_config(config: &BuildConfig) -> Result<Self, Error> {
        Self::assemble(config, None)
    }

    /// Services talking to the engine through `server`.
    pub fn with_server(config: &BuildConfig, server: Arc<dyn DbServer>) -> Result<Self, Error> {
        Self::assemble(config, Some(server))
    }

    fn assemble(config: &BuildConfig, server: Option<Arc<dyn DbServer>>) -> Result<Self, Error> {
        Ok(Self {
            adapter: adapter_for(config, server)?,
            snapshots: SnapshotStore::from_config(config),
            applier: applier_for(config),
            remote: None,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteBuild>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn SchemaApplier>) -> Self {
        self.applier = applier;
        self
    }
}
