//! Remote build server configuration.

use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use scenariodb_core::BuildConfig;
use serde::{Deserialize, Serialize};

/// Settings of the remote build instance.
///
/// Connection overrides replace whatever the requester sent: the requester
/// knows how *it* reaches the engine, the server knows how the server does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Checkout the relative paths of incoming configs are resolved against.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Storage directory used instead of the requester's.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            project_root: default_project_root(),
            host: None,
            port: None,
            username: None,
            password: None,
            storage_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load from `SCENARIODB_SERVER_CONFIG_FILE` (TOML) and `SCENARIODB_SERVER_*` variables.
    pub fn load() -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Ok(path) = std::env::var("SCENARIODB_SERVER_CONFIG_FILE") {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SCENARIODB_SERVER_").ignore(&["config_file"])).extract()
    }

    /// The configuration this instance actually builds with.
    pub fn localize(&self, config: BuildConfig) -> BuildConfig {
        let mut config = config.rooted_at(&self.project_root);
        config.remote_build_url = None;
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(storage_dir) = &self.storage_dir {
            config.storage_dir = storage_dir.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_localize_roots_paths_and_overrides_credentials() {
        let server = ServerConfig {
            project_root: PathBuf::from("/srv/app"),
            host: Some("db.internal".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let incoming = BuildConfig {
            host: Some("localhost".into()),
            username: Some("ci".into()),
            migrations_path: Some(PathBuf::from("database/migrations")),
            remote_build_url: Some("http://builder:7878".into()),
            ..Default::default()
        };

        let local = server.localize(incoming);
        assert_eq!(local.host.as_deref(), Some("db.internal"));
        assert_eq!(local.username.as_deref(), Some("ci"));
        assert_eq!(local.password.as_deref(), Some("secret"));
        assert_eq!(local.migrations_path.as_deref(), Some(Path::new("/srv/app/database/migrations")));
        assert!(local.remote_build_url.is_none());
    }

    #[test]
    fn test_load_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SCENARIODB_SERVER_BIND", "0.0.0.0:9000");
            jail.set_env("SCENARIODB_SERVER_PROJECT_ROOT", "/srv/app");
            jail.set_env("SCENARIODB_SERVER_PORT", "6543");

            let config = ServerConfig::load()?;
            assert_eq!(config.bind, "0.0.0.0:9000");
            assert_eq!(config.project_root, PathBuf::from("/srv/app"));
            assert_eq!(config.port, Some(6543));
            assert!(config.host.is_none());
            Ok(())
        });
    }
}
