//! Layered settings: built-in defaults, then `Fleetnet.toml`, then `FLEETNET_` variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::binary::ArtifactSettings;
use crate::fleet::FleetRunner;
use crate::node_manager::NodeManagerSettings;
use crate::remote::RetryPolicy;
use crate::state::StateStoreSettings;
use crate::topology::PortBase;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "Fleetnet.toml";

/// Prefix of environment variable overrides. Nested keys are separated by `__`,
/// e.g. `FLEETNET_STATE__BUCKET`.
pub const ENV_PREFIX: &str = "FLEETNET_";

/// Tool-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub state: StateStoreSettings,
    pub artifacts: ArtifactSettings,
    pub node_manager: NodeManagerSettings,
    /// Directory holding the `terraform/` and `ansible/` trees.
    pub working_dir: PathBuf,
    pub terraform_binary: PathBuf,
    pub ssh_private_key_path: PathBuf,
    pub ssh_connect_timeout_secs: u64,
    pub region: String,
    /// Hosts a phase runs on concurrently.
    pub forks: usize,
    /// Percentage of hosts allowed to fail before a phase aborts the run.
    pub max_failure_percentage: u8,
    pub retry_attempts: usize,
    pub retry_delay_secs: u64,
    pub initial_rpc_port: u16,
    pub initial_metrics_port: u16,
    /// Interval the node manager waits between service starts.
    pub start_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let ssh_private_key_path = dirs::home_dir()
            .map(|home| home.join(".ssh").join("id_rsa"))
            .unwrap_or_else(|| PathBuf::from("id_rsa"));
        Self {
            state: StateStoreSettings::default(),
            artifacts: ArtifactSettings::default(),
            node_manager: NodeManagerSettings::default(),
            working_dir: PathBuf::from("resources"),
            terraform_binary: PathBuf::from("terraform"),
            ssh_private_key_path,
            ssh_connect_timeout_secs: 30,
            region: "lon1".to_string(),
            forks: 50,
            max_failure_percentage: 10,
            retry_attempts: 3,
            retry_delay_secs: 5,
            initial_rpc_port: 13000,
            initial_metrics_port: 14000,
            start_interval_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings, reading `path` or `Fleetnet.toml` when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        if path.is_some() && !file.exists() {
            anyhow::bail!("Configuration file {} does not exist", file.display());
        }

        Self::figment(&file)
            .extract()
            .with_context(|| format!("Failed to load settings (file: {})", file.display()))
    }

    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn terraform_dir(&self) -> PathBuf {
        self.working_dir.join("terraform")
    }

    pub fn ansible_dir(&self) -> PathBuf {
        self.working_dir.join("ansible")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn fleet_runner(&self) -> FleetRunner {
        FleetRunner {
            forks: self.forks,
            max_failure_percentage: self.max_failure_percentage,
        }
    }

    pub fn port_base(&self) -> PortBase {
        PortBase {
            rpc: self.initial_rpc_port,
            metrics: self.initial_metrics_port,
        }
    }

    pub fn start_interval(&self) -> Duration {
        Duration::from_millis(self.start_interval_ms)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StoreType;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.forks, 50);
        assert_eq!(settings.max_failure_percentage, 10);
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.port_base(), PortBase::default());
        assert_eq!(settings.node_manager.binary, "antctl");
        assert_eq!(settings.ssh_connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE_NAME,
                r#"
                    forks = 20
                    region = "ams3"

                    [state]
                    store_type = "local"
                    bucket = "/tmp/fleetnet"
                "#,
            )?;
            jail.set_env("FLEETNET_FORKS", "8");
            jail.set_env("FLEETNET_STATE__PREFIX", "testnets");
            jail.set_env("FLEETNET_SSH_CONNECT_TIMEOUT_SECS", "10");

            let settings = Settings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings.forks, 8);
            assert_eq!(settings.region, "ams3");
            assert_eq!(settings.state.store_type, StoreType::Local);
            assert_eq!(settings.state.prefix, "testnets");
            assert_eq!(settings.initial_rpc_port, 13000);
            assert_eq!(settings.ssh_connect_timeout(), Duration::from_secs(10));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(Settings::load(Some(Path::new("/nonexistent/Fleetnet.toml"))).is_err());
    }
}
