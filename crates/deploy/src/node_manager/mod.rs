//! The remote node manager: its command line and its registry format.

mod cmd;
mod registry;

pub use cmd::{
    AddNodesCmdBuilder, NodeMode, ResetCmdBuilder, StartCmdBuilder, StatusCmdBuilder,
    StopCmdBuilder, UpgradeCmdBuilder,
};
pub use registry::{InitialPeersConfig, NodeRegistry, NodeServiceEntry, RegistrySnapshot, ServiceStatus};

use serde::{Deserialize, Serialize};

use crate::binary::NODE_MANAGER_BINARY;

/// Default path of the registry file the node manager maintains on every host.
pub const DEFAULT_REGISTRY_PATH: &str = "/var/antctl/node_registry.json";

/// Where the node manager lives on the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeManagerSettings {
    /// Binary name or absolute path.
    pub binary: String,
    /// Registry file path.
    pub registry_path: String,
}

impl Default for NodeManagerSettings {
    fn default() -> Self {
        Self {
            binary: NODE_MANAGER_BINARY.to_string(),
            registry_path: DEFAULT_REGISTRY_PATH.to_string(),
        }
    }
}

impl NodeManagerSettings {
    /// Command printing the registry file.
    pub fn read_registry_cmd(&self) -> Vec<String> {
        vec!["cat".to_string(), self.registry_path.clone()]
    }
}
