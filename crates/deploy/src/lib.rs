//! fleetnet-deploy - Deployment library for node testnets.
//!
//! This crate provisions cloud VMs, installs the node manager on them and rolls node
//! services out across the fleet, keeping per-deployment state in an object store.

pub mod ansible;
pub mod binary;
pub mod config;
pub mod environment;
pub mod error;
pub mod fleet;
pub mod genesis;
pub mod infra;
pub mod inventory;
pub mod node_manager;
mod orchestrator;
pub mod remote;
pub mod roles;
pub mod rollout;
pub mod state;
pub mod status;
pub mod topology;

pub use ansible::{AnsibleRunner, ExtraVars, Playbook, PlaybookRunner};
pub use binary::{ArtifactSettings, BinaryOption, BinaryRequest, BinaryResolver, NodeSource};
pub use config::Settings;
pub use environment::{CloudProvider, EnvironmentDetails, EnvironmentType, EvmNetwork, LogFormat};
pub use error::DeployError;
pub use fleet::{FleetReport, FleetRunner, HostOutcome, HostReport, RunSummary};
pub use infra::{InfraDriver, InfraRunOptions, TerraformDriver};
pub use inventory::{HostInventory, VirtualMachine};
pub use orchestrator::{
    DeployOptions, Orchestrator, ResetRequest, UpgradeRequest, UpscaleOptions, UpscaleOutcome,
};
pub use remote::{CommandOutput, RemoteExecutor, RetryPolicy, SshExecutor};
pub use roles::{Role, RoleSpec};
pub use rollout::StopOptions;
pub use state::{EnvironmentStateStore, StateStoreSettings, StoreType};
pub use status::StatusReport;
