//! Deployment-level configuration: cloud provider, environment type, EVM payment network.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use alloy_core::primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::binary::BinaryOption;
use crate::error::DeployError;
use crate::roles::{Role, RoleSpec};

/// RPC port the anvil service listens on inside the EVM node VM.
pub const ANVIL_RPC_PORT: u16 = 61611;

/// Payment token contract deployed by the first anvil account at nonce 0.
pub const ANVIL_PAYMENT_TOKEN_ADDRESS: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

/// Data payments contract deployed by the first anvil account.
pub const ANVIL_DATA_PAYMENTS_ADDRESS: &str = "0x8464135c8F25Da09e49BC8782676a84730C318bC";

/// Secret key of the first anvil account. It deploys both contracts and holds the whole
/// payment token supply.
pub const ANVIL_DEPLOYER_SECRET_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Supported cloud backends.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CloudProvider {
    DigitalOcean,
    Aws,
}

impl CloudProvider {
    /// User the provider's images accept SSH logins for.
    pub fn ssh_user(&self) -> &'static str {
        match self {
            CloudProvider::DigitalOcean => "root",
            CloudProvider::Aws => "ubuntu",
        }
    }

    /// Terraform working directory, relative to the terraform root.
    pub fn terraform_dir(&self) -> &'static str {
        match self {
            CloudProvider::DigitalOcean => "digital-ocean",
            CloudProvider::Aws => "aws",
        }
    }

    fn small_vm(&self) -> &'static str {
        match self {
            CloudProvider::DigitalOcean => "s-2vcpu-4gb",
            CloudProvider::Aws => "t3.medium",
        }
    }

    fn large_vm(&self) -> &'static str {
        match self {
            CloudProvider::DigitalOcean => "s-8vcpu-16gb",
            CloudProvider::Aws => "t3.2xlarge",
        }
    }
}

/// Governs the default sizing of a deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EnvironmentType {
    #[default]
    Development,
    Staging,
    Production,
}

impl EnvironmentType {
    fn short_name(&self) -> &'static str {
        match self {
            EnvironmentType::Development => "dev",
            EnvironmentType::Staging => "staging",
            EnvironmentType::Production => "production",
        }
    }

    /// The sizing tfvars file for this environment type.
    pub fn tfvars_filename(&self) -> String {
        format!("{}.tfvars", self.short_name())
    }

    /// The tfvars file holding machine images for a region.
    pub fn images_tfvars_filename(&self, region: &str) -> String {
        format!("{}-images-{region}.tfvars", self.short_name())
    }

    /// Default number of VMs for a role.
    ///
    /// Build machines, EVM nodes and NAT gateways are derived from other options, so they
    /// default to zero here.
    pub fn default_vm_count(&self, role: Role) -> u16 {
        match (self, role) {
            (_, Role::Genesis) => 1,
            (EnvironmentType::Development, Role::PeerCache) => 1,
            (EnvironmentType::Development, Role::Node) => 2,
            (EnvironmentType::Development, Role::Client) => 1,
            (EnvironmentType::Staging, Role::PeerCache) => 2,
            (EnvironmentType::Staging, Role::Node) => 5,
            (EnvironmentType::Staging, Role::Client) => 2,
            (EnvironmentType::Production, Role::PeerCache) => 5,
            (EnvironmentType::Production, Role::Node) => 39,
            (EnvironmentType::Production, Role::Client) => 4,
            _ => 0,
        }
    }

    /// Default node services per VM for a role.
    pub fn default_nodes_per_vm(&self, role: Role) -> u16 {
        match role {
            Role::Genesis => 1,
            Role::PeerCache => 5,
            Role::Node | Role::FullConePrivateNode | Role::SymmetricPrivateNode | Role::UpnpNode => {
                match self {
                    EnvironmentType::Development => 25,
                    EnvironmentType::Staging | EnvironmentType::Production => 40,
                }
            }
            _ => 0,
        }
    }

    /// Default VM size for a role on a provider.
    pub fn default_vm_size(&self, provider: CloudProvider, role: Role) -> &'static str {
        match (self, role) {
            (EnvironmentType::Development, _) => provider.small_vm(),
            (_, Role::Node | Role::FullConePrivateNode | Role::SymmetricPrivateNode | Role::UpnpNode) => {
                provider.large_vm()
            }
            (_, Role::Build) => provider.large_vm(),
            _ => provider.small_vm(),
        }
    }

    /// Default sizing for a role.
    pub fn default_role_spec(&self, provider: CloudProvider, role: Role) -> RoleSpec {
        let vm_count = self.default_vm_count(role);
        let vm_size = self.default_vm_size(provider, role);
        if role.runs_nodes() {
            RoleSpec::nodes(vm_count, vm_size, self.default_nodes_per_vm(role))
        } else {
            RoleSpec::plain(vm_count, vm_size)
        }
    }
}

/// Addresses and endpoint of a custom EVM payment network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomEvmNetwork {
    pub rpc_url: Url,
    pub payment_token_address: Address,
    pub data_payments_address: Address,
}

/// The EVM network node services use for payments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvmNetwork {
    #[default]
    #[serde(alias = "ArbitrumOne")]
    ArbitrumOne,
    #[serde(alias = "ArbitrumSepoliaTest", alias = "ArbitrumSepolia")]
    ArbitrumSepoliaTest,
    /// A local anvil network deployed on an EVM node VM.
    Anvil,
    #[serde(alias = "Custom")]
    Custom(CustomEvmNetwork),
}

impl EvmNetwork {
    /// Build a custom network, reporting the first missing or malformed field.
    pub fn custom(
        rpc_url: Option<&str>,
        payment_token_address: Option<&str>,
        data_payments_address: Option<&str>,
    ) -> Result<Self, DeployError> {
        let rpc_url = rpc_url.ok_or(DeployError::MissingArgument {
            missing: "evm-rpc-url",
            requires: "evm-network custom",
        })?;
        let payment_token_address = payment_token_address.ok_or(DeployError::MissingArgument {
            missing: "evm-payment-token-address",
            requires: "evm-network custom",
        })?;
        let data_payments_address = data_payments_address.ok_or(DeployError::MissingArgument {
            missing: "evm-data-payments-address",
            requires: "evm-network custom",
        })?;

        Ok(EvmNetwork::Custom(CustomEvmNetwork {
            rpc_url: Url::parse(rpc_url).map_err(|e| DeployError::InvalidArgument {
                field: "evm-rpc-url",
                reason: e.to_string(),
            })?,
            payment_token_address: parse_address("evm-payment-token-address", payment_token_address)?,
            data_payments_address: parse_address("evm-data-payments-address", data_payments_address)?,
        }))
    }

    /// Whether an EVM node VM has to be deployed for this network.
    pub fn requires_evm_node(&self) -> bool {
        matches!(self, EvmNetwork::Anvil)
    }

    /// Wallet key clients pay for uploads with, when the network comes with a funded one.
    pub fn funded_client_key(&self) -> Option<&'static str> {
        match self {
            EvmNetwork::Anvil => Some(ANVIL_DEPLOYER_SECRET_KEY),
            _ => None,
        }
    }

    /// Replace the anvil preset with the concrete network served by the EVM node VM.
    pub fn resolve(&self, evm_node_ip: Option<IpAddr>) -> Result<EvmNetwork> {
        match self {
            EvmNetwork::Anvil => {
                let Some(ip) = evm_node_ip else {
                    anyhow::bail!("the anvil EVM network requires an EVM node VM");
                };
                Ok(EvmNetwork::custom(
                    Some(&format!("http://{ip}:{ANVIL_RPC_PORT}")),
                    Some(ANVIL_PAYMENT_TOKEN_ADDRESS),
                    Some(ANVIL_DATA_PAYMENTS_ADDRESS),
                )?)
            }
            other => Ok(other.clone()),
        }
    }

    /// Arguments selecting this network on the node manager `add` command.
    pub fn add_args(&self) -> Vec<String> {
        match self {
            EvmNetwork::ArbitrumOne => vec!["evm-arbitrum-one".to_string()],
            EvmNetwork::ArbitrumSepoliaTest => vec!["evm-arbitrum-sepolia-test".to_string()],
            // Anvil is always resolved before reaching a node manager.
            EvmNetwork::Anvil => Vec::new(),
            EvmNetwork::Custom(custom) => vec![
                "evm-custom".to_string(),
                "--rpc-url".to_string(),
                custom.rpc_url.to_string(),
                "--payment-token-address".to_string(),
                custom.payment_token_address.to_string(),
                "--data-payments-address".to_string(),
                custom.data_payments_address.to_string(),
            ],
        }
    }
}

/// Parse an EVM address, naming the field on failure.
pub fn parse_address(field: &'static str, value: &str) -> Result<Address, DeployError> {
    Address::from_str(value).map_err(|e| DeployError::InvalidArgument {
        field,
        reason: e.to_string(),
    })
}

/// Log output format of node services.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[serde(alias = "Default")]
    Default,
    #[serde(alias = "Json")]
    Json,
}

/// Metadata persisted for every deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDetails {
    pub name: String,
    pub provider: CloudProvider,
    pub environment_type: EnvironmentType,
    pub region: String,
    pub network_id: Option<u8>,
    pub evm_network: EvmNetwork,
    pub rewards_address: Option<String>,
    pub binary_option: BinaryOption,
    pub log_format: Option<LogFormat>,
    pub max_log_files: Option<u16>,
    pub max_archived_log_files: Option<u16>,
    #[serde(default)]
    pub env_variables: Option<Vec<(String, String)>>,
    /// Peer supplied by the operator when joining an existing network.
    #[serde(default)]
    pub bootstrap_peer: Option<String>,
    #[serde(default)]
    pub network_contacts_urls: Vec<Url>,
    /// Sizing of every role at the last successful run.
    pub roles: BTreeMap<Role, RoleSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentDetails {
    /// Sizing for a role, falling back to an empty spec.
    pub fn role_spec(&self, role: Role) -> RoleSpec {
        self.roles.get(&role).cloned().unwrap_or_else(|| {
            self.environment_type
                .default_role_spec(self.provider, role)
                .with_vm_count(0)
        })
    }

    /// Mark the details as written now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
