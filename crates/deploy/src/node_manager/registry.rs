//! Schema of the node manager registry, shared by the registry file and `status --json`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Serialize};

use super::AddNodesCmdBuilder;
use crate::environment::{EvmNetwork, LogFormat};
use crate::error::DeployError;

/// Lifecycle state of a node service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ServiceStatus {
    Added,
    Running,
    Stopped,
    Removed,
}

/// How a service finds its first peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPeersConfig {
    /// The service started a new network.
    #[serde(default)]
    pub first: bool,
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub network_contacts_url: Vec<String>,
}

/// One node service tracked by the node manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServiceEntry {
    pub service_name: String,
    pub number: u16,
    pub rpc_socket_addr: SocketAddr,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub listen_addr: Option<Vec<String>>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub initial_peers_config: InitialPeersConfig,
    /// Set by older node managers instead of `initial_peers_config.first`.
    #[serde(default)]
    pub genesis: Option<bool>,
    #[serde(default)]
    pub rewards_address: Option<String>,
    #[serde(default)]
    pub network_id: Option<u8>,
    #[serde(default)]
    pub evm_network: Option<EvmNetwork>,
    #[serde(default)]
    pub log_format: Option<LogFormat>,
    #[serde(default)]
    pub max_log_files: Option<u16>,
    #[serde(default)]
    pub max_archived_log_files: Option<u16>,
    #[serde(default)]
    pub data_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub log_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub version: Option<String>,
}

impl NodeServiceEntry {
    pub fn is_genesis(&self) -> bool {
        self.initial_peers_config.first || self.genesis == Some(true)
    }

    pub fn is_active(&self) -> bool {
        self.status != ServiceStatus::Removed
    }

    /// First listen address that is QUIC and not bound to loopback.
    pub fn public_quic_addr(&self) -> Option<Multiaddr> {
        self.listen_addr
            .iter()
            .flatten()
            .filter_map(|addr| Multiaddr::from_str(addr).ok())
            .find(|addr| {
                let mut quic = false;
                let mut loopback = false;
                for protocol in addr.iter() {
                    match protocol {
                        Protocol::Ip4(ip) => loopback |= ip.is_loopback(),
                        Protocol::Ip6(ip) => loopback |= ip.is_loopback(),
                        Protocol::QuicV1 => quic = true,
                        _ => {}
                    }
                }
                quic && !loopback
            })
    }
}

/// The node manager's view of the services on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistry {
    #[serde(default)]
    pub nodes: Vec<NodeServiceEntry>,
}

impl NodeRegistry {
    /// Parse registry or status JSON fetched from `host`.
    pub fn parse(host: &str, json: &str) -> Result<Self, DeployError> {
        serde_json::from_str(json).map_err(|e| DeployError::MalformedRegistry {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }

    /// Services that have not been removed.
    pub fn active(&self) -> impl Iterator<Item = &NodeServiceEntry> {
        self.nodes.iter().filter(|node| node.is_active())
    }

    pub fn active_count(&self) -> u16 {
        u16::try_from(self.active().count()).unwrap_or(u16::MAX)
    }

    /// Ports the registry accounts for. A removed service keeps its entry and its port, so
    /// this covers the highest service number rather than only the active ones.
    pub fn port_offset(&self) -> u16 {
        let highest = self.nodes.iter().map(|node| node.number).max().unwrap_or(0);
        highest.max(u16::try_from(self.nodes.len()).unwrap_or(u16::MAX))
    }

    pub fn count_with_status(&self, status: ServiceStatus) -> usize {
        self.nodes.iter().filter(|node| node.status == status).count()
    }

    /// The service that started the network, if this host carries it.
    pub fn genesis(&self) -> Option<&NodeServiceEntry> {
        self.active().find(|node| node.is_genesis())
    }

    pub fn has_genesis(&self) -> bool {
        self.genesis().is_some()
    }

    /// Multiaddress other services bootstrap from.
    ///
    /// Prefers the genesis service, falling back to any service on the host.
    pub fn bootstrap_multiaddr(&self) -> Option<Multiaddr> {
        self.genesis()
            .and_then(NodeServiceEntry::public_quic_addr)
            .or_else(|| self.active().find_map(NodeServiceEntry::public_quic_addr))
    }

    /// RPC socket of the genesis service.
    pub fn genesis_rpc_socket_addr(&self) -> Option<SocketAddr> {
        self.genesis().map(|node| node.rpc_socket_addr)
    }

    /// Configuration to carry over when the registry is about to be wiped.
    ///
    /// Taken from the first active service. Returns `None` for an empty registry.
    pub fn snapshot(&self) -> Option<RegistrySnapshot> {
        let node = self.active().next()?;
        Some(RegistrySnapshot {
            peers: node.initial_peers_config.addrs.clone(),
            network_contacts_url: node.initial_peers_config.network_contacts_url.clone(),
            rewards_address: node.rewards_address.clone(),
            network_id: node.network_id,
            evm_network: node.evm_network.clone(),
            log_format: node.log_format,
            max_log_files: node.max_log_files,
            max_archived_log_files: node.max_archived_log_files,
        })
    }
}

/// Service configuration captured from a registry before a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub peers: Vec<String>,
    pub network_contacts_url: Vec<String>,
    pub rewards_address: Option<String>,
    pub network_id: Option<u8>,
    pub evm_network: Option<EvmNetwork>,
    pub log_format: Option<LogFormat>,
    pub max_log_files: Option<u16>,
    pub max_archived_log_files: Option<u16>,
}

impl RegistrySnapshot {
    /// Carry the captured configuration over to a new `add` command.
    pub fn apply(&self, builder: AddNodesCmdBuilder) -> AddNodesCmdBuilder {
        builder
            .peers(self.peers.iter().cloned())
            .network_contacts_urls(self.network_contacts_url.iter().cloned())
            .rewards_address(self.rewards_address.clone())
            .network_id(self.network_id)
            .log_format(self.log_format)
            .max_log_files(self.max_log_files)
            .max_archived_log_files(self.max_archived_log_files)
            .evm_network(self.evm_network.clone())
    }
}
