//! Command builders for the node manager.
//!
//! Optional flags are stored as `Option`s and only pushed when set. The node manager treats
//! an empty value such as `--env=` as a parse error, so an unset flag never appears at all.

use std::time::Duration;

use crate::binary::NodeSource;
use crate::environment::{EvmNetwork, LogFormat};
use crate::roles::Role;
use crate::topology::PortAllocation;

/// Reachability mode of the services being added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum NodeMode {
    /// Publicly reachable.
    #[default]
    Public,
    /// Behind a NAT gateway, reachable through relays.
    Relay,
    /// Behind a router that supports UPnP port mapping.
    Upnp,
}

impl NodeMode {
    pub fn for_role(role: Role) -> Self {
        match role {
            role if role.is_private() => NodeMode::Relay,
            Role::UpnpNode => NodeMode::Upnp,
            _ => NodeMode::Public,
        }
    }
}

/// Builder for `add` commands.
#[derive(Debug, Clone)]
pub struct AddNodesCmdBuilder {
    binary: String,
    count: u16,
    rpc_ports: Option<PortAllocation>,
    metrics_ports: Option<PortAllocation>,
    first: bool,
    peers: Vec<String>,
    network_contacts_urls: Vec<String>,
    rewards_address: Option<String>,
    network_id: Option<u8>,
    log_format: Option<LogFormat>,
    max_log_files: Option<u16>,
    max_archived_log_files: Option<u16>,
    env_variables: Option<Vec<(String, String)>>,
    source: NodeSource,
    mode: NodeMode,
    write_older_cache_files: bool,
    evm_network: Option<EvmNetwork>,
}

impl AddNodesCmdBuilder {
    /// Create a builder adding `count` services.
    pub fn new(binary: impl Into<String>, count: u16) -> Self {
        Self {
            binary: binary.into(),
            count,
            rpc_ports: None,
            metrics_ports: None,
            first: false,
            peers: Vec::new(),
            network_contacts_urls: Vec::new(),
            rewards_address: None,
            network_id: None,
            log_format: None,
            max_log_files: None,
            max_archived_log_files: None,
            env_variables: None,
            source: NodeSource::Latest,
            mode: NodeMode::Public,
            write_older_cache_files: false,
            evm_network: None,
        }
    }

    pub fn rpc_ports(mut self, ports: PortAllocation) -> Self {
        self.rpc_ports = Some(ports);
        self
    }

    pub fn metrics_ports(mut self, ports: PortAllocation) -> Self {
        self.metrics_ports = Some(ports);
        self
    }

    /// Mark the service as the first node of a new network.
    pub fn first(mut self, first: bool) -> Self {
        self.first = first;
        self
    }

    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peers.push(peer.into());
        self
    }

    pub fn peers(mut self, peers: impl IntoIterator<Item = String>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn network_contacts_urls(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.network_contacts_urls.extend(urls);
        self
    }

    pub fn rewards_address(mut self, address: Option<String>) -> Self {
        self.rewards_address = address;
        self
    }

    pub fn network_id(mut self, network_id: Option<u8>) -> Self {
        self.network_id = network_id;
        self
    }

    pub fn log_format(mut self, format: Option<LogFormat>) -> Self {
        self.log_format = format;
        self
    }

    pub fn max_log_files(mut self, max: Option<u16>) -> Self {
        self.max_log_files = max;
        self
    }

    pub fn max_archived_log_files(mut self, max: Option<u16>) -> Self {
        self.max_archived_log_files = max;
        self
    }

    pub fn env_variables(mut self, vars: Option<Vec<(String, String)>>) -> Self {
        self.env_variables = vars.filter(|vars| !vars.is_empty());
        self
    }

    pub fn source(mut self, source: NodeSource) -> Self {
        self.source = source;
        self
    }

    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Keep writing the legacy bootstrap cache formats. Used on peer-cache hosts.
    pub fn write_older_cache_files(mut self, enabled: bool) -> Self {
        self.write_older_cache_files = enabled;
        self
    }

    pub fn evm_network(mut self, network: Option<EvmNetwork>) -> Self {
        self.evm_network = network;
        self
    }

    /// Build the argument list.
    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            self.binary,
            "add".to_string(),
            "--count".to_string(),
            self.count.to_string(),
        ];

        if let Some(ports) = self.rpc_ports {
            cmd.push("--rpc-port".to_string());
            cmd.push(ports.to_string());
        }

        if let Some(ports) = self.metrics_ports {
            cmd.push("--metrics-port".to_string());
            cmd.push(ports.to_string());
        }

        if self.first {
            cmd.push("--first".to_string());
        }

        for peer in self.peers {
            cmd.push("--peer".to_string());
            cmd.push(peer);
        }

        for url in self.network_contacts_urls {
            cmd.push("--network-contacts-url".to_string());
            cmd.push(url);
        }

        if let Some(address) = self.rewards_address {
            cmd.push("--rewards-address".to_string());
            cmd.push(address);
        }

        if let Some(id) = self.network_id {
            cmd.push("--network-id".to_string());
            cmd.push(id.to_string());
        }

        if let Some(format) = self.log_format {
            cmd.push(format!("--log-format={format}"));
        }

        if let Some(max) = self.max_log_files {
            cmd.push(format!("--max-log-files={max}"));
        }

        if let Some(max) = self.max_archived_log_files {
            cmd.push(format!("--max-archived-log-files={max}"));
        }

        if let Some(vars) = self.env_variables {
            cmd.push(format!("--env={}", join_env(&vars)));
        }

        if let Some(flag) = self.source.flag() {
            cmd.push(flag);
        }

        match self.mode {
            NodeMode::Public => {}
            NodeMode::Relay => cmd.push("--relay".to_string()),
            NodeMode::Upnp => cmd.push("--upnp".to_string()),
        }

        if self.write_older_cache_files {
            cmd.push("--write-older-cache-files".to_string());
        }

        // The EVM network is a subcommand and has to come last.
        if let Some(network) = self.evm_network {
            cmd.extend(network.add_args());
        }

        cmd
    }
}

fn join_env(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Builder for `start` commands.
#[derive(Debug, Clone)]
pub struct StartCmdBuilder {
    binary: String,
    interval: Duration,
}

impl StartCmdBuilder {
    pub fn new(binary: impl Into<String>, interval: Duration) -> Self {
        Self {
            binary: binary.into(),
            interval,
        }
    }

    pub fn build(self) -> Vec<String> {
        vec![
            self.binary,
            "start".to_string(),
            "--interval".to_string(),
            self.interval.as_millis().to_string(),
        ]
    }
}

/// Builder for `stop` commands.
///
/// Without service names every service on the host is stopped.
#[derive(Debug, Clone)]
pub struct StopCmdBuilder {
    binary: String,
    interval: Option<Duration>,
    service_names: Vec<String>,
}

impl StopCmdBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            interval: None,
            service_names: Vec::new(),
        }
    }

    /// Delay between consecutive service stops.
    pub fn interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn service_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.service_names.extend(names);
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![self.binary, "stop".to_string()];
        for name in self.service_names {
            cmd.push("--service-name".to_string());
            cmd.push(name);
        }
        if let Some(interval) = self.interval {
            cmd.push("--interval".to_string());
            cmd.push(interval.as_millis().to_string());
        }
        cmd
    }
}

/// Builder for `upgrade` commands.
#[derive(Debug, Clone)]
pub struct UpgradeCmdBuilder {
    binary: String,
    interval: Duration,
    force: bool,
    env_variables: Option<Vec<(String, String)>>,
    source: NodeSource,
}

impl UpgradeCmdBuilder {
    pub fn new(binary: impl Into<String>, interval: Duration) -> Self {
        Self {
            binary: binary.into(),
            interval,
            force: false,
            env_variables: None,
            source: NodeSource::Latest,
        }
    }

    /// Reinstall even when the installed version already matches.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn env_variables(mut self, vars: Option<Vec<(String, String)>>) -> Self {
        self.env_variables = vars.filter(|vars| !vars.is_empty());
        self
    }

    pub fn source(mut self, source: NodeSource) -> Self {
        self.source = source;
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            self.binary,
            "upgrade".to_string(),
            "--interval".to_string(),
            self.interval.as_millis().to_string(),
        ];

        if self.force || self.source.implies_force() {
            cmd.push("--force".to_string());
        }

        if let Some(vars) = self.env_variables {
            cmd.push(format!("--env={}", join_env(&vars)));
        }

        if let Some(flag) = self.source.flag() {
            cmd.push(flag);
        }

        cmd
    }
}

/// Builder for `reset --force`, which wipes the registry and every service.
#[derive(Debug, Clone)]
pub struct ResetCmdBuilder {
    binary: String,
}

impl ResetCmdBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build(self) -> Vec<String> {
        vec![self.binary, "reset".to_string(), "--force".to_string()]
    }
}

/// Builder for `status --json`.
#[derive(Debug, Clone)]
pub struct StatusCmdBuilder {
    binary: String,
}

impl StatusCmdBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build(self) -> Vec<String> {
        vec![self.binary, "status".to_string(), "--json".to_string()]
    }
}
