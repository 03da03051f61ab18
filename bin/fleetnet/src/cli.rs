use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use fleetnet_deploy::{
    BinaryRequest, CloudProvider, DeployError, DeployOptions, EnvironmentType, EvmNetwork,
    LogFormat, ResetRequest, Role, StopOptions, UpgradeRequest, UpscaleOptions,
};
use multiaddr::Multiaddr;
use tracing::level_filters::LevelFilter;
use url::Url;

/// Payment network selection on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum EvmNetworkKind {
    #[default]
    ArbitrumOne,
    ArbitrumSepoliaTest,
    Anvil,
    Custom,
}

#[derive(Parser)]
#[command(name = "fleetnet")]
#[command(author, version, about = "Deploy and operate node testnets on cloud VMs")]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "FLEETNET_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path of the configuration file. Defaults to `Fleetnet.toml` in the working directory.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Hosts a phase runs on concurrently. Overrides the configuration.
    #[arg(long, global = true)]
    pub forks: Option<usize>,

    /// Percentage of hosts allowed to fail before a phase aborts. Overrides the configuration.
    #[arg(long, global = true)]
    pub max_failure_percentage: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a deployment, or converge an existing one.
    Deploy(DeployArgs),
    /// Add VMs or node services to a deployment.
    Upscale(UpscaleArgs),
    /// Upgrade the node services of a deployment.
    Upgrade(UpgradeArgs),
    /// Print the service counts of every node host.
    Status {
        #[arg(short, long)]
        name: String,
    },
    /// Destroy a deployment and remove its state.
    Clean {
        #[arg(short, long)]
        name: String,
        /// Required when the deployment has no stored state.
        #[arg(long)]
        provider: Option<CloudProvider>,
    },
    /// Print the hosts of a deployment.
    Inventory {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        provider: Option<CloudProvider>,
    },
    /// Start node services.
    Start {
        #[arg(short, long)]
        name: String,
        /// Milliseconds between service starts on a host.
        #[arg(long)]
        interval: Option<u64>,
        /// Only act on hosts of this role.
        #[arg(long)]
        role: Option<Role>,
    },
    /// Stop node services.
    Stop {
        #[arg(short, long)]
        name: String,
        /// Milliseconds between service stops on a host.
        #[arg(long)]
        interval: Option<u64>,
        /// Maximum random delay in seconds before each host starts stopping.
        #[arg(long)]
        delay: Option<u64>,
        /// Stop only the named services.
        #[arg(long = "service-name")]
        service_names: Vec<String>,
        #[arg(long)]
        role: Option<Role>,
    },
    /// Wipe the services on every host and add a fresh set, keeping their configuration.
    ResetToNNodes {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        node_count: u16,
        /// Milliseconds between service starts on a host.
        #[arg(long)]
        start_interval: Option<u64>,
        /// Milliseconds between service stops on a host.
        #[arg(long)]
        stop_interval: Option<u64>,
        #[arg(long)]
        version: Option<String>,
        /// Defaults to every node role except genesis.
        #[arg(long)]
        role: Option<Role>,
    },
}

/// Per-role VM and service counts.
#[derive(Args, Debug, Clone, Default)]
pub struct RoleCounts {
    #[arg(long)]
    pub peer_cache_vm_count: Option<u16>,
    #[arg(long)]
    pub peer_cache_node_count: Option<u16>,
    #[arg(long)]
    pub node_vm_count: Option<u16>,
    /// Node services per generic node VM.
    #[arg(long)]
    pub node_count: Option<u16>,
    #[arg(long)]
    pub full_cone_private_node_vm_count: Option<u16>,
    #[arg(long)]
    pub full_cone_private_node_count: Option<u16>,
    #[arg(long)]
    pub symmetric_private_node_vm_count: Option<u16>,
    #[arg(long)]
    pub symmetric_private_node_count: Option<u16>,
    #[arg(long)]
    pub upnp_private_node_vm_count: Option<u16>,
    #[arg(long)]
    pub upnp_private_node_count: Option<u16>,
    #[arg(long)]
    pub client_vm_count: Option<u16>,
}

impl RoleCounts {
    pub fn vm_counts(&self) -> BTreeMap<Role, u16> {
        collect([
            (Role::PeerCache, self.peer_cache_vm_count),
            (Role::Node, self.node_vm_count),
            (Role::FullConePrivateNode, self.full_cone_private_node_vm_count),
            (Role::SymmetricPrivateNode, self.symmetric_private_node_vm_count),
            (Role::UpnpNode, self.upnp_private_node_vm_count),
            (Role::Client, self.client_vm_count),
        ])
    }

    pub fn nodes_per_vm(&self) -> BTreeMap<Role, u16> {
        collect([
            (Role::PeerCache, self.peer_cache_node_count),
            (Role::Node, self.node_count),
            (Role::FullConePrivateNode, self.full_cone_private_node_count),
            (Role::SymmetricPrivateNode, self.symmetric_private_node_count),
            (Role::UpnpNode, self.upnp_private_node_count),
        ])
    }
}

fn collect<const N: usize>(items: [(Role, Option<u16>); N]) -> BTreeMap<Role, u16> {
    items
        .into_iter()
        .filter_map(|(role, count)| count.map(|count| (role, count)))
        .collect()
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    #[arg(short, long)]
    pub name: String,

    #[arg(long, default_value_t = CloudProvider::DigitalOcean)]
    pub provider: CloudProvider,

    #[arg(long, default_value_t = EnvironmentType::Development)]
    pub environment_type: EnvironmentType,

    /// Defaults to the configured region.
    #[arg(long)]
    pub region: Option<String>,

    #[command(flatten)]
    pub counts: RoleCounts,

    /// VM size override, as `<role>=<size>`. May be repeated.
    #[arg(long = "vm-size", value_parser = parse_role_value)]
    pub vm_sizes: Vec<(Role, String)>,

    /// Machine image override, as `<role>=<image>`. May be repeated.
    #[arg(long = "image-id", value_parser = parse_role_value)]
    pub image_ids: Vec<(Role, String)>,

    /// Release version of the node binary. Conflicts with `--branch`.
    #[arg(long)]
    pub version: Option<String>,

    #[arg(long)]
    pub node_manager_version: Option<String>,

    #[arg(long)]
    pub client_version: Option<String>,

    /// Build binaries from this branch. Requires `--repo-owner`.
    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long)]
    pub repo_owner: Option<String>,

    #[arg(long)]
    pub chunk_size: Option<u64>,

    #[arg(long, default_value_t = EvmNetworkKind::ArbitrumOne)]
    pub evm_network: EvmNetworkKind,

    #[arg(long)]
    pub evm_rpc_url: Option<String>,

    #[arg(long)]
    pub evm_payment_token_address: Option<String>,

    #[arg(long)]
    pub evm_data_payments_address: Option<String>,

    #[arg(long)]
    pub rewards_address: Option<String>,

    #[arg(long)]
    pub network_id: Option<u8>,

    #[arg(long)]
    pub log_format: Option<LogFormat>,

    #[arg(long)]
    pub max_log_files: Option<u16>,

    #[arg(long)]
    pub max_archived_log_files: Option<u16>,

    /// Environment variables for node services, as `KEY=VALUE`. Comma separated or repeated.
    #[arg(long = "env", value_delimiter = ',', value_parser = parse_env_var)]
    pub env_variables: Vec<(String, String)>,

    /// Join an existing network through this peer instead of deploying a genesis node.
    #[arg(long)]
    pub peer: Option<Multiaddr>,

    /// Join an existing network through this bootstrap cache. May be repeated.
    #[arg(long = "network-contacts-url")]
    pub network_contacts_urls: Vec<Url>,

    /// Milliseconds between service starts on a host.
    #[arg(long)]
    pub interval: Option<u64>,
}

impl DeployArgs {
    /// Turn the arguments into deploy options, rejecting incomplete EVM settings.
    pub fn into_options(self) -> Result<DeployOptions, DeployError> {
        let evm_network = match self.evm_network {
            EvmNetworkKind::ArbitrumOne => EvmNetwork::ArbitrumOne,
            EvmNetworkKind::ArbitrumSepoliaTest => EvmNetwork::ArbitrumSepoliaTest,
            EvmNetworkKind::Anvil => EvmNetwork::Anvil,
            EvmNetworkKind::Custom => EvmNetwork::custom(
                self.evm_rpc_url.as_deref(),
                self.evm_payment_token_address.as_deref(),
                self.evm_data_payments_address.as_deref(),
            )?,
        };

        let mut options = DeployOptions::new(self.name, self.provider);
        options.environment_type = self.environment_type;
        options.region = self.region;
        options.vm_counts = self.counts.vm_counts();
        options.nodes_per_vm = self.counts.nodes_per_vm();
        options.vm_sizes = self.vm_sizes.into_iter().collect();
        options.image_ids = self.image_ids.into_iter().collect();
        // Source builds bake the custom contract addresses into the binaries.
        options.binary = BinaryRequest {
            version: self.version,
            node_manager_version: self.node_manager_version,
            client_version: self.client_version,
            chunk_size: self.chunk_size,
            payment_token_address: self.branch.as_ref().and(self.evm_payment_token_address),
            data_payments_address: self.branch.as_ref().and(self.evm_data_payments_address),
            branch: self.branch,
            repo_owner: self.repo_owner,
        };
        options.evm_network = evm_network;
        options.rewards_address = self.rewards_address;
        options.network_id = self.network_id;
        options.log_format = self.log_format;
        options.max_log_files = self.max_log_files;
        options.max_archived_log_files = self.max_archived_log_files;
        options.env_variables = env_variables(self.env_variables);
        options.bootstrap_peer = self.peer;
        options.network_contacts_urls = self.network_contacts_urls;
        options.start_interval = self.interval.map(Duration::from_millis);
        Ok(options)
    }
}

#[derive(Args, Debug, Clone)]
pub struct UpscaleArgs {
    #[arg(short, long)]
    pub name: String,

    #[command(flatten)]
    pub counts: RoleCounts,

    /// Only apply the infrastructure change.
    #[arg(long)]
    pub infra_only: bool,

    /// Print the infrastructure variables and plan without applying anything.
    #[arg(long)]
    pub plan: bool,

    /// Milliseconds between service starts on a host.
    #[arg(long)]
    pub interval: Option<u64>,
}

impl From<UpscaleArgs> for UpscaleOptions {
    fn from(args: UpscaleArgs) -> Self {
        Self {
            vm_counts: args.counts.vm_counts(),
            nodes_per_vm: args.counts.nodes_per_vm(),
            name: args.name,
            infra_only: args.infra_only,
            plan: args.plan,
            start_interval: args.interval.map(Duration::from_millis),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    #[arg(short, long)]
    pub name: String,

    #[arg(long, conflicts_with = "url")]
    pub version: Option<String>,

    /// Archive URL of the node binary. Always forces a reinstall.
    #[arg(long)]
    pub url: Option<String>,

    /// Reinstall even when the installed version matches.
    #[arg(long)]
    pub force: bool,

    /// Environment variables for node services, as `KEY=VALUE`. Comma separated or repeated.
    #[arg(long = "env", value_delimiter = ',', value_parser = parse_env_var)]
    pub env_variables: Vec<(String, String)>,

    /// Milliseconds between service upgrades on a host.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Maximum random delay in seconds before each host starts upgrading.
    #[arg(long)]
    pub delay: Option<u64>,

    #[arg(long)]
    pub role: Option<Role>,
}

impl From<UpgradeArgs> for UpgradeRequest {
    fn from(args: UpgradeArgs) -> Self {
        Self {
            name: args.name,
            version: args.version,
            url: args.url,
            force: args.force,
            env_variables: env_variables(args.env_variables),
            interval: args.interval.map(Duration::from_millis),
            delay: args.delay.map(Duration::from_secs),
            role: args.role,
        }
    }
}

pub fn stop_options(interval: Option<u64>, delay: Option<u64>, service_names: Vec<String>) -> StopOptions {
    StopOptions {
        interval: interval.map(Duration::from_millis),
        delay: delay.map(Duration::from_secs),
        service_names,
    }
}

pub fn reset_request(
    name: String,
    node_count: u16,
    start_interval: Option<u64>,
    stop_interval: Option<u64>,
    version: Option<String>,
    role: Option<Role>,
) -> ResetRequest {
    ResetRequest {
        name,
        node_count,
        start_interval: start_interval.map(Duration::from_millis),
        stop_interval: stop_interval.map(Duration::from_millis),
        version,
        role,
    }
}

fn env_variables(vars: Vec<(String, String)>) -> Option<Vec<(String, String)>> {
    (!vars.is_empty()).then_some(vars)
}

fn parse_env_var(value: &str) -> Result<(String, String), String> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| format!("'{value}' is not in KEY=VALUE form"))?;
    if key.is_empty() {
        return Err("environment variable name is empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_role_value(value: &str) -> Result<(Role, String), String> {
    let (role, value) = value
        .split_once('=')
        .ok_or_else(|| format!("'{value}' is not in ROLE=VALUE form"))?;
    let role = role.parse::<Role>().map_err(|e| format!("unknown role '{role}': {e}"))?;
    Ok((role, value.to_string()))
}
