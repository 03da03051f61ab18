//! Deployment orchestrator: composes the infrastructure driver, playbook runner, remote
//! executor and state store into the operator-facing commands.
//!
//! One invocation is one logical transaction: the environment state is read once at the
//! start and written once at the end. Concurrent invocations against the same deployment
//! must be serialized by the operator.

mod provision;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{StreamExt, stream};
use multiaddr::Multiaddr;
use semver::Version;
use strum::IntoEnumIterator;
use url::Url;

use crate::ansible::PlaybookRunner;
use crate::binary::{BinaryOption, BinaryRequest, BinaryResolver, NodeSource};
use crate::config::Settings;
use crate::environment::{
    CloudProvider, EnvironmentDetails, EnvironmentType, EvmNetwork, LogFormat, parse_address,
};
use crate::error::DeployError;
use crate::fleet::RunSummary;
use crate::infra::{InfraDriver, InfraRunOptions};
use crate::inventory::{HostInventory, VirtualMachine};
use crate::node_manager::{NodeRegistry, StatusCmdBuilder};
use crate::remote::{CommandOutput, RemoteExecutor};
use crate::roles::{Role, RoleSpec};
use crate::rollout::{ResetOptions, RolloutController, StopOptions, UpgradeOptions};
use crate::state::EnvironmentStateStore;
use crate::status::{HostStatus, StatusReport};
use crate::topology::{ScaleRequest, grow_only, scale_roles, sync_gateways};

/// Options of a `deploy` run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub name: String,
    pub provider: CloudProvider,
    pub environment_type: EnvironmentType,
    /// Falls back to the configured region.
    pub region: Option<String>,
    pub binary: BinaryRequest,
    pub evm_network: EvmNetwork,
    pub rewards_address: Option<String>,
    pub network_id: Option<u8>,
    pub log_format: Option<LogFormat>,
    pub max_log_files: Option<u16>,
    pub max_archived_log_files: Option<u16>,
    pub env_variables: Option<Vec<(String, String)>>,
    /// Per-role VM count overrides.
    pub vm_counts: BTreeMap<Role, u16>,
    /// Per-role node service count overrides.
    pub nodes_per_vm: BTreeMap<Role, u16>,
    pub vm_sizes: BTreeMap<Role, String>,
    pub image_ids: BTreeMap<Role, String>,
    /// Join an existing network through this peer instead of deploying a genesis node.
    pub bootstrap_peer: Option<Multiaddr>,
    /// Join an existing network through these bootstrap caches.
    pub network_contacts_urls: Vec<Url>,
    pub start_interval: Option<Duration>,
}

impl DeployOptions {
    pub fn new(name: impl Into<String>, provider: CloudProvider) -> Self {
        Self {
            name: name.into(),
            provider,
            environment_type: EnvironmentType::default(),
            region: None,
            binary: BinaryRequest::default(),
            evm_network: EvmNetwork::default(),
            rewards_address: None,
            network_id: None,
            log_format: None,
            max_log_files: None,
            max_archived_log_files: None,
            env_variables: None,
            vm_counts: BTreeMap::new(),
            nodes_per_vm: BTreeMap::new(),
            vm_sizes: BTreeMap::new(),
            image_ids: BTreeMap::new(),
            bootstrap_peer: None,
            network_contacts_urls: Vec::new(),
            start_interval: None,
        }
    }

    fn joins_existing_network(&self) -> bool {
        self.bootstrap_peer.is_some() || !self.network_contacts_urls.is_empty()
    }

    /// Sizing of every role: stored sizing or environment defaults, then overrides.
    ///
    /// An existing deployment only grows: an override below the stored count is rejected,
    /// and derived roles keep the VMs they already have.
    fn role_specs(
        &self,
        existing: Option<&EnvironmentDetails>,
        binary: &BinaryOption,
    ) -> Result<BTreeMap<Role, RoleSpec>, DeployError> {
        let mut specs = BTreeMap::new();
        for role in Role::iter() {
            let stored = existing.and_then(|details| details.roles.get(&role).cloned());
            let mut spec = match &stored {
                Some(spec) => spec.clone(),
                None => self.environment_type.default_role_spec(self.provider, role),
            };
            if let Some(count) = self.vm_counts.get(&role) {
                let count = match &stored {
                    Some(stored) => grow_only("VM count", Some(*count), stored.vm_count)?,
                    None => *count,
                };
                spec = spec.with_vm_count(count);
            }
            if let Some(nodes) = self.nodes_per_vm.get(&role).filter(|_| role.runs_nodes()) {
                let nodes = match &stored {
                    Some(stored) => grow_only("node count", Some(*nodes), stored.nodes_per_vm)?,
                    None => *nodes,
                };
                spec = spec.with_nodes_per_vm(nodes);
            }
            if let Some(size) = self.vm_sizes.get(&role) {
                spec.vm_size = size.clone();
            }
            if let Some(image) = self.image_ids.get(&role) {
                spec.image_id = Some(image.clone());
            }
            specs.insert(role, spec);
        }

        let derived = [
            (Role::Genesis, u16::from(!self.joins_existing_network())),
            (Role::EvmNode, u16::from(self.evm_network.requires_evm_node())),
            (Role::Build, u16::from(binary.requires_build())),
        ];
        for (role, count) in derived {
            let stored = existing
                .and_then(|details| details.roles.get(&role))
                .map_or(0, |spec| spec.vm_count);
            if let Some(spec) = specs.get_mut(&role) {
                spec.vm_count = count.max(stored);
            }
        }
        sync_gateways(&mut specs);
        Ok(specs)
    }
}

/// Options of an `upscale` run.
#[derive(Debug, Clone, Default)]
pub struct UpscaleOptions {
    pub name: String,
    pub vm_counts: BTreeMap<Role, u16>,
    pub nodes_per_vm: BTreeMap<Role, u16>,
    /// Apply the infrastructure change without provisioning the new hosts.
    pub infra_only: bool,
    /// Only report what would change.
    pub plan: bool,
    pub start_interval: Option<Duration>,
}

/// Result of an `upscale` run.
#[derive(Debug, Clone, PartialEq)]
pub enum UpscaleOutcome {
    /// `--plan`: the variables that would be applied and the infrastructure tool's plan.
    Planned {
        vars: Vec<(String, String)>,
        plan: String,
    },
    Applied(EnvironmentDetails),
}

/// Options of an `upgrade` run.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub name: String,
    pub version: Option<String>,
    pub url: Option<String>,
    pub force: bool,
    pub env_variables: Option<Vec<(String, String)>>,
    pub interval: Option<Duration>,
    pub delay: Option<Duration>,
    pub role: Option<Role>,
}

impl UpgradeRequest {
    fn source(&self) -> Result<NodeSource, DeployError> {
        match (&self.version, &self.url) {
            (Some(_), Some(_)) => Err(DeployError::ConflictingArguments {
                first: "version",
                second: "url",
            }),
            (Some(version), None) => Version::parse(version.trim_start_matches('v'))
                .map(NodeSource::Version)
                .map_err(|e| DeployError::InvalidArgument {
                    field: "version",
                    reason: e.to_string(),
                }),
            (None, Some(url)) => Url::parse(url)
                .map(NodeSource::Url)
                .map_err(|e| DeployError::InvalidArgument {
                    field: "url",
                    reason: e.to_string(),
                }),
            (None, None) => Ok(NodeSource::Latest),
        }
    }
}

/// Options of a `reset-to-n-nodes` run.
#[derive(Debug, Clone, Default)]
pub struct ResetRequest {
    pub name: String,
    pub node_count: u16,
    pub start_interval: Option<Duration>,
    pub stop_interval: Option<Duration>,
    pub version: Option<String>,
    /// Defaults to every node role except genesis.
    pub role: Option<Role>,
}

/// Top-level deployment commands.
pub struct Orchestrator<I, R, P> {
    infra: I,
    executor: R,
    playbooks: P,
    state: EnvironmentStateStore,
    resolver: BinaryResolver,
    settings: Settings,
}

impl<I, R, P> Orchestrator<I, R, P>
where
    I: InfraDriver,
    R: RemoteExecutor,
    P: PlaybookRunner,
{
    pub fn new(
        infra: I,
        executor: R,
        playbooks: P,
        state: EnvironmentStateStore,
        settings: Settings,
    ) -> Self {
        Self {
            infra,
            executor,
            playbooks,
            state,
            resolver: BinaryResolver::new(settings.artifacts.clone()),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &EnvironmentStateStore {
        &self.state
    }

    fn rollout(&self, user: &str) -> RolloutController<'_, R> {
        RolloutController::new(&self.executor, user)
            .fleet(self.settings.fleet_runner())
            .retry(self.settings.retry_policy())
            .node_manager(self.settings.node_manager.clone())
            .port_base(self.settings.port_base())
    }

    /// Create a deployment, or converge an existing one to the requested shape.
    pub async fn deploy(
        &self,
        summary: &mut RunSummary,
        options: &DeployOptions,
    ) -> Result<EnvironmentDetails> {
        // Every argument is validated before anything remote is touched.
        let binary_option = options.binary.resolve(&options.name)?;
        if let Some(address) = &options.rewards_address {
            parse_address("rewards-address", address)?;
        }

        let existing = self.state.load(&options.name).await?;
        if let Some(existing) = &existing {
            tracing::info!(name = %options.name, created_at = %existing.created_at, "Environment exists, converging");
        }
        let roles = options.role_specs(existing.as_ref(), &binary_option)?;

        self.resolver.verify(&binary_option).await?;

        let now = Utc::now();
        let mut details = EnvironmentDetails {
            name: options.name.clone(),
            provider: options.provider,
            environment_type: options.environment_type,
            region: options
                .region
                .clone()
                .unwrap_or_else(|| self.settings.region.clone()),
            network_id: options.network_id,
            evm_network: options.evm_network.clone(),
            rewards_address: options.rewards_address.clone(),
            binary_option,
            log_format: options.log_format,
            max_log_files: options.max_log_files,
            max_archived_log_files: options.max_archived_log_files,
            env_variables: options.env_variables.clone(),
            bootstrap_peer: options.bootstrap_peer.as_ref().map(Multiaddr::to_string),
            network_contacts_urls: options.network_contacts_urls.clone(),
            roles,
            created_at: existing.map(|details| details.created_at).unwrap_or(now),
            updated_at: now,
        };

        tracing::info!(
            name = %details.name,
            provider = %details.provider,
            environment_type = %details.environment_type,
            "Deploying environment..."
        );
        let interval = options
            .start_interval
            .unwrap_or_else(|| self.settings.start_interval());
        self.provision(summary, &details, interval).await?;

        details.touch();
        self.state.save(&details).await?;
        tracing::info!(name = %details.name, "Environment deployed");
        Ok(details)
    }

    /// Grow a deployment. Shrinking is rejected before anything is changed.
    pub async fn upscale(
        &self,
        summary: &mut RunSummary,
        options: &UpscaleOptions,
    ) -> Result<UpscaleOutcome> {
        let mut details = self.state.get(&options.name).await?;
        let request = ScaleRequest {
            vm_counts: options.vm_counts.clone(),
            nodes_per_vm: options.nodes_per_vm.clone(),
        };
        details.roles = scale_roles(&details.roles, &request)?;
        let infra = InfraRunOptions::from(&details);

        if options.plan {
            let plan = self.infra.plan(&infra).await?;
            return Ok(UpscaleOutcome::Planned {
                vars: infra.vars(),
                plan,
            });
        }

        if options.infra_only {
            let vms = self.infra.apply(&infra).await?;
            tracing::info!(name = %details.name, vms = vms.len(), "Infrastructure upscaled");
        } else {
            let interval = options
                .start_interval
                .unwrap_or_else(|| self.settings.start_interval());
            self.provision(summary, &details, interval).await?;
        }

        details.touch();
        self.state.save(&details).await?;
        Ok(UpscaleOutcome::Applied(details))
    }

    /// Upgrade node services in place.
    pub async fn upgrade(&self, summary: &mut RunSummary, request: &UpgradeRequest) -> Result<()> {
        let source = request.source()?;
        let mut details = self.state.get(&request.name).await?;
        let inventory = self.host_inventory(&details).await?;
        let hosts = rollout_hosts(&inventory, request.role, true)?;

        let options = UpgradeOptions {
            interval: request
                .interval
                .unwrap_or_else(|| self.settings.start_interval()),
            delay: request.delay,
            force: request.force,
            env_variables: request.env_variables.clone(),
            source: source.clone(),
        };
        self.rollout(details.provider.ssh_user())
            .upgrade(summary, &hosts, &options)
            .await?;

        if let (NodeSource::Version(version), BinaryOption::Versioned { node_version, .. }) =
            (&source, &mut details.binary_option)
        {
            *node_version = Some(version.clone());
        }
        if request.env_variables.is_some() {
            details.env_variables = request.env_variables.clone();
        }
        details.touch();
        self.state.save(&details).await
    }

    /// Service counts of every node host.
    pub async fn status(&self, name: &str) -> Result<StatusReport> {
        let details = self.state.get(name).await?;
        let inventory = self.host_inventory(&details).await?;
        let user = details.provider.ssh_user();

        let hosts = stream::iter(inventory.node_hosts())
            .map(|host| async move {
                let ip = host.public_ip.to_string();
                match self.query_status(&host, user).await {
                    Ok(output) if output.success() => match NodeRegistry::parse(&ip, &output.stdout) {
                        Ok(registry) => HostStatus::reachable(host, &registry),
                        Err(err) => HostStatus::unreachable(host, err.to_string()),
                    },
                    Ok(output) => HostStatus::unreachable(
                        host,
                        format!("status exited with {:?}: {}", output.exit_code, output.stderr.trim()),
                    ),
                    Err(err) => HostStatus::unreachable(host, format!("{err:#}")),
                }
            })
            .buffered(self.settings.forks.max(1))
            .collect()
            .await;

        Ok(StatusReport::new(name, hosts))
    }

    /// Destroy a deployment's infrastructure and remove its state.
    ///
    /// Without stored state the provider has to be supplied so the right infrastructure
    /// directory is used.
    pub async fn clean(&self, name: &str, provider: Option<CloudProvider>) -> Result<()> {
        let details = match self.state.load(name).await {
            Ok(details) => details,
            Err(err) => {
                tracing::warn!(name, error = %err, "Could not load environment state, cleaning without it");
                None
            }
        };

        let options = match details {
            Some(details) => InfraRunOptions::from(&details),
            None => InfraRunOptions {
                name: name.to_string(),
                provider: provider.ok_or(DeployError::MissingArgument {
                    missing: "provider",
                    requires: "clean of an environment without stored state",
                })?,
                environment_type: EnvironmentType::default(),
                region: self.settings.region.clone(),
                roles: BTreeMap::new(),
            },
        };

        self.infra.destroy(&options).await?;
        self.state.delete(name).await?;
        tracing::info!(name, "Environment cleaned");
        Ok(())
    }

    /// The hosts of a deployment, queried live from the infrastructure.
    pub async fn inventory(&self, name: &str, provider: Option<CloudProvider>) -> Result<HostInventory> {
        let details = self.state.get(name).await?;
        if let Some(provider) = provider.filter(|provider| *provider != details.provider) {
            return Err(DeployError::InvalidArgument {
                field: "provider",
                reason: format!("'{name}' is deployed on {}, not {provider}", details.provider),
            }
            .into());
        }
        self.host_inventory(&details).await
    }

    pub async fn start(
        &self,
        summary: &mut RunSummary,
        name: &str,
        interval: Option<Duration>,
        role: Option<Role>,
    ) -> Result<()> {
        let details = self.state.get(name).await?;
        let inventory = self.host_inventory(&details).await?;
        let hosts = rollout_hosts(&inventory, role, true)?;
        let interval = interval.unwrap_or_else(|| self.settings.start_interval());
        self.rollout(details.provider.ssh_user())
            .start(summary, &hosts, interval)
            .await;
        Ok(())
    }

    pub async fn stop(
        &self,
        summary: &mut RunSummary,
        name: &str,
        options: &StopOptions,
        role: Option<Role>,
    ) -> Result<()> {
        let details = self.state.get(name).await?;
        let inventory = self.host_inventory(&details).await?;
        let hosts = rollout_hosts(&inventory, role, true)?;
        self.rollout(details.provider.ssh_user())
            .stop(summary, &hosts, options)
            .await?;
        Ok(())
    }

    /// Replace the services on every selected host with `node_count` fresh ones.
    pub async fn reset_to_n(&self, summary: &mut RunSummary, request: &ResetRequest) -> Result<()> {
        let version = request
            .version
            .as_deref()
            .map(|version| {
                Version::parse(version.trim_start_matches('v')).map_err(|e| DeployError::InvalidArgument {
                    field: "version",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let details = self.state.get(&request.name).await?;
        let inventory = self.host_inventory(&details).await?;
        let hosts = rollout_hosts(&inventory, request.role, false)?;

        let source = match version {
            Some(version) => NodeSource::Version(version),
            None => self.resolver.node_source(&details.binary_option)?,
        };
        let options = ResetOptions {
            node_count: request.node_count,
            start_interval: request
                .start_interval
                .unwrap_or_else(|| self.settings.start_interval()),
            stop_interval: request.stop_interval,
            source,
        };
        self.rollout(details.provider.ssh_user())
            .reset_to_n(summary, &hosts, &options)
            .await?;
        Ok(())
    }

    async fn host_inventory(&self, details: &EnvironmentDetails) -> Result<HostInventory> {
        let vms = self
            .infra
            .resources(details.provider, &details.name)
            .await
            .with_context(|| format!("Failed to query the hosts of '{}'", details.name))?;
        Ok(HostInventory::new(&details.name, vms))
    }

    /// `status --json` on one host. Only a host that cannot be reached is retried.
    async fn query_status(&self, host: &VirtualMachine, user: &str) -> Result<CommandOutput> {
        let cmd = StatusCmdBuilder::new(&self.settings.node_manager.binary).build();
        self.settings
            .retry_policy()
            .retry("node manager status", || self.executor.run(host, user, &cmd))
            .await
    }
}

/// Hosts a rollout applies to: one role, or every node role.
fn rollout_hosts(
    inventory: &HostInventory,
    role: Option<Role>,
    include_genesis: bool,
) -> Result<Vec<VirtualMachine>, DeployError> {
    match role {
        Some(role) if !role.runs_nodes() => Err(DeployError::InvalidArgument {
            field: "role",
            reason: format!("{role} hosts run no node services"),
        }),
        Some(role) => Ok(inventory.role(role).to_vec()),
        None => Ok(inventory
            .node_hosts()
            .into_iter()
            .filter(|vm| include_genesis || vm.role != Role::Genesis)
            .collect()),
    }
}

/// Parse the stored bootstrap peer of a deployment.
fn stored_bootstrap_peer(details: &EnvironmentDetails) -> Result<Option<Multiaddr>, DeployError> {
    details
        .bootstrap_peer
        .as_deref()
        .map(|peer| {
            Multiaddr::from_str(peer).map_err(|e| DeployError::InvalidArgument {
                field: "peer",
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_source() {
        let request = UpgradeRequest {
            version: Some("0.3.1".to_string()),
            url: Some("https://example.com/antnode.tar.gz".to_string()),
            ..Default::default()
        };
        assert_eq!(
            request.source().unwrap_err(),
            DeployError::ConflictingArguments {
                first: "version",
                second: "url",
            }
        );

        let request = UpgradeRequest {
            version: Some("v0.3.1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            request.source().unwrap(),
            NodeSource::Version(Version::new(0, 3, 1))
        );
        assert_eq!(UpgradeRequest::default().source().unwrap(), NodeSource::Latest);
    }

    #[test]
    fn test_role_specs_derive_optional_roles() {
        let mut options = DeployOptions::new("alpha", CloudProvider::DigitalOcean);
        options.evm_network = EvmNetwork::Anvil;
        options.vm_counts.insert(Role::FullConePrivateNode, 2);
        options.nodes_per_vm.insert(Role::Node, 10);

        let binary = options.binary.resolve("alpha").unwrap();
        let specs = options.role_specs(None, &binary).unwrap();
        assert_eq!(specs[&Role::Genesis].vm_count, 1);
        assert_eq!(specs[&Role::EvmNode].vm_count, 1);
        assert_eq!(specs[&Role::Build].vm_count, 0);
        assert_eq!(specs[&Role::FullConeNatGateway].vm_count, 2);
        assert_eq!(specs[&Role::Node].nodes_per_vm, 10);
        assert_eq!(specs[&Role::Node].volume_size_gb, 10);
    }

    #[test]
    fn test_joining_network_skips_genesis() {
        let mut options = DeployOptions::new("alpha", CloudProvider::Aws);
        options.bootstrap_peer = Some("/ip4/203.0.113.1/udp/12000/quic-v1".parse().unwrap());
        let binary = options.binary.resolve("alpha").unwrap();
        assert_eq!(options.role_specs(None, &binary).unwrap()[&Role::Genesis].vm_count, 0);
    }

    #[test]
    fn test_rollout_hosts_rejects_roles_without_nodes() {
        let inventory = HostInventory::new("alpha", Vec::new());
        assert!(rollout_hosts(&inventory, Some(Role::Client), true).is_err());
        assert!(rollout_hosts(&inventory, Some(Role::Node), true).unwrap().is_empty());
    }
}
