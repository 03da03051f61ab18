//! The provisioning pipeline shared by `deploy` and `upscale`.
//!
//! Phases run strictly in order and each waits for its whole fan-out: infrastructure, base
//! user, storage, role software, genesis, the other node roles, clients, service start.
//! Every step checks the remote state first, so re-running a failed pipeline is safe.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use super::{Orchestrator, stored_bootstrap_peer};
use crate::ansible::{ExtraVars, Playbook, PlaybookRunner};
use crate::binary::{BinaryOption, NodeSource};
use crate::environment::{ANVIL_RPC_PORT, EnvironmentDetails, EvmNetwork};
use crate::fleet::{FleetReport, HostOutcome, HostReport, RunSummary};
use crate::genesis::{BootstrapPeer, BootstrapSources, GenesisState};
use crate::infra::{InfraDriver, InfraRunOptions};
use crate::inventory::{HostInventory, VirtualMachine};
use crate::node_manager::{AddNodesCmdBuilder, NodeMode, NodeRegistry};
use crate::remote::RemoteExecutor;
use crate::roles::Role;
use crate::topology::host_services;

/// Values every phase of one pipeline run shares.
struct ProvisionContext<'a> {
    details: &'a EnvironmentDetails,
    inventory: HostInventory,
    user: &'static str,
    node_source: NodeSource,
    /// The payment network with presets resolved to concrete endpoints.
    evm_network: EvmNetwork,
}

impl ProvisionContext<'_> {
    /// An `add` command carrying the deployment-wide service configuration.
    fn add_builder(&self, binary: &str, count: u16) -> AddNodesCmdBuilder {
        let details = self.details;
        AddNodesCmdBuilder::new(binary, count)
            .rewards_address(details.rewards_address.clone())
            .network_id(details.network_id)
            .log_format(details.log_format)
            .max_log_files(details.max_log_files)
            .max_archived_log_files(details.max_archived_log_files)
            .env_variables(details.env_variables.clone())
            .source(self.node_source.clone())
            .evm_network(Some(self.evm_network.clone()))
    }

    fn base_vars(&self) -> ExtraVars {
        ExtraVars::new()
            .add("testnet_name", &self.details.name)
            .add("provider", self.details.provider)
    }
}

impl<I, R, P> Orchestrator<I, R, P>
where
    I: InfraDriver,
    R: RemoteExecutor,
    P: PlaybookRunner,
{
    /// Converge infrastructure and services to `details`, then start every service.
    pub(super) async fn provision(
        &self,
        summary: &mut RunSummary,
        details: &EnvironmentDetails,
        start_interval: Duration,
    ) -> Result<HostInventory> {
        let explicit_peer = stored_bootstrap_peer(details)?;

        let vms = self
            .infra
            .apply(&InfraRunOptions::from(details))
            .await
            .with_context(|| format!("Failed to apply the infrastructure of '{}'", details.name))?;
        let inventory = HostInventory::new(&details.name, vms);
        tracing::info!(name = %details.name, hosts = inventory.len(), "Built host inventory");

        let mut nat_pairs = BTreeMap::new();
        for role in [Role::FullConePrivateNode, Role::SymmetricPrivateNode] {
            nat_pairs.insert(role, inventory.nat_pairs(role)?);
        }

        let evm_network = details
            .evm_network
            .resolve(inventory.evm_node().map(|vm| vm.public_ip))?;
        let ctx = ProvisionContext {
            details,
            node_source: self.resolver.node_source(&details.binary_option)?,
            user: details.provider.ssh_user(),
            evm_network,
            inventory,
        };

        self.build_binaries(summary, &ctx).await?;

        let all: Vec<VirtualMachine> = ctx.inventory.all().cloned().collect();
        self.play(summary, &ctx, Playbook::BaseUser, &all, ctx.base_vars())
            .await?;

        for role in Role::node_roles() {
            let spec = details.role_spec(role);
            if !spec.has_volumes() {
                continue;
            }
            let vars = ctx
                .base_vars()
                .add("attached_volumes", spec.volumes_per_vm)
                .add("volume_size_gb", spec.volume_size_gb);
            self.play(summary, &ctx, Playbook::Storage, ctx.inventory.role(role), vars)
                .await?;
        }

        let node_hosts = ctx.inventory.node_hosts();
        let vars = ctx
            .base_vars()
            .add("node_manager_binary", &self.settings.node_manager.binary)
            .add_opt(
                "node_manager_archive_url",
                self.resolver.node_manager_url(&details.binary_option)?,
            );
        self.play(summary, &ctx, Playbook::NodeManager, &node_hosts, vars)
            .await?;

        if details.evm_network.requires_evm_node() {
            let vars = ctx.base_vars().add("anvil_port", ANVIL_RPC_PORT);
            self.play(summary, &ctx, Playbook::EvmNode, ctx.inventory.role(Role::EvmNode), vars)
                .await?;
        }

        let genesis_registry = match ctx.inventory.genesis() {
            Some(genesis) => Some(self.ensure_genesis(summary, &ctx, genesis, start_interval).await?),
            None => None,
        };

        let genesis_ip = ctx.inventory.genesis().map(|vm| vm.public_ip.to_string());
        let peer_cache_urls = if explicit_peer.is_none()
            && details.network_contacts_urls.is_empty()
            && genesis_ip.is_none()
        {
            self.serving_peer_caches(&ctx).await?
        } else {
            Vec::new()
        };
        let bootstrap = BootstrapSources {
            explicit_peer,
            explicit_contacts: details.network_contacts_urls.clone(),
            genesis: genesis_ip.as_deref().zip(genesis_registry.as_ref()),
            peer_cache_urls,
        }
        .resolve()?;
        tracing::info!(peer = ?bootstrap.peer(), contacts = ?bootstrap.network_contacts(), "Resolved bootstrap peer");

        if let (Some(genesis), Some(rpc_addr)) = (
            ctx.inventory.genesis(),
            genesis_registry
                .as_ref()
                .and_then(NodeRegistry::genesis_rpc_socket_addr),
        ) {
            let vars = ctx
                .base_vars()
                .add("genesis_rpc_socket_addr", rpc_addr)
                .add_opt("client_archive_url", self.resolver.client_url(&details.binary_option)?);
            self.play(summary, &ctx, Playbook::RpcClient, std::slice::from_ref(genesis), vars)
                .await?;
        }

        // Extra services on the genesis host join through the genesis service.
        self.add_nodes(summary, &ctx, Role::Genesis, &bootstrap).await?;

        for role in Role::provisioning_order() {
            if ctx.inventory.role(role).is_empty() {
                continue;
            }
            if let Some(pairs) = nat_pairs.get(&role) {
                self.route_private_nodes(summary, &ctx, role, pairs).await?;
            }
            self.add_nodes(summary, &ctx, role, &bootstrap).await?;
            if role == Role::PeerCache {
                self.play(
                    summary,
                    &ctx,
                    Playbook::PeerCacheWebServer,
                    ctx.inventory.role(Role::PeerCache),
                    ctx.base_vars(),
                )
                .await?;
            }
        }

        self.install_clients(summary, &ctx, &bootstrap).await?;

        self.rollout(ctx.user)
            .start(summary, &node_hosts, start_interval)
            .await;

        Ok(ctx.inventory)
    }

    /// Bootstrap cache URLs of the peer-cache hosts that already run services.
    async fn serving_peer_caches(&self, ctx: &ProvisionContext<'_>) -> Result<Vec<Url>> {
        let mut urls = Vec::new();
        for host in ctx.inventory.role(Role::PeerCache) {
            let ip = host.public_ip.to_string();
            let services = host_services(&ip, self.query_status(host, ctx.user).await)?;
            if services.active == 0 {
                tracing::debug!(host = %ip, "Peer cache has no services yet, not used for bootstrap");
                continue;
            }
            urls.extend(host.bootstrap_cache_url());
        }
        Ok(urls)
    }

    /// Run a playbook, record its report and enforce the failure threshold.
    async fn play(
        &self,
        summary: &mut RunSummary,
        ctx: &ProvisionContext<'_>,
        playbook: Playbook,
        hosts: &[VirtualMachine],
        vars: ExtraVars,
    ) -> Result<FleetReport> {
        if hosts.is_empty() {
            return Ok(FleetReport::new(playbook.to_string(), Vec::new()));
        }
        let report = self
            .playbooks
            .run(playbook, hosts, ctx.user, &vars)
            .await
            .with_context(|| format!("Failed to run the {playbook} playbook"))?;
        summary.push(report.clone());
        report.check_threshold(self.settings.max_failure_percentage)?;
        Ok(report)
    }

    async fn build_binaries(&self, summary: &mut RunSummary, ctx: &ProvisionContext<'_>) -> Result<()> {
        let BinaryOption::BuildFromSource {
            repo_owner,
            branch,
            testnet,
            chunk_size,
            payment_token_address,
            data_payments_address,
        } = &ctx.details.binary_option
        else {
            return Ok(());
        };

        let vars = ctx
            .base_vars()
            .add("org", repo_owner)
            .add("branch", branch)
            .add("testnet", testnet)
            .add("artifact_bucket_url", &self.resolver.settings().build_bucket_url)
            .add_opt("chunk_size", *chunk_size)
            .add_opt("payment_token_address", payment_token_address.as_ref())
            .add_opt("data_payments_address", data_payments_address.as_ref());
        self.play(summary, ctx, Playbook::Build, ctx.inventory.role(Role::Build), vars)
            .await?;
        Ok(())
    }

    /// Make sure exactly one genesis service exists and return the genesis host's registry.
    async fn ensure_genesis(
        &self,
        summary: &mut RunSummary,
        ctx: &ProvisionContext<'_>,
        host: &VirtualMachine,
        start_interval: Duration,
    ) -> Result<NodeRegistry> {
        let ip = host.public_ip.to_string();
        let binary = &self.settings.node_manager.binary;

        let services = host_services(&ip, self.query_status(host, ctx.user).await)?;
        let mut state = GenesisState::observe(services.registry.as_ref());
        if !state.needs_add() {
            tracing::info!(host = %ip, "Genesis service already exists");
            summary.push(FleetReport::new(
                "provision genesis",
                vec![HostReport {
                    host: host.clone(),
                    outcome: HostOutcome::Skipped("genesis service already exists".to_string()),
                }],
            ));
            return Ok(services.registry.unwrap_or_default());
        }

        let plan = services
            .plan(services.active.saturating_add(1), self.settings.port_base())?
            .context("No port left for the genesis service")?;
        let cmd = ctx
            .add_builder(binary, plan.count)
            .first(true)
            .rpc_ports(plan.rpc_ports)
            .metrics_ports(plan.metrics_ports)
            .build();
        tracing::info!(host = %ip, rpc_port = %plan.rpc_ports, "Adding genesis service...");
        self.executor
            .run(host, ctx.user, &cmd)
            .await?
            .check(binary)
            .context("Failed to add the genesis service")?;
        state = state.added();

        // The genesis service has to be running before its listen address is known.
        self.rollout(ctx.user)
            .start(summary, std::slice::from_ref(host), start_interval)
            .await;

        let registry = host_services(&ip, self.query_status(host, ctx.user).await)?.registry;
        state = state.confirm(registry.as_ref());
        if state != GenesisState::Active {
            anyhow::bail!("Genesis service on {ip} is not reported after being added (state: {state})");
        }
        tracing::info!(host = %ip, "Genesis service active");
        summary.push(FleetReport::new(
            "provision genesis",
            vec![HostReport {
                host: host.clone(),
                outcome: HostOutcome::Succeeded,
            }],
        ));
        Ok(registry.unwrap_or_default())
    }

    /// Add the missing services on every host of `role`.
    async fn add_nodes(
        &self,
        summary: &mut RunSummary,
        ctx: &ProvisionContext<'_>,
        role: Role,
        bootstrap: &BootstrapPeer,
    ) -> Result<()> {
        let hosts = ctx.inventory.role(role);
        if hosts.is_empty() {
            return Ok(());
        }
        let desired = ctx.details.role_spec(role).nodes_per_vm;
        let binary = &self.settings.node_manager.binary;
        let port_base = self.settings.port_base();

        self.settings
            .fleet_runner()
            .run_checked(summary, &format!("provision {role}"), hosts, |host| async move {
                let ip = host.public_ip.to_string();
                let services = host_services(&ip, self.query_status(&host, ctx.user).await)?;
                let current = services.active;
                let Some(plan) = services.plan(desired, port_base)? else {
                    tracing::debug!(host = %ip, %role, current, desired, "Nothing to add");
                    return Ok(HostOutcome::Skipped(format!("{current} of {desired} services present")));
                };

                let cmd = bootstrap
                    .apply(ctx.add_builder(binary, plan.count))
                    .rpc_ports(plan.rpc_ports)
                    .metrics_ports(plan.metrics_ports)
                    .mode(NodeMode::for_role(role))
                    .write_older_cache_files(role == Role::PeerCache)
                    .build();
                tracing::info!(host = %ip, %role, current, count = plan.count, rpc_ports = %plan.rpc_ports, "Adding services...");
                self.executor.run(&host, ctx.user, &cmd).await?.check(binary)?;
                Ok(HostOutcome::Succeeded)
            })
            .await?;
        Ok(())
    }

    /// Configure the gateways of a private role and route its VMs through them.
    async fn route_private_nodes(
        &self,
        summary: &mut RunSummary,
        ctx: &ProvisionContext<'_>,
        role: Role,
        pairs: &[(VirtualMachine, VirtualMachine)],
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut routed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut gateways: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut gateway_hosts = Vec::new();
        for (private, gateway) in pairs {
            routed
                .entry(gateway.public_ip.to_string())
                .or_default()
                .push(private.private_ip.to_string());
            gateways.insert(
                private.public_ip.to_string(),
                vec![gateway.private_ip.to_string()],
            );
            gateway_hosts.push(gateway.clone());
        }

        let vars = ctx
            .base_vars()
            .add("nat_type", role)
            .add_map("nat_private_hosts", routed);
        self.play(summary, ctx, Playbook::NatGateway, &gateway_hosts, vars)
            .await?;

        let vars = ctx.base_vars().add_map("nat_gateway_private_ip", gateways);
        self.play(summary, ctx, Playbook::PrivateNodeRouting, ctx.inventory.role(role), vars)
            .await?;
        Ok(())
    }

    async fn install_clients(
        &self,
        summary: &mut RunSummary,
        ctx: &ProvisionContext<'_>,
        bootstrap: &BootstrapPeer,
    ) -> Result<()> {
        let clients = ctx.inventory.role(Role::Client);
        if clients.is_empty() {
            return Ok(());
        }

        let mut contacts = bootstrap.network_contacts();
        contacts.extend(ctx.inventory.network_contacts_urls().iter().map(ToString::to_string));
        contacts.sort();
        contacts.dedup();

        let mut vars = ctx
            .base_vars()
            .add_opt("client_archive_url", self.resolver.client_url(&ctx.details.binary_option)?)
            .add_opt("genesis_multiaddr", bootstrap.peer())
            .add_nonempty_list("network_contacts_url", contacts)
            .add_opt("client_secret_key", ctx.details.evm_network.funded_client_key());
        vars = match &ctx.evm_network {
            EvmNetwork::Custom(custom) => vars
                .add("evm_network_type", "evm-custom")
                .add("evm_rpc_url", &custom.rpc_url)
                .add("evm_payment_token_address", custom.payment_token_address)
                .add("evm_data_payments_address", custom.data_payments_address),
            other => vars.add(
                "evm_network_type",
                other.add_args().first().cloned().unwrap_or_default(),
            ),
        };
        self.play(summary, ctx, Playbook::Clients, clients, vars)
            .await?;
        Ok(())
    }
}
