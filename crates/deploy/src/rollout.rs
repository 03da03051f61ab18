//! Rollout controller: start, stop, upgrade and reset node services across the fleet.
//!
//! Pacing between services on one host is delegated to the node manager through its
//! `--interval` flags. Pacing between hosts is a random pre-command delay so that hosts
//! released at the same moment do not restart in lockstep.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

use crate::binary::NodeSource;
use crate::error::DeployError;
use crate::fleet::{FleetReport, FleetRunner, HostOutcome, RunSummary};
use crate::inventory::VirtualMachine;
use crate::node_manager::{
    AddNodesCmdBuilder, NodeManagerSettings, NodeMode, NodeRegistry, ResetCmdBuilder,
    StartCmdBuilder, StopCmdBuilder, UpgradeCmdBuilder,
};
use crate::remote::{RemoteExecutor, RetryPolicy};
use crate::roles::Role;
use crate::topology::{PortBase, plan_host};

/// Options for `stop`.
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Delay between consecutive service stops on a host.
    pub interval: Option<Duration>,
    /// Upper bound of the random delay before a host starts stopping.
    pub delay: Option<Duration>,
    /// Stop only these services. Empty stops everything.
    pub service_names: Vec<String>,
}

/// Options for `upgrade`.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub interval: Duration,
    /// Upper bound of the random delay before a host starts upgrading.
    pub delay: Option<Duration>,
    pub force: bool,
    pub env_variables: Option<Vec<(String, String)>>,
    pub source: NodeSource,
}

/// Options for `reset-to-n-nodes`.
#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub node_count: u16,
    pub start_interval: Duration,
    pub stop_interval: Option<Duration>,
    pub source: NodeSource,
}

/// Drives the node manager on a set of hosts.
pub struct RolloutController<'a, R: RemoteExecutor> {
    executor: &'a R,
    user: String,
    fleet: FleetRunner,
    retry: RetryPolicy,
    node_manager: NodeManagerSettings,
    port_base: PortBase,
}

impl<'a, R: RemoteExecutor> RolloutController<'a, R> {
    pub fn new(executor: &'a R, user: impl Into<String>) -> Self {
        Self {
            executor,
            user: user.into(),
            fleet: FleetRunner::default(),
            retry: RetryPolicy::default(),
            node_manager: NodeManagerSettings::default(),
            port_base: PortBase::default(),
        }
    }

    pub fn fleet(mut self, fleet: FleetRunner) -> Self {
        self.fleet = fleet;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn node_manager(mut self, settings: NodeManagerSettings) -> Self {
        self.node_manager = settings;
        self
    }

    pub fn port_base(mut self, base: PortBase) -> Self {
        self.port_base = base;
        self
    }

    /// Start every service on `hosts`.
    ///
    /// A start that keeps failing is only a warning: services are restarted by systemd and
    /// the next start converges them.
    pub async fn start(
        &self,
        summary: &mut RunSummary,
        hosts: &[VirtualMachine],
        interval: Duration,
    ) -> FleetReport {
        let report = self
            .fleet
            .run("start services", hosts, |host| async move {
                let cmd = StartCmdBuilder::new(&self.node_manager.binary, interval).build();
                Ok(self.tolerant(&host, &cmd).await)
            })
            .await;
        summary.push(report.clone());
        report
    }

    pub async fn stop(
        &self,
        summary: &mut RunSummary,
        hosts: &[VirtualMachine],
        options: &StopOptions,
    ) -> Result<FleetReport> {
        self.fleet
            .run_checked(summary, "stop services", hosts, |host| async move {
                pre_command_delay(&host, options.delay).await;
                let cmd = StopCmdBuilder::new(&self.node_manager.binary)
                    .interval(options.interval)
                    .service_names(options.service_names.iter().cloned())
                    .build();
                self.retry
                    .run_checked(self.executor, &host, &self.user, &cmd)
                    .await?;
                Ok(HostOutcome::Succeeded)
            })
            .await
    }

    pub async fn upgrade(
        &self,
        summary: &mut RunSummary,
        hosts: &[VirtualMachine],
        options: &UpgradeOptions,
    ) -> Result<FleetReport> {
        self.fleet
            .run_checked(summary, "upgrade services", hosts, |host| async move {
                pre_command_delay(&host, options.delay).await;
                let cmd = UpgradeCmdBuilder::new(&self.node_manager.binary, options.interval)
                    .force(options.force)
                    .env_variables(options.env_variables.clone())
                    .source(options.source.clone())
                    .build();
                self.retry
                    .run_checked(self.executor, &host, &self.user, &cmd)
                    .await?;
                Ok(HostOutcome::Succeeded)
            })
            .await
    }

    /// Wipe every host and re-add `node_count` services configured like the old ones.
    pub async fn reset_to_n(
        &self,
        summary: &mut RunSummary,
        hosts: &[VirtualMachine],
        options: &ResetOptions,
    ) -> Result<FleetReport> {
        self.fleet
            .run_checked(summary, "reset services", hosts, |host| async move {
                self.reset_host(&host, options).await
            })
            .await
    }

    async fn reset_host(&self, host: &VirtualMachine, options: &ResetOptions) -> Result<HostOutcome> {
        let binary = &self.node_manager.binary;

        // The registry is wiped by the reset, so its configuration is captured first.
        let output = self
            .retry
            .run_checked(self.executor, host, &self.user, &self.node_manager.read_registry_cmd())
            .await
            .context("Failed to read the node registry")?;
        let registry = NodeRegistry::parse(&host.public_ip.to_string(), &output.stdout)?;
        let Some(snapshot) = registry.snapshot() else {
            return Ok(HostOutcome::Failed(
                "registry has no services to take configuration from".to_string(),
            ));
        };
        tracing::debug!(host = %host.public_ip, services = registry.nodes.len(), "Captured registry snapshot");

        let stop = StopCmdBuilder::new(binary).interval(options.stop_interval).build();
        self.retry
            .run_checked(self.executor, host, &self.user, &stop)
            .await?;

        let reset = ResetCmdBuilder::new(binary).build();
        self.retry
            .run_checked(self.executor, host, &self.user, &reset)
            .await?;

        let Some(plan) = plan_host(options.node_count, 0, 0, self.port_base)? else {
            return Ok(HostOutcome::Skipped("no services requested".to_string()));
        };

        let add = snapshot
            .apply(AddNodesCmdBuilder::new(binary, plan.count))
            .rpc_ports(plan.rpc_ports)
            .metrics_ports(plan.metrics_ports)
            .source(options.source.clone())
            .mode(NodeMode::for_role(host.role))
            .write_older_cache_files(host.role == Role::PeerCache)
            .build();
        // `add` is not idempotent, so it is never retried.
        self.executor
            .run(host, &self.user, &add)
            .await?
            .check(binary)?;
        tracing::info!(host = %host.public_ip, count = plan.count, "Re-added services");

        let start = StartCmdBuilder::new(binary, options.start_interval).build();
        Ok(self.tolerant(host, &start).await)
    }

    /// Run a command whose non-zero exit only warrants a warning.
    async fn tolerant(&self, host: &VirtualMachine, cmd: &[String]) -> HostOutcome {
        match self
            .retry
            .run_checked(self.executor, host, &self.user, cmd)
            .await
        {
            Ok(_) => HostOutcome::Succeeded,
            Err(err) => match err.downcast_ref::<DeployError>() {
                Some(DeployError::ExternalCommandFailed { exit_code, .. }) => {
                    HostOutcome::Warning(format!("exited with {exit_code:?}: {err:#}"))
                }
                _ => HostOutcome::Failed(format!("{err:#}")),
            },
        }
    }
}

/// Sleep for a random duration in `[0, max]`.
async fn pre_command_delay(host: &VirtualMachine, max: Option<Duration>) {
    let Some(max) = max.filter(|max| !max.is_zero()) else {
        return;
    };
    let millis = rand::rng().random_range(0..=u64::try_from(max.as_millis()).unwrap_or(u64::MAX));
    tracing::debug!(host = %host.public_ip, delay_ms = millis, "Delaying before command");
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
