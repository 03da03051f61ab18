//! Concurrent fan-out of per-host work, with per-host outcomes and a failure threshold.

use std::future::Future;

use comfy_table::{Cell, Color, Table, presets::UTF8_FULL};
use futures::{StreamExt, stream};

use crate::error::DeployError;
use crate::inventory::VirtualMachine;

/// Result of one phase on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Succeeded,
    /// Nothing to do on the host.
    Skipped(String),
    /// The host failed but the run continues, e.g. a start the node manager will retry itself.
    Warning(String),
    Failed(String),
}

impl HostOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, HostOutcome::Failed(_))
    }

    fn label(&self) -> (&'static str, Color) {
        match self {
            HostOutcome::Succeeded => ("ok", Color::Green),
            HostOutcome::Skipped(_) => ("skipped", Color::Blue),
            HostOutcome::Warning(_) => ("warning", Color::Yellow),
            HostOutcome::Failed(_) => ("failed", Color::Red),
        }
    }

    fn detail(&self) -> &str {
        match self {
            HostOutcome::Succeeded => "",
            HostOutcome::Skipped(msg) | HostOutcome::Warning(msg) | HostOutcome::Failed(msg) => msg,
        }
    }
}

/// Outcome of a phase on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub host: VirtualMachine,
    pub outcome: HostOutcome,
}

/// Outcomes of one phase across the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub phase: String,
    pub hosts: Vec<HostReport>,
}

impl FleetReport {
    pub fn new(phase: impl Into<String>, hosts: Vec<HostReport>) -> Self {
        Self {
            phase: phase.into(),
            hosts,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|report| report.outcome.is_failure())
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    /// The outcome recorded for a host, if it took part in the phase.
    pub fn outcome(&self, host: &VirtualMachine) -> Option<&HostOutcome> {
        self.hosts
            .iter()
            .find(|report| report.host.public_ip == host.public_ip)
            .map(|report| &report.outcome)
    }

    /// Fail when more than `max_percentage` percent of the hosts failed.
    pub fn check_threshold(&self, max_percentage: u8) -> Result<(), DeployError> {
        let failed = self.failed_count();
        let total = self.hosts.len();
        if failed * 100 > total * usize::from(max_percentage) {
            return Err(DeployError::FailureThresholdExceeded {
                phase: self.phase.clone(),
                failed,
                total,
                max_percentage,
                failed_hosts: self
                    .failed()
                    .map(|report| format!("{} ({})", report.host.name, report.host.public_ip))
                    .collect(),
            });
        }
        Ok(())
    }
}

/// Every phase report of one command, for the final summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub reports: Vec<FleetReport>,
}

impl RunSummary {
    pub fn push(&mut self, report: FleetReport) {
        self.reports.push(report);
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Per-host success and failure table.
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["Phase", "Host", "Role", "IP", "Outcome", "Detail"]);
        for report in &self.reports {
            for host in &report.hosts {
                let (label, color) = host.outcome.label();
                table.add_row(vec![
                    Cell::new(&report.phase),
                    Cell::new(&host.host.name),
                    Cell::new(host.host.role),
                    Cell::new(host.host.public_ip),
                    Cell::new(label).fg(color),
                    Cell::new(host.outcome.detail()),
                ]);
            }
        }
        table
    }
}

/// Runs a phase concurrently across hosts, bounded by `forks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetRunner {
    pub forks: usize,
    pub max_failure_percentage: u8,
}

impl Default for FleetRunner {
    fn default() -> Self {
        Self {
            forks: 50,
            max_failure_percentage: 10,
        }
    }
}

impl FleetRunner {
    /// Run `task` on every host and collect the outcomes.
    ///
    /// An `Err` from a task is recorded as a failure of that host; it never stops the other
    /// hosts.
    pub async fn run<F, Fut>(&self, phase: &str, hosts: &[VirtualMachine], task: F) -> FleetReport
    where
        F: Fn(VirtualMachine) -> Fut,
        Fut: Future<Output = anyhow::Result<HostOutcome>>,
    {
        tracing::info!(phase, hosts = hosts.len(), "Starting phase...");

        let reports = stream::iter(hosts.iter().cloned())
            .map(|host| {
                let fut = task(host.clone());
                async move {
                    let outcome = match fut.await {
                        Ok(outcome) => outcome,
                        Err(err) => HostOutcome::Failed(format!("{err:#}")),
                    };
                    match &outcome {
                        HostOutcome::Failed(reason) => {
                            tracing::error!(phase, host = %host.public_ip, name = %host.name, %reason, "Host failed");
                        }
                        HostOutcome::Warning(reason) => {
                            tracing::warn!(phase, host = %host.public_ip, name = %host.name, %reason, "Host reported a warning");
                        }
                        _ => {
                            tracing::debug!(phase, host = %host.public_ip, "Host done");
                        }
                    }
                    HostReport { host, outcome }
                }
            })
            .buffer_unordered(self.forks.max(1))
            .collect::<Vec<_>>()
            .await;

        let report = FleetReport::new(phase, reports);
        tracing::info!(
            phase,
            hosts = report.hosts.len(),
            failed = report.failed_count(),
            "Phase complete"
        );
        report
    }

    /// Run a phase, then fail if too many hosts failed.
    pub async fn run_checked<F, Fut>(
        &self,
        summary: &mut RunSummary,
        phase: &str,
        hosts: &[VirtualMachine],
        task: F,
    ) -> anyhow::Result<FleetReport>
    where
        F: Fn(VirtualMachine) -> Fut,
        Fut: Future<Output = anyhow::Result<HostOutcome>>,
    {
        let report = self.run(phase, hosts, task).await;
        summary.push(report.clone());
        report.check_threshold(self.max_failure_percentage)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;
    use std::net::IpAddr;

    fn hosts(count: u8) -> Vec<VirtualMachine> {
        (1..=count)
            .map(|i| VirtualMachine {
                id: i.to_string(),
                name: format!("alpha-node-{i}"),
                role: Role::Node,
                public_ip: IpAddr::from([203, 0, 113, i]),
                private_ip: IpAddr::from([10, 0, 0, i]),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_hosts() {
        let runner = FleetRunner {
            forks: 4,
            max_failure_percentage: 10,
        };
        let report = runner
            .run("start", &hosts(10), |host| async move {
                if host.name.ends_with("-3") {
                    anyhow::bail!("connection refused");
                }
                Ok(HostOutcome::Succeeded)
            })
            .await;
        assert_eq!(report.hosts.len(), 10);
        assert_eq!(report.failed_count(), 1);
        // One of ten is exactly the threshold.
        assert!(report.check_threshold(10).is_ok());
    }

    #[tokio::test]
    async fn test_threshold_exceeded_lists_hosts() {
        let runner = FleetRunner::default();
        let mut summary = RunSummary::default();
        let err = runner
            .run_checked(&mut summary, "provision nodes", &hosts(5), |host| async move {
                if host.name.ends_with("-1") {
                    return Ok(HostOutcome::Failed("exit code 1".to_string()));
                }
                Ok(HostOutcome::Succeeded)
            })
            .await
            .unwrap_err();

        let err = err.downcast_ref::<DeployError>().unwrap();
        let DeployError::FailureThresholdExceeded {
            failed,
            total,
            failed_hosts,
            ..
        } = err
        else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!((*failed, *total), (1, 5));
        assert_eq!(failed_hosts, &vec!["alpha-node-1 (203.0.113.1)".to_string()]);
        assert_eq!(summary.reports.len(), 1);
    }

    #[test]
    fn test_warnings_are_not_failures() {
        let report = FleetReport::new(
            "start",
            hosts(1)
                .into_iter()
                .map(|host| HostReport {
                    host,
                    outcome: HostOutcome::Warning("exit code 1".to_string()),
                })
                .collect(),
        );
        assert!(report.check_threshold(0).is_ok());
    }
}
