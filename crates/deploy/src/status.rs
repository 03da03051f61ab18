//! Per-host service counts for the `status` command.

use comfy_table::{Cell, Color, Table, presets::UTF8_FULL};

use crate::inventory::VirtualMachine;
use crate::node_manager::{NodeRegistry, ServiceStatus};

/// Node service counts on one host, or across the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceCounts {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub added: usize,
}

impl From<&NodeRegistry> for ServiceCounts {
    fn from(registry: &NodeRegistry) -> Self {
        Self {
            total: registry.active().count(),
            running: registry.count_with_status(ServiceStatus::Running),
            stopped: registry.count_with_status(ServiceStatus::Stopped),
            added: registry.count_with_status(ServiceStatus::Added),
        }
    }
}

impl std::ops::AddAssign for ServiceCounts {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.running += other.running;
        self.stopped += other.stopped;
        self.added += other.added;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    Reachable(ServiceCounts),
    /// The status query failed; the reason is kept for the report.
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub host: VirtualMachine,
    pub state: HostState,
}

impl HostStatus {
    pub fn reachable(host: VirtualMachine, registry: &NodeRegistry) -> Self {
        Self {
            host,
            state: HostState::Reachable(registry.into()),
        }
    }

    pub fn unreachable(host: VirtualMachine, reason: impl Into<String>) -> Self {
        Self {
            host,
            state: HostState::Unreachable(reason.into()),
        }
    }
}

/// Status of every node host of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub name: String,
    pub hosts: Vec<HostStatus>,
}

impl StatusReport {
    pub fn new(name: impl Into<String>, hosts: Vec<HostStatus>) -> Self {
        Self {
            name: name.into(),
            hosts,
        }
    }

    /// Counts summed over every reachable host.
    pub fn totals(&self) -> ServiceCounts {
        let mut totals = ServiceCounts::default();
        for host in &self.hosts {
            if let HostState::Reachable(counts) = host.state {
                totals += counts;
            }
        }
        totals
    }

    pub fn unreachable_count(&self) -> usize {
        self.hosts
            .iter()
            .filter(|host| matches!(host.state, HostState::Unreachable(_)))
            .count()
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec![
            "Host", "Role", "IP", "Total", "Running", "Stopped", "Added",
        ]);
        for status in &self.hosts {
            let host = &status.host;
            let mut row = vec![
                Cell::new(&host.name),
                Cell::new(host.role),
                Cell::new(host.public_ip),
            ];
            match &status.state {
                HostState::Reachable(counts) => row.extend([
                    Cell::new(counts.total),
                    Cell::new(counts.running).fg(Color::Green),
                    Cell::new(counts.stopped),
                    Cell::new(counts.added),
                ]),
                HostState::Unreachable(reason) => {
                    row.push(Cell::new(format!("unreachable: {reason}")).fg(Color::Red));
                }
            }
            table.add_row(row);
        }

        let totals = self.totals();
        table.add_row(vec![
            Cell::new("Total"),
            Cell::new(""),
            Cell::new(format!("{} unreachable", self.unreachable_count())),
            Cell::new(totals.total),
            Cell::new(totals.running),
            Cell::new(totals.stopped),
            Cell::new(totals.added),
        ]);
        table
    }
}
