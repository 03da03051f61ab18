//! Fleet topology: how many node services each host needs and which ports they get.
//!
//! Nothing here is persisted. Every plan is derived from the count the remote node manager
//! reports on the current run, so ports can never drift from the services that exist.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;
use crate::node_manager::NodeRegistry;
use crate::remote::CommandOutput;
use crate::roles::{Role, RoleSpec};

/// First port of each per-service port sequence on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBase {
    pub rpc: u16,
    pub metrics: u16,
}

impl Default for PortBase {
    fn default() -> Self {
        Self {
            rpc: 13000,
            metrics: 14000,
        }
    }
}

/// Ports handed to the node manager for a batch of new services.
///
/// The node manager accepts a single value for one service and an inclusive `start-end`
/// range otherwise, so a range of one port is never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAllocation {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl PortAllocation {
    /// Ports for `count` services starting at `base + current`.
    ///
    /// Returns `None` when nothing is added or the range would overflow the port space.
    pub fn new(base: u16, current: u16, count: u16) -> Option<Self> {
        if count == 0 {
            return None;
        }
        let start = base.checked_add(current)?;
        let end = start.checked_add(count - 1)?;
        if count == 1 {
            Some(PortAllocation::Single(start))
        } else {
            Some(PortAllocation::Range { start, end })
        }
    }

    /// Number of ports, and so of services, covered.
    pub fn count(&self) -> u16 {
        match self {
            PortAllocation::Single(_) => 1,
            PortAllocation::Range { start, end } => end - start + 1,
        }
    }

    pub fn first(&self) -> u16 {
        match self {
            PortAllocation::Single(port) => *port,
            PortAllocation::Range { start, .. } => *start,
        }
    }
}

impl fmt::Display for PortAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortAllocation::Single(port) => write!(f, "{port}"),
            PortAllocation::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

/// `max(0, desired - current)`.
pub fn nodes_to_add(desired: u16, current: u16) -> u16 {
    desired.saturating_sub(current)
}

/// Services to add on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPlan {
    pub current: u16,
    pub count: u16,
    pub rpc_ports: PortAllocation,
    pub metrics_ports: PortAllocation,
}

/// Plan the services to add on a host holding `current` of `desired` services.
///
/// New ports start after `port_offset`, the number of ports the registry already accounts
/// for. Returns `Ok(None)` when the host already has enough services.
pub fn plan_host(
    desired: u16,
    current: u16,
    port_offset: u16,
    base: PortBase,
) -> Result<Option<AddPlan>, DeployError> {
    let count = nodes_to_add(desired, current);
    if count == 0 {
        return Ok(None);
    }
    let overflow = || DeployError::InvalidArgument {
        field: "node-count",
        reason: format!("{desired} services do not fit in the port space"),
    };
    Ok(Some(AddPlan {
        current,
        count,
        rpc_ports: PortAllocation::new(base.rpc, port_offset, count).ok_or_else(overflow)?,
        metrics_ports: PortAllocation::new(base.metrics, port_offset, count)
            .ok_or_else(overflow)?,
    }))
}

/// What a status query reported about one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostServices {
    /// Services that have not been removed.
    pub active: u16,
    /// Ports held by registry entries, removed ones included.
    pub port_offset: u16,
    pub registry: Option<NodeRegistry>,
}

impl HostServices {
    /// Plan the services that bring this host up to `desired`.
    pub fn plan(&self, desired: u16, base: PortBase) -> Result<Option<AddPlan>, DeployError> {
        plan_host(desired, self.active, self.port_offset, base)
    }
}

/// Interpret the output of a `status --json` query.
///
/// A failed query means nothing is installed yet and counts as zero. Output that cannot be
/// parsed is an error: the host's state is unknown and must not be provisioned blindly.
pub fn host_services(
    host: &str,
    status: anyhow::Result<CommandOutput>,
) -> Result<HostServices, DeployError> {
    let output = match status {
        Ok(output) if output.success() => output,
        Ok(output) => {
            tracing::debug!(host, exit_code = ?output.exit_code, "Status query failed, assuming no services");
            return Ok(HostServices::default());
        }
        Err(err) => {
            tracing::debug!(host, error = %err, "Status query failed, assuming no services");
            return Ok(HostServices::default());
        }
    };
    let registry = NodeRegistry::parse(host, &output.stdout)?;
    Ok(HostServices {
        active: registry.active_count(),
        port_offset: registry.port_offset(),
        registry: Some(registry),
    })
}

/// Check a requested role count against the current one, rejecting shrinks.
pub fn grow_only(what: &'static str, desired: Option<u16>, current: u16) -> Result<u16, DeployError> {
    match desired {
        Some(desired) if desired < current => Err(DeployError::ShrinkNotSupported {
            what,
            desired,
            current,
        }),
        Some(desired) => Ok(desired),
        None => Ok(current),
    }
}

/// Requested changes to a deployment's sizing.
#[derive(Debug, Clone, Default)]
pub struct ScaleRequest {
    pub vm_counts: BTreeMap<Role, u16>,
    pub nodes_per_vm: BTreeMap<Role, u16>,
}

/// Apply a scale request to the current role specs.
///
/// NAT gateway counts always follow their private node roles.
pub fn scale_roles(
    current: &BTreeMap<Role, RoleSpec>,
    request: &ScaleRequest,
) -> Result<BTreeMap<Role, RoleSpec>, DeployError> {
    let mut desired = current.clone();
    for (role, count) in &request.vm_counts {
        let spec = current.get(role).cloned().ok_or_else(|| DeployError::InvalidArgument {
            field: "role",
            reason: format!("the deployment has no {role} role"),
        })?;
        let vm_count = grow_only("VM count", Some(*count), spec.vm_count)?;
        desired.insert(*role, spec.with_vm_count(vm_count));
    }
    for (role, count) in &request.nodes_per_vm {
        let spec = desired.get(role).cloned().ok_or_else(|| DeployError::InvalidArgument {
            field: "role",
            reason: format!("the deployment has no {role} role"),
        })?;
        let nodes = grow_only("node count", Some(*count), spec.nodes_per_vm)?;
        desired.insert(*role, spec.with_nodes_per_vm(nodes));
    }
    sync_gateways(&mut desired);
    Ok(desired)
}

/// Size every NAT gateway role to match its private node role.
pub fn sync_gateways(specs: &mut BTreeMap<Role, RoleSpec>) {
    for role in [Role::FullConePrivateNode, Role::SymmetricPrivateNode] {
        let Some(gateway) = role.gateway() else { continue };
        let Some(private) = specs.get(&role).cloned() else {
            continue;
        };
        specs
            .entry(gateway)
            .or_insert_with(|| RoleSpec::plain(0, private.vm_size.clone()))
            .vm_count = private.vm_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_to_add() {
        for desired in 0..10u16 {
            for current in 0..10u16 {
                let expected = if desired > current { desired - current } else { 0 };
                assert_eq!(nodes_to_add(desired, current), expected);
            }
        }
    }

    #[test]
    fn test_port_range() {
        let plan = plan_host(8, 5, 5, PortBase::default()).unwrap().unwrap();
        assert_eq!(plan.count, 3);
        assert_eq!(plan.rpc_ports.to_string(), "13005-13007");
        assert_eq!(plan.metrics_ports.to_string(), "14005-14007");
        assert_eq!(plan.rpc_ports.count(), 3);
    }

    #[test]
    fn test_single_port() {
        let plan = plan_host(6, 5, 5, PortBase::default()).unwrap().unwrap();
        assert_eq!(plan.rpc_ports, PortAllocation::Single(13005));
        assert_eq!(plan.rpc_ports.to_string(), "13005");
    }

    #[test]
    fn test_no_plan_when_satisfied() {
        assert_eq!(plan_host(5, 5, 5, PortBase::default()).unwrap(), None);
        assert_eq!(plan_host(2, 5, 5, PortBase::default()).unwrap(), None);
    }

    #[test]
    fn test_port_overflow() {
        let base = PortBase {
            rpc: 65530,
            metrics: 14000,
        };
        assert!(plan_host(10, 0, 0, base).is_err());
    }

    #[test]
    fn test_failed_status_counts_as_zero() {
        let services = host_services("10.0.0.1", Err(anyhow::anyhow!("ssh failed"))).unwrap();
        assert_eq!(services.active, 0);
        assert!(services.registry.is_none());

        let output = CommandOutput {
            exit_code: Some(127),
            stdout: String::new(),
            stderr: "antctl: command not found".to_string(),
        };
        assert_eq!(host_services("10.0.0.1", Ok(output)).unwrap().active, 0);
    }

    #[test]
    fn test_removed_services_keep_their_ports() {
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: r#"{"nodes": [
                {"service_name": "antnode1", "number": 1, "rpc_socket_addr": "127.0.0.1:13000", "status": "Running"},
                {"service_name": "antnode2", "number": 2, "rpc_socket_addr": "127.0.0.1:13001", "status": "Removed"},
                {"service_name": "antnode3", "number": 3, "rpc_socket_addr": "127.0.0.1:13002", "status": "Running"}
            ]}"#
            .to_string(),
            stderr: String::new(),
        };
        let services = host_services("10.0.0.1", Ok(output)).unwrap();
        assert_eq!(services.active, 2);
        assert_eq!(services.port_offset, 3);

        let plan = services.plan(3, PortBase::default()).unwrap().unwrap();
        assert_eq!(plan.count, 1);
        assert_eq!(plan.rpc_ports, PortAllocation::Single(13003));
        assert_eq!(plan.metrics_ports, PortAllocation::Single(14003));
    }

    #[test]
    fn test_malformed_status_is_fatal() {
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "{\"nodes\": [".to_string(),
            stderr: String::new(),
        };
        let err = host_services("10.0.0.1", Ok(output)).unwrap_err();
        assert!(matches!(err, DeployError::MalformedRegistry { .. }));
    }

    #[test]
    fn test_scale_rejects_shrink() {
        let mut current = BTreeMap::new();
        current.insert(Role::Node, RoleSpec::nodes(3, "s-2vcpu-4gb", 10));
        let request = ScaleRequest {
            vm_counts: [(Role::Node, 2)].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(
            scale_roles(&current, &request).unwrap_err(),
            DeployError::ShrinkNotSupported {
                what: "VM count",
                desired: 2,
                current: 3,
            }
        );

        let request = ScaleRequest {
            vm_counts: [(Role::Node, 5)].into_iter().collect(),
            nodes_per_vm: [(Role::Node, 20)].into_iter().collect(),
        };
        let desired = scale_roles(&current, &request).unwrap();
        assert_eq!(desired[&Role::Node].vm_count, 5);
        assert_eq!(desired[&Role::Node].nodes_per_vm, 20);
        assert_eq!(desired[&Role::Node].volume_size_gb, 20);
    }

    #[test]
    fn test_gateways_follow_private_nodes() {
        let mut specs = BTreeMap::new();
        specs.insert(Role::FullConePrivateNode, RoleSpec::nodes(4, "s-2vcpu-4gb", 10));
        specs.insert(Role::FullConeNatGateway, RoleSpec::plain(0, "s-2vcpu-4gb"));
        sync_gateways(&mut specs);
        assert_eq!(specs[&Role::FullConeNatGateway].vm_count, 4);
    }
}
