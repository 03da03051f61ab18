//! Host inventory grouped by role, rebuilt from the infrastructure on every run.

use std::collections::BTreeMap;
use std::net::IpAddr;

use comfy_table::{Table, presets::UTF8_FULL};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DeployError;
use crate::roles::Role;

/// A provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    /// Resource name, conventionally `{deployment}-{role}-{ordinal}`.
    pub name: String,
    pub role: Role,
    pub public_ip: IpAddr,
    pub private_ip: IpAddr,
}

impl VirtualMachine {
    /// 1-based ordinal parsed from the trailing `-N` of the name.
    pub fn ordinal(&self) -> Option<u16> {
        self.name.rsplit('-').next()?.parse().ok()
    }

    /// Where a peer-cache VM serves its bootstrap cache.
    pub fn bootstrap_cache_url(&self) -> Option<Url> {
        Url::parse(&format!("http://{}/bootstrap_cache.json", self.public_ip)).ok()
    }
}

/// Every VM of a deployment, grouped by role and ordered by ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInventory {
    pub name: String,
    hosts: BTreeMap<Role, Vec<VirtualMachine>>,
}

impl HostInventory {
    pub fn new(name: impl Into<String>, vms: impl IntoIterator<Item = VirtualMachine>) -> Self {
        let mut hosts: BTreeMap<Role, Vec<VirtualMachine>> = BTreeMap::new();
        for vm in vms {
            hosts.entry(vm.role).or_default().push(vm);
        }
        for vms in hosts.values_mut() {
            vms.sort_by(|a, b| a.ordinal().cmp(&b.ordinal()).then_with(|| a.name.cmp(&b.name)));
        }
        Self {
            name: name.into(),
            hosts,
        }
    }

    /// VMs of one role.
    pub fn role(&self, role: Role) -> &[VirtualMachine] {
        self.hosts.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn all(&self) -> impl Iterator<Item = &VirtualMachine> {
        self.hosts.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// VMs running node services.
    pub fn node_hosts(&self) -> Vec<VirtualMachine> {
        self.all().filter(|vm| vm.role.runs_nodes()).cloned().collect()
    }

    pub fn genesis(&self) -> Option<&VirtualMachine> {
        self.role(Role::Genesis).first()
    }

    pub fn evm_node(&self) -> Option<&VirtualMachine> {
        self.role(Role::EvmNode).first()
    }

    /// Bootstrap cache URLs served by the peer-cache hosts.
    pub fn network_contacts_urls(&self) -> Vec<Url> {
        self.role(Role::PeerCache)
            .iter()
            .filter_map(VirtualMachine::bootstrap_cache_url)
            .collect()
    }

    /// Pair every VM of a private role with the gateway VM that has the same ordinal.
    pub fn nat_pairs(
        &self,
        private_role: Role,
    ) -> Result<Vec<(VirtualMachine, VirtualMachine)>, DeployError> {
        let Some(gateway_role) = private_role.gateway() else {
            return Ok(Vec::new());
        };
        let gateways = self.role(gateway_role);
        self.role(private_role)
            .iter()
            .map(|private| {
                gateways
                    .iter()
                    .find(|gateway| gateway.ordinal().is_some() && gateway.ordinal() == private.ordinal())
                    .map(|gateway| (private.clone(), gateway.clone()))
                    .ok_or_else(|| DeployError::NatGatewayMissing(private.name.clone()))
            })
            .collect()
    }

    /// Table of every host, for the `inventory` command.
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["Role", "Name", "Public IP", "Private IP"]);
        for vm in self.all() {
            table.add_row(vec![
                vm.role.to_string(),
                vm.name.clone(),
                vm.public_ip.to_string(),
                vm.private_ip.to_string(),
            ]);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, role: Role, last_octet: u8) -> VirtualMachine {
        VirtualMachine {
            id: format!("id-{name}"),
            name: name.to_string(),
            role,
            public_ip: IpAddr::from([203, 0, 113, last_octet]),
            private_ip: IpAddr::from([10, 0, 0, last_octet]),
        }
    }

    #[test]
    fn test_grouping_and_order() {
        let inventory = HostInventory::new(
            "alpha",
            vec![
                vm("alpha-node-10", Role::Node, 10),
                vm("alpha-node-2", Role::Node, 2),
                vm("alpha-genesis-1", Role::Genesis, 1),
                vm("alpha-client-1", Role::Client, 30),
            ],
        );
        let names: Vec<_> = inventory.role(Role::Node).iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, vec!["alpha-node-2", "alpha-node-10"]);
        assert_eq!(inventory.node_hosts().len(), 3);
        assert_eq!(inventory.len(), 4);
        assert!(inventory.role(Role::PeerCache).is_empty());
        assert_eq!(inventory.genesis().unwrap().name, "alpha-genesis-1");
    }

    #[test]
    fn test_nat_pairs_by_ordinal() {
        let inventory = HostInventory::new(
            "alpha",
            vec![
                vm("alpha-full-cone-private-node-1", Role::FullConePrivateNode, 11),
                vm("alpha-full-cone-private-node-2", Role::FullConePrivateNode, 12),
                vm("alpha-full-cone-nat-gateway-2", Role::FullConeNatGateway, 22),
                vm("alpha-full-cone-nat-gateway-1", Role::FullConeNatGateway, 21),
            ],
        );
        let pairs = inventory.nat_pairs(Role::FullConePrivateNode).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1.name, "alpha-full-cone-nat-gateway-1");
        assert_eq!(pairs[1].1.name, "alpha-full-cone-nat-gateway-2");
    }

    #[test]
    fn test_missing_gateway() {
        let inventory = HostInventory::new(
            "alpha",
            vec![vm("alpha-symmetric-private-node-1", Role::SymmetricPrivateNode, 11)],
        );
        assert_eq!(
            inventory.nat_pairs(Role::SymmetricPrivateNode).unwrap_err(),
            DeployError::NatGatewayMissing("alpha-symmetric-private-node-1".to_string())
        );
    }

    #[test]
    fn test_network_contacts() {
        let inventory = HostInventory::new("alpha", vec![vm("alpha-peer-cache-1", Role::PeerCache, 5)]);
        assert_eq!(
            inventory.network_contacts_urls()[0].as_str(),
            "http://203.0.113.5/bootstrap_cache.json"
        );
    }
}
