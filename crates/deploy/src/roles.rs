//! VM roles and their per-role sizing.

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Size of storage required by a single node service, in GB.
const STORAGE_REQUIRED_PER_NODE_GB: u16 = 7;

/// Number of volumes attached to every node VM.
pub const ATTACHED_VOLUMES_PER_VM: u16 = 7;

/// The category of a VM in a deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Role {
    /// Hosts the single node started with `--first`.
    Genesis,
    /// Serves a cached peer list over HTTP for fast bootstrapping.
    PeerCache,
    /// Publicly reachable node VM.
    Node,
    /// Node VM routed through a full-cone NAT gateway.
    FullConePrivateNode,
    /// Node VM routed through a symmetric NAT gateway.
    SymmetricPrivateNode,
    /// Private node VM that relies on UPnP port mapping.
    UpnpNode,
    /// Uploader/downloader client VM.
    Client,
    /// Local EVM payment network.
    EvmNode,
    /// Builds binaries from source and uploads them to the artifact store.
    Build,
    /// NAT gateway with full-cone behaviour.
    FullConeNatGateway,
    /// NAT gateway with symmetric behaviour.
    SymmetricNatGateway,
}

impl Role {
    /// Name of the terraform resource group for this role.
    ///
    /// Counts are passed as `<name>_vm_count`, sizes as `<name>_vm_size` and so on.
    pub fn resource_name(&self) -> &'static str {
        match self {
            Role::Genesis => "genesis_node",
            Role::PeerCache => "peer_cache_node",
            Role::Node => "node",
            Role::FullConePrivateNode => "full_cone_private_node",
            Role::SymmetricPrivateNode => "symmetric_private_node",
            Role::UpnpNode => "upnp_private_node",
            Role::Client => "client",
            Role::EvmNode => "evm_node",
            Role::Build => "build",
            Role::FullConeNatGateway => "full_cone_nat_gateway",
            Role::SymmetricNatGateway => "symmetric_nat_gateway",
        }
    }

    /// Reverse of [`Role::resource_name`].
    pub fn from_resource_name(name: &str) -> Option<Self> {
        Role::iter().find(|role| role.resource_name() == name)
    }

    /// Whether VMs of this role run node services tracked by the node manager.
    pub fn runs_nodes(&self) -> bool {
        matches!(
            self,
            Role::Genesis
                | Role::PeerCache
                | Role::Node
                | Role::FullConePrivateNode
                | Role::SymmetricPrivateNode
                | Role::UpnpNode
        )
    }

    /// Whether VMs of this role are only reachable through a NAT gateway.
    pub fn is_private(&self) -> bool {
        matches!(self, Role::FullConePrivateNode | Role::SymmetricPrivateNode)
    }

    /// The gateway role that routes traffic for a private role.
    pub fn gateway(&self) -> Option<Role> {
        match self {
            Role::FullConePrivateNode => Some(Role::FullConeNatGateway),
            Role::SymmetricPrivateNode => Some(Role::SymmetricNatGateway),
            _ => None,
        }
    }

    /// Node roles in the order they are provisioned after genesis.
    pub fn provisioning_order() -> [Role; 5] {
        [
            Role::PeerCache,
            Role::Node,
            Role::FullConePrivateNode,
            Role::SymmetricPrivateNode,
            Role::UpnpNode,
        ]
    }

    /// Every role that runs node services, genesis included.
    pub fn node_roles() -> impl Iterator<Item = Role> {
        Role::iter().filter(Role::runs_nodes)
    }
}

/// Sizing for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Number of VMs.
    pub vm_count: u16,
    /// Provider-specific machine size.
    pub vm_size: String,
    /// Machine image override; the tfvars image is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Node services to run on each VM of this role.
    pub nodes_per_vm: u16,
    /// Attached volumes per VM.
    pub volumes_per_vm: u16,
    /// Size of each attached volume in GB. Zero means no volume resources.
    pub volume_size_gb: u16,
}

impl RoleSpec {
    /// A spec for a role without node services or volumes.
    pub fn plain(vm_count: u16, vm_size: impl Into<String>) -> Self {
        Self {
            vm_count,
            vm_size: vm_size.into(),
            image_id: None,
            nodes_per_vm: 0,
            volumes_per_vm: 0,
            volume_size_gb: 0,
        }
    }

    /// A spec for a node role, with volumes sized from the node count.
    pub fn nodes(vm_count: u16, vm_size: impl Into<String>, nodes_per_vm: u16) -> Self {
        Self {
            vm_count,
            vm_size: vm_size.into(),
            image_id: None,
            nodes_per_vm,
            volumes_per_vm: ATTACHED_VOLUMES_PER_VM,
            volume_size_gb: attached_volume_size(nodes_per_vm),
        }
    }

    /// The same spec with a different VM count.
    pub fn with_vm_count(mut self, vm_count: u16) -> Self {
        self.vm_count = vm_count;
        self
    }

    /// The same spec with a different node count, resizing volumes to match.
    pub fn with_nodes_per_vm(mut self, nodes_per_vm: u16) -> Self {
        self.nodes_per_vm = nodes_per_vm;
        if self.volumes_per_vm > 0 {
            self.volume_size_gb = attached_volume_size(nodes_per_vm);
        }
        self
    }

    /// Whether volume resources should exist at all for this role.
    pub fn has_volumes(&self) -> bool {
        self.volume_size_gb > 0 && self.volumes_per_vm > 0
    }
}

/// Size of each attached volume for a VM running `nodes_per_vm` nodes.
///
/// Returns 0 for VMs without nodes, which suppresses the volume resources entirely.
pub fn attached_volume_size(nodes_per_vm: u16) -> u16 {
    if nodes_per_vm == 0 {
        return 0;
    }
    let total = u32::from(nodes_per_vm) * u32::from(STORAGE_REQUIRED_PER_NODE_GB);
    total.div_ceil(u32::from(ATTACHED_VOLUMES_PER_VM)) as u16
}
