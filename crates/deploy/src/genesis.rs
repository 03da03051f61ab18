//! Genesis sequencing and resolution of the peer every other service bootstraps from.

use multiaddr::Multiaddr;
use url::Url;

use crate::error::DeployError;
use crate::node_manager::{AddNodesCmdBuilder, NodeRegistry};

/// Progress of the genesis service of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum GenesisState {
    /// No service on the genesis host is flagged as first.
    Uninitialized,
    /// The genesis service was added but not yet confirmed by a status query.
    Pending,
    /// A status query shows a service flagged as first.
    Active,
}

impl GenesisState {
    /// State derived from a status query of the genesis host.
    pub fn observe(registry: Option<&NodeRegistry>) -> Self {
        match registry {
            Some(registry) if registry.has_genesis() => GenesisState::Active,
            _ => GenesisState::Uninitialized,
        }
    }

    /// Whether a genesis `add` has to be issued.
    pub fn needs_add(&self) -> bool {
        matches!(self, GenesisState::Uninitialized)
    }

    /// Record that the genesis `add` was issued.
    pub fn added(self) -> Self {
        match self {
            GenesisState::Uninitialized => GenesisState::Pending,
            other => other,
        }
    }

    /// Confirm a pending genesis against a fresh status query.
    pub fn confirm(self, registry: Option<&NodeRegistry>) -> Self {
        match (self, GenesisState::observe(registry)) {
            (_, GenesisState::Active) => GenesisState::Active,
            (state, _) => state,
        }
    }
}

/// How non-genesis services find the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPeer {
    Multiaddr(Multiaddr),
    NetworkContacts(Vec<Url>),
}

impl BootstrapPeer {
    /// Pass the bootstrap parameter to an `add` command.
    pub fn apply(&self, builder: AddNodesCmdBuilder) -> AddNodesCmdBuilder {
        match self {
            BootstrapPeer::Multiaddr(addr) => builder.peer(addr.to_string()),
            BootstrapPeer::NetworkContacts(urls) => {
                builder.network_contacts_urls(urls.iter().map(Url::to_string))
            }
        }
    }

    /// Value for playbooks that take a single peer.
    pub fn peer(&self) -> Option<String> {
        match self {
            BootstrapPeer::Multiaddr(addr) => Some(addr.to_string()),
            BootstrapPeer::NetworkContacts(_) => None,
        }
    }

    pub fn network_contacts(&self) -> Vec<String> {
        match self {
            BootstrapPeer::Multiaddr(_) => Vec::new(),
            BootstrapPeer::NetworkContacts(urls) => urls.iter().map(Url::to_string).collect(),
        }
    }
}

/// Candidates a bootstrap peer can be resolved from, in order of preference.
#[derive(Debug, Clone, Default)]
pub struct BootstrapSources<'a> {
    /// Peer supplied by the operator, for deployments that join an existing network.
    pub explicit_peer: Option<Multiaddr>,
    /// Network contacts supplied by the operator.
    pub explicit_contacts: Vec<Url>,
    /// Address and registry of the genesis host.
    pub genesis: Option<(&'a str, &'a NodeRegistry)>,
    /// Bootstrap cache URLs of peer-cache hosts that already run services.
    pub peer_cache_urls: Vec<Url>,
}

impl BootstrapSources<'_> {
    /// Resolve the bootstrap parameter.
    ///
    /// Operator-supplied values win, then the genesis service, then the peer caches. A
    /// deployment with a genesis host always bootstraps from it.
    pub fn resolve(self) -> Result<BootstrapPeer, DeployError> {
        if let Some(peer) = self.explicit_peer {
            return Ok(BootstrapPeer::Multiaddr(peer));
        }
        if !self.explicit_contacts.is_empty() {
            return Ok(BootstrapPeer::NetworkContacts(self.explicit_contacts));
        }
        if let Some((host, registry)) = self.genesis {
            return registry
                .bootstrap_multiaddr()
                .map(BootstrapPeer::Multiaddr)
                .ok_or_else(|| DeployError::GenesisListenAddressMissing(host.to_string()));
        }
        if !self.peer_cache_urls.is_empty() {
            return Ok(BootstrapPeer::NetworkContacts(self.peer_cache_urls));
        }
        Err(DeployError::BootstrapPeerUnresolved)
    }
}
