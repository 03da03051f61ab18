//! Resolution of node and client binaries to release artifacts or source builds.

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::environment::parse_address;
use crate::error::DeployError;

/// Target triple every Linux binary is built for.
pub const TARGET_TRIPLE: &str = "x86_64-unknown-linux-musl";

/// Binaries installed on the fleet.
pub const NODE_BINARY: &str = "antnode";
pub const NODE_MANAGER_BINARY: &str = "antctl";
pub const CLIENT_BINARY: &str = "ant";

/// How binaries are obtained for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BinaryOption {
    /// Published release artifacts. `None` lets the node manager pick the latest release.
    Versioned {
        node_version: Option<Version>,
        node_manager_version: Option<Version>,
        client_version: Option<Version>,
    },
    /// Binaries built on a build VM from a fork and branch, then uploaded to the artifact store.
    BuildFromSource {
        repo_owner: String,
        branch: String,
        /// Deployment name; part of the uploaded archive names.
        testnet: String,
        chunk_size: Option<u64>,
        payment_token_address: Option<String>,
        data_payments_address: Option<String>,
    },
}

impl BinaryOption {
    /// Whether a build VM is required.
    pub fn requires_build(&self) -> bool {
        matches!(self, BinaryOption::BuildFromSource { .. })
    }
}

/// Raw binary selection as supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct BinaryRequest {
    pub version: Option<String>,
    pub node_manager_version: Option<String>,
    pub client_version: Option<String>,
    pub branch: Option<String>,
    pub repo_owner: Option<String>,
    pub chunk_size: Option<u64>,
    pub payment_token_address: Option<String>,
    pub data_payments_address: Option<String>,
}

impl BinaryRequest {
    /// Validate the request and turn it into a [`BinaryOption`].
    ///
    /// A version and a branch are mutually exclusive, and a branch needs a repo owner.
    pub fn resolve(&self, testnet: &str) -> Result<BinaryOption, DeployError> {
        match (&self.version, &self.branch, &self.repo_owner) {
            (Some(_), Some(_), _) => Err(DeployError::ConflictingArguments {
                first: "version",
                second: "branch",
            }),
            (Some(_), None, Some(_)) => Err(DeployError::ConflictingArguments {
                first: "version",
                second: "repo-owner",
            }),
            (None, Some(_), None) => Err(DeployError::MissingArgument {
                missing: "repo-owner",
                requires: "branch",
            }),
            (None, None, Some(_)) => Err(DeployError::MissingArgument {
                missing: "branch",
                requires: "repo-owner",
            }),
            (None, Some(branch), Some(repo_owner)) => {
                if self.node_manager_version.is_some() || self.client_version.is_some() {
                    return Err(DeployError::ConflictingArguments {
                        first: "branch",
                        second: "node-manager-version",
                    });
                }
                if let Some(address) = &self.payment_token_address {
                    parse_address("payment-token-address", address)?;
                }
                if let Some(address) = &self.data_payments_address {
                    parse_address("data-payments-address", address)?;
                }
                Ok(BinaryOption::BuildFromSource {
                    repo_owner: repo_owner.clone(),
                    branch: branch.clone(),
                    testnet: testnet.to_string(),
                    chunk_size: self.chunk_size,
                    payment_token_address: self.payment_token_address.clone(),
                    data_payments_address: self.data_payments_address.clone(),
                })
            }
            (version, None, None) => {
                if self.chunk_size.is_some() {
                    return Err(DeployError::MissingArgument {
                        missing: "branch",
                        requires: "chunk-size",
                    });
                }
                Ok(BinaryOption::Versioned {
                    node_version: parse_version("version", version.as_deref())?,
                    node_manager_version: parse_version(
                        "node-manager-version",
                        self.node_manager_version.as_deref(),
                    )?,
                    client_version: parse_version("client-version", self.client_version.as_deref())?,
                })
            }
        }
    }
}

fn parse_version(field: &'static str, value: Option<&str>) -> Result<Option<Version>, DeployError> {
    value
        .map(|v| {
            Version::parse(v.trim_start_matches('v')).map_err(|e| DeployError::InvalidArgument {
                field,
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Where the node manager should fetch a binary from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeSource {
    /// Let the node manager resolve the latest release.
    Latest,
    Version(Version),
    Url(Url),
}

impl NodeSource {
    /// The flag selecting this source, absent for [`NodeSource::Latest`].
    pub fn flag(&self) -> Option<String> {
        match self {
            NodeSource::Latest => None,
            NodeSource::Version(version) => Some(format!("--version={version}")),
            NodeSource::Url(url) => Some(format!("--url={url}")),
        }
    }

    /// A raw URL cannot be compared against the installed version, so it always reinstalls.
    pub fn implies_force(&self) -> bool {
        matches!(self, NodeSource::Url(_))
    }
}

/// Base URLs of the artifact buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Flat bucket holding published releases.
    pub release_bucket_url: String,
    /// Bucket that build VMs upload archives to, keyed by org and branch.
    pub build_bucket_url: String,
    /// Issue a HEAD request for versioned artifacts before deploying.
    pub verify_release_urls: bool,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            release_bucket_url: "https://autonomi-releases.s3.eu-west-2.amazonaws.com".to_string(),
            build_bucket_url: "https://fleetnet-builds.s3.eu-west-2.amazonaws.com".to_string(),
            verify_release_urls: true,
        }
    }
}

/// Resolves binaries to URLs, optionally checking that published artifacts exist.
#[derive(Debug, Clone)]
pub struct BinaryResolver {
    settings: ArtifactSettings,
    http: reqwest::Client,
}

impl BinaryResolver {
    pub fn new(settings: ArtifactSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    pub fn settings(&self) -> &ArtifactSettings {
        &self.settings
    }

    /// URL of an archive produced by a source build.
    ///
    /// Archives are stored as `{bucket}/{org}/{branch}/{bin}-{testnet}-{target}.tar.gz`.
    pub fn build_artifact_url(
        &self,
        repo_owner: &str,
        branch: &str,
        bin: &str,
        testnet: &str,
    ) -> Result<Url> {
        join_url(
            &self.settings.build_bucket_url,
            &format!("{repo_owner}/{branch}/{bin}-{testnet}-{TARGET_TRIPLE}.tar.gz"),
        )
    }

    /// URL of a published release archive.
    pub fn release_artifact_url(&self, bin: &str, version: &Version) -> Result<Url> {
        join_url(
            &self.settings.release_bucket_url,
            &format!("{bin}-{version}-{TARGET_TRIPLE}.tar.gz"),
        )
    }

    /// Source of the node binary for the node manager.
    pub fn node_source(&self, option: &BinaryOption) -> Result<NodeSource> {
        match option {
            BinaryOption::Versioned { node_version, .. } => Ok(node_version
                .clone()
                .map(NodeSource::Version)
                .unwrap_or(NodeSource::Latest)),
            BinaryOption::BuildFromSource {
                repo_owner,
                branch,
                testnet,
                ..
            } => Ok(NodeSource::Url(self.build_artifact_url(
                repo_owner,
                branch,
                NODE_BINARY,
                testnet,
            )?)),
        }
    }

    /// URL of the node manager archive, if a specific one is required.
    pub fn node_manager_url(&self, option: &BinaryOption) -> Result<Option<Url>> {
        match option {
            BinaryOption::Versioned {
                node_manager_version: Some(version),
                ..
            } => self.release_artifact_url(NODE_MANAGER_BINARY, version).map(Some),
            BinaryOption::Versioned { .. } => Ok(None),
            BinaryOption::BuildFromSource {
                repo_owner,
                branch,
                testnet,
                ..
            } => self
                .build_artifact_url(repo_owner, branch, NODE_MANAGER_BINARY, testnet)
                .map(Some),
        }
    }

    /// URL of the client archive, if a specific one is required.
    pub fn client_url(&self, option: &BinaryOption) -> Result<Option<Url>> {
        match option {
            BinaryOption::Versioned {
                client_version: Some(version),
                ..
            } => self.release_artifact_url(CLIENT_BINARY, version).map(Some),
            BinaryOption::Versioned { .. } => Ok(None),
            BinaryOption::BuildFromSource {
                repo_owner,
                branch,
                testnet,
                ..
            } => self
                .build_artifact_url(repo_owner, branch, CLIENT_BINARY, testnet)
                .map(Some),
        }
    }

    /// Check that every pinned release artifact is published.
    pub async fn verify(&self, option: &BinaryOption) -> Result<()> {
        if !self.settings.verify_release_urls {
            return Ok(());
        }
        let BinaryOption::Versioned {
            node_version,
            node_manager_version,
            client_version,
        } = option
        else {
            return Ok(());
        };

        let pinned = [
            (NODE_BINARY, node_version),
            (NODE_MANAGER_BINARY, node_manager_version),
            (CLIENT_BINARY, client_version),
        ];
        for (bin, version) in pinned {
            let Some(version) = version else { continue };
            let url = self.release_artifact_url(bin, version)?;
            tracing::debug!(%url, "Checking release artifact...");
            let response = self
                .http
                .head(url.clone())
                .send()
                .await
                .with_context(|| format!("Failed to reach artifact store at {url}"))?;
            if !response.status().is_success() {
                anyhow::bail!(
                    "Release artifact {url} is not available (status {})",
                    response.status()
                );
            }
        }
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    let base = base.trim_end_matches('/');
    Url::parse(&format!("{base}/{path}")).with_context(|| format!("Invalid artifact URL for {path}"))
}
