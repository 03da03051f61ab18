//! Configuration-management playbooks and the runner that applies them to hosts.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use derive_more::Deref;
use serde::Serialize;
use serde_json::{Map, Value};
use tempdir::TempDir;

use crate::fleet::{FleetReport, HostOutcome, HostReport};
use crate::inventory::VirtualMachine;

/// Playbooks the orchestrator runs, in roughly the order a deployment uses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Playbook {
    /// Builds binaries from source and uploads them to the artifact store.
    Build,
    /// Creates the unprivileged service user on every host.
    BaseUser,
    /// Formats and mounts the attached volumes used for node data.
    Storage,
    /// Installs the node manager.
    NodeManager,
    /// Runs a local anvil network with the payment contracts deployed.
    EvmNode,
    /// Installs the templated RPC client unit on the genesis host.
    RpcClient,
    /// Serves the bootstrap cache of peer-cache hosts over HTTP.
    PeerCacheWebServer,
    /// Sets up NAT routing on gateway VMs.
    NatGateway,
    /// Routes private node traffic through their gateway.
    PrivateNodeRouting,
    /// Installs the uploader/downloader clients.
    Clients,
}

impl Playbook {
    /// File name under the ansible directory.
    pub fn file_name(&self) -> String {
        format!("{self}.yml")
    }
}

/// Variables passed to a playbook with `--extra-vars`.
///
/// Optional values that are unset are left out of the document entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deref)]
#[serde(transparent)]
pub struct ExtraVars(Map<String, Value>);

impl ExtraVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: &str, value: impl ToString) -> Self {
        self.0.insert(name.to_string(), Value::String(value.to_string()));
        self
    }

    /// Add a variable only when it is set.
    pub fn add_opt(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.add(name, value),
            None => self,
        }
    }

    pub fn add_list<T: ToString>(mut self, name: &str, values: impl IntoIterator<Item = T>) -> Self {
        let values = values
            .into_iter()
            .map(|value| Value::String(value.to_string()))
            .collect();
        self.0.insert(name.to_string(), Value::Array(values));
        self
    }

    /// Add a list only when it is non-empty.
    pub fn add_nonempty_list<T: ToString>(
        self,
        name: &str,
        values: impl IntoIterator<Item = T>,
    ) -> Self {
        let values: Vec<String> = values.into_iter().map(|value| value.to_string()).collect();
        if values.is_empty() {
            return self;
        }
        self.add_list(name, values)
    }

    pub fn add_map(mut self, name: &str, values: BTreeMap<String, Vec<String>>) -> Self {
        let map = values
            .into_iter()
            .map(|(key, list)| (key, Value::Array(list.into_iter().map(Value::String).collect())))
            .collect();
        self.0.insert(name.to_string(), Value::Object(map));
        self
    }

    /// JSON document for `--extra-vars`.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.0).context("Failed to serialize extra vars")
    }
}

/// Applies playbooks to sets of hosts.
pub trait PlaybookRunner: Send + Sync {
    /// Run `playbook` against `hosts` and report the outcome on each of them.
    fn run(
        &self,
        playbook: Playbook,
        hosts: &[VirtualMachine],
        user: &str,
        vars: &ExtraVars,
    ) -> impl Future<Output = Result<FleetReport>> + Send;
}

/// Runs playbooks with `ansible-playbook`.
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    ansible_dir: PathBuf,
    private_key_path: PathBuf,
    forks: usize,
}

impl AnsibleRunner {
    pub fn new(ansible_dir: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>, forks: usize) -> Self {
        Self {
            ansible_dir: ansible_dir.into(),
            private_key_path: private_key_path.into(),
            forks,
        }
    }

    fn write_inventory(dir: &Path, hosts: &[VirtualMachine]) -> Result<PathBuf> {
        let mut inventory = String::from("[fleet]\n");
        for host in hosts {
            inventory.push_str(&format!(
                "{} private_ip={} vm_name={} role={}\n",
                host.public_ip, host.private_ip, host.name, host.role
            ));
        }
        let path = dir.join("inventory.ini");
        std::fs::write(&path, inventory)
            .with_context(|| format!("Failed to write inventory to {}", path.display()))?;
        Ok(path)
    }
}

impl PlaybookRunner for AnsibleRunner {
    async fn run(
        &self,
        playbook: Playbook,
        hosts: &[VirtualMachine],
        user: &str,
        vars: &ExtraVars,
    ) -> Result<FleetReport> {
        if hosts.is_empty() {
            return Ok(FleetReport::new(playbook.to_string(), Vec::new()));
        }

        let workdir = TempDir::new("fleetnet-inventory").context("Failed to create inventory directory")?;
        let inventory = Self::write_inventory(workdir.path(), hosts)?;

        tracing::info!(%playbook, hosts = hosts.len(), "Running playbook...");

        let output = tokio::process::Command::new("ansible-playbook")
            .current_dir(&self.ansible_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .arg("--inventory")
            .arg(&inventory)
            .arg("--private-key")
            .arg(&self.private_key_path)
            .arg("--user")
            .arg(user)
            .arg("--forks")
            .arg(self.forks.to_string())
            .arg("--extra-vars")
            .arg(vars.to_json()?)
            .arg(playbook.file_name())
            .output()
            .await
            .with_context(|| format!("Failed to run ansible-playbook for {playbook}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let recap = parse_recap(&stdout);

        let reports = hosts
            .iter()
            .map(|host| {
                let outcome = match recap.get(&host.public_ip.to_string()) {
                    Some(stats) if stats.failed == 0 && stats.unreachable == 0 => HostOutcome::Succeeded,
                    Some(stats) if stats.unreachable > 0 => HostOutcome::Failed("unreachable".to_string()),
                    Some(_) => HostOutcome::Failed(last_line(&stderr, &stdout)),
                    None => HostOutcome::Failed(format!(
                        "no result reported (exit code {:?}): {}",
                        output.status.code(),
                        last_line(&stderr, &stdout)
                    )),
                };
                HostReport {
                    host: host.clone(),
                    outcome,
                }
            })
            .collect();

        Ok(FleetReport::new(playbook.to_string(), reports))
    }
}

fn last_line(stderr: &str, stdout: &str) -> String {
    stderr
        .lines()
        .chain(stdout.lines())
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Per-host counters from a `PLAY RECAP` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecapStats {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
}

/// Parse the `PLAY RECAP` section of `ansible-playbook` output.
pub fn parse_recap(stdout: &str) -> BTreeMap<String, RecapStats> {
    let mut stats = BTreeMap::new();
    let Some(start) = stdout.find("PLAY RECAP") else {
        return stats;
    };
    for line in stdout[start..].lines().skip(1) {
        let Some((host, counters)) = line.split_once(" : ") else {
            continue;
        };
        let mut entry = RecapStats::default();
        for counter in counters.split_whitespace() {
            let Some((key, value)) = counter.split_once('=') else {
                continue;
            };
            let value = value.parse().unwrap_or(0);
            match key {
                "ok" => entry.ok = value,
                "changed" => entry.changed = value,
                "unreachable" => entry.unreachable = value,
                "failed" => entry.failed = value,
                _ => {}
            }
        }
        stats.insert(host.trim().to_string(), entry);
    }
    stats
}
