//! End-to-end tests of the deployment commands against in-process fakes.
//!
//! The fakes stand in for the infrastructure tool, the playbook runner and the remote hosts.
//! The fake executor keeps a node registry per host and interprets the node manager commands
//! it receives, so repeated runs observe the state earlier runs left behind.
//! Run with: cargo test --test orchestrator_test

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use fleetnet_deploy::environment::ANVIL_DEPLOYER_SECRET_KEY;
use fleetnet_deploy::{
    ArtifactSettings, BinaryOption, CloudProvider, CommandOutput, DeployError, DeployOptions,
    EnvironmentStateStore, EvmNetwork, ExtraVars, FleetReport, HostOutcome, HostReport,
    InfraDriver, InfraRunOptions, Orchestrator, Playbook, PlaybookRunner, RemoteExecutor,
    ResetRequest, RetryPolicy, Role, RunSummary, Settings, StateStoreSettings, StoreType,
    UpgradeRequest, UpscaleOptions, UpscaleOutcome, VirtualMachine,
};
use serde_json::{Value, json};
use strum::IntoEnumIterator;

const REWARDS_ADDRESS: &str = "0x03b770d9cd32077cc0bf330c13c114a87643b124";

/// Creates one VM per requested count with stable addresses, so re-applying is a no-op.
#[derive(Clone, Default)]
struct FakeInfra {
    vms: Arc<Mutex<Vec<VirtualMachine>>>,
    applies: Arc<Mutex<usize>>,
    destroyed: Arc<Mutex<Vec<String>>>,
}

impl FakeInfra {
    fn vms_for(options: &InfraRunOptions) -> Vec<VirtualMachine> {
        let mut vms = Vec::new();
        for (role_index, role) in Role::iter().enumerate() {
            let count = options.roles.get(&role).map_or(0, |spec| spec.vm_count);
            for i in 1..=count {
                let octet = u8::try_from(i).unwrap();
                let subnet = u8::try_from(role_index).unwrap();
                vms.push(VirtualMachine {
                    id: format!("{role}-{i}"),
                    name: format!("{}-{role}-{i}", options.name),
                    role,
                    public_ip: IpAddr::from([203, 0, subnet, octet]),
                    private_ip: IpAddr::from([10, 0, subnet, octet]),
                });
            }
        }
        vms
    }

    fn applies(&self) -> usize {
        *self.applies.lock().unwrap()
    }
}

impl InfraDriver for FakeInfra {
    async fn apply(&self, options: &InfraRunOptions) -> Result<Vec<VirtualMachine>> {
        let vms = Self::vms_for(options);
        *self.vms.lock().unwrap() = vms.clone();
        *self.applies.lock().unwrap() += 1;
        Ok(vms)
    }

    async fn plan(&self, options: &InfraRunOptions) -> Result<String> {
        Ok(format!("Plan: {} VMs for {}", Self::vms_for(options).len(), options.name))
    }

    async fn resources(&self, _provider: CloudProvider, _name: &str) -> Result<Vec<VirtualMachine>> {
        Ok(self.vms.lock().unwrap().clone())
    }

    async fn destroy(&self, options: &InfraRunOptions) -> Result<()> {
        self.vms.lock().unwrap().clear();
        self.destroyed.lock().unwrap().push(options.name.clone());
        Ok(())
    }
}

/// Interprets node manager commands against an in-memory registry per host.
#[derive(Clone, Default)]
struct FakeExecutor {
    registries: Arc<Mutex<HashMap<IpAddr, Vec<Value>>>>,
    commands: Arc<Mutex<Vec<(IpAddr, Vec<String>)>>>,
    /// Services only report their loopback listen address.
    loopback_only: Arc<AtomicBool>,
}

impl FakeExecutor {
    fn commands(&self) -> Vec<(IpAddr, String)> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(ip, args)| (*ip, args.join(" ")))
            .collect()
    }

    fn commands_with(&self, subcommand: &str) -> Vec<(IpAddr, String)> {
        self.commands()
            .into_iter()
            .filter(|(_, cmd)| cmd.split(' ').nth(1) == Some(subcommand))
            .collect()
    }

    fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }

    fn registry_json(&self, ip: IpAddr) -> String {
        let nodes = self.registries.lock().unwrap().get(&ip).cloned().unwrap_or_default();
        json!({ "nodes": nodes }).to_string()
    }

    fn add(&self, ip: IpAddr, args: &[String]) {
        let value_of = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        let values_of = |flag: &str| {
            args.windows(2)
                .filter(|pair| pair[0] == flag)
                .map(|pair| pair[1].clone())
                .collect::<Vec<_>>()
        };
        let count: u16 = value_of("--count").unwrap().parse().unwrap();
        let rpc_start: u16 = value_of("--rpc-port")
            .unwrap()
            .split('-')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        let max_log_files = args
            .iter()
            .find_map(|arg| arg.strip_prefix("--max-log-files="))
            .map(|max| max.parse::<u16>().unwrap());

        let loopback_only = self.loopback_only.load(Ordering::SeqCst);
        let mut registries = self.registries.lock().unwrap();
        let nodes = registries.entry(ip).or_default();
        for offset in 0..count {
            let number = nodes.len() + 1;
            let mut listen_addr = vec![format!("/ip4/127.0.0.1/udp/{}/quic-v1", 12000 + number)];
            if !loopback_only {
                listen_addr.push(format!("/ip4/{ip}/udp/{}/quic-v1", 12000 + number));
            }
            nodes.push(json!({
                "service_name": format!("antnode{number}"),
                "number": number,
                "rpc_socket_addr": format!("127.0.0.1:{}", rpc_start + offset),
                "status": "Added",
                "listen_addr": listen_addr,
                "initial_peers_config": {
                    "first": args.iter().any(|arg| arg == "--first"),
                    "addrs": values_of("--peer"),
                    "network_contacts_url": values_of("--network-contacts-url"),
                },
                "rewards_address": value_of("--rewards-address"),
                "network_id": value_of("--network-id").map(|id| id.parse::<u8>().unwrap()),
                "max_log_files": max_log_files,
            }));
        }
    }

    fn set_status(&self, ip: IpAddr, status: &str) {
        if let Some(nodes) = self.registries.lock().unwrap().get_mut(&ip) {
            for node in nodes {
                node["status"] = json!(status);
            }
        }
    }
}

impl RemoteExecutor for FakeExecutor {
    async fn run(&self, host: &VirtualMachine, _user: &str, args: &[String]) -> Result<CommandOutput> {
        let ip = host.public_ip;
        self.commands.lock().unwrap().push((ip, args.to_vec()));

        let mut output = CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        if args[0] == "cat" {
            output.stdout = self.registry_json(ip);
            return Ok(output);
        }
        match args[1].as_str() {
            "status" => output.stdout = self.registry_json(ip),
            "add" => self.add(ip, args),
            "start" => self.set_status(ip, "Running"),
            "stop" => self.set_status(ip, "Stopped"),
            "reset" => {
                self.registries.lock().unwrap().remove(&ip);
            }
            _ => {}
        }
        Ok(output)
    }
}

/// Records which playbooks ran and fails on the hosts it is told to.
#[derive(Clone, Default)]
struct FakePlaybooks {
    runs: Arc<Mutex<Vec<(Playbook, usize, ExtraVars)>>>,
    failing: Arc<Mutex<Vec<String>>>,
}

impl FakePlaybooks {
    fn ran(&self, playbook: Playbook) -> bool {
        self.runs.lock().unwrap().iter().any(|(ran, _, _)| *ran == playbook)
    }

    fn vars_of(&self, playbook: Playbook) -> Option<ExtraVars> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|(ran, _, _)| *ran == playbook)
            .map(|(_, _, vars)| vars.clone())
    }

    fn fail_on(&self, vm_name: &str) {
        self.failing.lock().unwrap().push(vm_name.to_string());
    }
}

impl PlaybookRunner for FakePlaybooks {
    async fn run(
        &self,
        playbook: Playbook,
        hosts: &[VirtualMachine],
        _user: &str,
        vars: &ExtraVars,
    ) -> Result<FleetReport> {
        self.runs.lock().unwrap().push((playbook, hosts.len(), vars.clone()));
        let failing = self.failing.lock().unwrap();
        let hosts = hosts
            .iter()
            .map(|host| HostReport {
                host: host.clone(),
                outcome: if failing.contains(&host.name) {
                    HostOutcome::Failed("unreachable".to_string())
                } else {
                    HostOutcome::Succeeded
                },
            })
            .collect();
        Ok(FleetReport::new(playbook.to_string(), hosts))
    }
}

/// Orchestrator wired to fakes, with handles to inspect them.
struct TestContext {
    orchestrator: Orchestrator<FakeInfra, FakeExecutor, FakePlaybooks>,
    infra: FakeInfra,
    executor: FakeExecutor,
    playbooks: FakePlaybooks,
}

impl TestContext {
    fn new() -> Self {
        let settings = Settings {
            state: StateStoreSettings {
                store_type: StoreType::Memory,
                ..Default::default()
            },
            artifacts: ArtifactSettings {
                verify_release_urls: false,
                ..Default::default()
            },
            retry_attempts: 0,
            retry_delay_secs: 0,
            ..Default::default()
        };
        let state = EnvironmentStateStore::new(&settings.state)
            .unwrap()
            .retry(RetryPolicy::none());

        let infra = FakeInfra::default();
        let executor = FakeExecutor::default();
        let playbooks = FakePlaybooks::default();
        Self {
            orchestrator: Orchestrator::new(
                infra.clone(),
                executor.clone(),
                playbooks.clone(),
                state,
                settings,
            ),
            infra,
            executor,
            playbooks,
        }
    }

    fn node_hosts(&self) -> Vec<IpAddr> {
        self.infra
            .vms
            .lock()
            .unwrap()
            .iter()
            .filter(|vm| vm.role == Role::Node)
            .map(|vm| vm.public_ip)
            .collect()
    }

    fn genesis_host(&self) -> IpAddr {
        self.infra
            .vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.role == Role::Genesis)
            .map(|vm| vm.public_ip)
            .unwrap()
    }
}

/// Three node VMs with two services each, plus the derived genesis VM.
fn deploy_options(name: &str) -> DeployOptions {
    let mut options = DeployOptions::new(name, CloudProvider::DigitalOcean);
    options.vm_counts.insert(Role::Node, 3);
    options.vm_counts.insert(Role::PeerCache, 0);
    options.vm_counts.insert(Role::Client, 0);
    options.nodes_per_vm.insert(Role::Node, 2);
    options.rewards_address = Some(REWARDS_ADDRESS.to_string());
    options.network_id = Some(5);
    options.max_log_files = Some(10);
    options
}

#[tokio::test]
async fn test_fresh_deploy_adds_and_starts_services() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();

    let details = ctx
        .orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    assert_eq!(details.role_spec(Role::Genesis).vm_count, 1);
    assert_eq!(details.bootstrap_peer, None);

    let genesis = ctx.genesis_host();
    let firsts: Vec<_> = ctx
        .executor
        .commands_with("add")
        .into_iter()
        .filter(|(_, cmd)| cmd.contains("--first"))
        .collect();
    assert_eq!(firsts.len(), 1);
    assert_eq!(firsts[0].0, genesis);
    assert!(firsts[0].1.contains("--count 1"));

    let node_hosts = ctx.node_hosts();
    assert_eq!(node_hosts.len(), 3);
    let genesis_peer = format!("--peer /ip4/{genesis}/udp/12001/quic-v1");
    for ip in &node_hosts {
        let adds: Vec<_> = ctx
            .executor
            .commands_with("add")
            .into_iter()
            .filter(|(host, _)| host == ip)
            .collect();
        assert_eq!(adds.len(), 1, "one add on {ip}");
        let add = &adds[0].1;
        assert!(add.contains("--count 2"));
        assert!(add.contains("--rpc-port 13000-13001"));
        assert!(add.contains("--metrics-port 14000-14001"));
        assert!(add.contains(&genesis_peer));
        assert!(add.contains(&format!("--rewards-address {REWARDS_ADDRESS}")));
        assert!(!add.contains("--first"));
        assert!(add.ends_with("evm-arbitrum-one"));

        let starts: Vec<_> = ctx
            .executor
            .commands_with("start")
            .into_iter()
            .filter(|(host, _)| host == ip)
            .collect();
        assert_eq!(starts.len(), 1, "one start on {ip}");
        assert!(starts[0].1.ends_with("--interval 2000"));
    }

    assert!(ctx.playbooks.ran(Playbook::NodeManager));
    assert!(ctx.playbooks.ran(Playbook::RpcClient));
    assert!(!ctx.playbooks.ran(Playbook::Clients));
    assert!(!ctx.playbooks.ran(Playbook::Build));
    assert!(summary.reports.iter().any(|report| report.phase == "provision node"));

    let stored = ctx.orchestrator.state().get("alpha").await.unwrap();
    assert_eq!(stored.role_spec(Role::Node).vm_count, 3);
    assert_eq!(stored.role_spec(Role::Node).nodes_per_vm, 2);

    let status = ctx.orchestrator.status("alpha").await.unwrap();
    assert_eq!(status.unreachable_count(), 0);
    assert_eq!(status.totals().running, 7);
}

#[tokio::test]
async fn test_redeploy_adds_nothing() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    let options = deploy_options("alpha");
    let first = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap();
    ctx.executor.clear_commands();

    let mut summary = RunSummary::default();
    let second = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap();

    assert!(ctx.executor.commands_with("add").is_empty());
    assert_eq!(ctx.infra.applies(), 2);
    assert_eq!(first.created_at, second.created_at);
    let skipped = summary
        .reports
        .iter()
        .filter(|report| report.phase == "provision node")
        .flat_map(|report| &report.hosts)
        .all(|host| matches!(host.outcome, HostOutcome::Skipped(_)));
    assert!(skipped);
}

#[tokio::test]
async fn test_upscale_adds_only_the_missing_services() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let options = UpscaleOptions {
        name: "alpha".to_string(),
        vm_counts: [(Role::Node, 4)].into(),
        nodes_per_vm: [(Role::Node, 3)].into(),
        ..Default::default()
    };
    let outcome = ctx.orchestrator.upscale(&mut summary, &options).await.unwrap();
    let UpscaleOutcome::Applied(details) = outcome else {
        panic!("expected an applied upscale");
    };
    assert_eq!(details.role_spec(Role::Node).vm_count, 4);

    let adds = ctx.executor.commands_with("add");
    assert_eq!(adds.len(), 4);
    let from_scratch = adds
        .iter()
        .filter(|(_, cmd)| cmd.contains("--count 3 --rpc-port 13000-13002"))
        .count();
    let topped_up = adds
        .iter()
        .filter(|(_, cmd)| cmd.contains("--count 1 --rpc-port 13002 "))
        .count();
    assert_eq!(from_scratch, 1);
    assert_eq!(topped_up, 3);
}

#[tokio::test]
async fn test_upscale_rejects_shrink() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let options = UpscaleOptions {
        name: "alpha".to_string(),
        vm_counts: [(Role::Node, 1)].into(),
        ..Default::default()
    };
    let err = ctx.orchestrator.upscale(&mut summary, &options).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::ShrinkNotSupported { desired: 1, current: 3, .. })
    ));
    assert!(ctx.executor.commands().is_empty());
    assert_eq!(ctx.infra.applies(), 1);
}

#[tokio::test]
async fn test_upscale_plan_changes_nothing() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();

    let options = UpscaleOptions {
        name: "alpha".to_string(),
        vm_counts: [(Role::Node, 5)].into(),
        plan: true,
        ..Default::default()
    };
    let outcome = ctx.orchestrator.upscale(&mut summary, &options).await.unwrap();
    let UpscaleOutcome::Planned { vars, plan } = outcome else {
        panic!("expected a plan");
    };
    assert!(vars.contains(&("node_vm_count".to_string(), "5".to_string())));
    assert!(plan.contains("alpha"));
    assert_eq!(ctx.infra.applies(), 1);

    let stored = ctx.orchestrator.state().get("alpha").await.unwrap();
    assert_eq!(stored.role_spec(Role::Node).vm_count, 3);
}

#[tokio::test]
async fn test_reset_reuses_service_configuration() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let request = ResetRequest {
        name: "alpha".to_string(),
        node_count: 3,
        ..Default::default()
    };
    ctx.orchestrator.reset_to_n(&mut summary, &request).await.unwrap();

    // Genesis is left alone unless asked for.
    let genesis = ctx.genesis_host();
    assert!(ctx.executor.commands().iter().all(|(ip, _)| *ip != genesis));

    let genesis_peer = format!("--peer /ip4/{genesis}/udp/12001/quic-v1");
    for ip in ctx.node_hosts() {
        let host_cmds: Vec<String> = ctx
            .executor
            .commands()
            .into_iter()
            .filter(|(host, _)| *host == ip)
            .map(|(_, cmd)| cmd)
            .collect();
        let position = |sub: &str| {
            host_cmds
                .iter()
                .position(|cmd| cmd.split(' ').nth(1) == Some(sub))
                .unwrap()
        };
        assert!(position("stop") < position("reset"));
        assert!(position("reset") < position("add"));
        assert!(position("add") < position("start"));

        let add = &host_cmds[position("add")];
        assert!(add.contains("--count 3"));
        assert!(add.contains("--rpc-port 13000-13002"));
        assert!(add.contains(&genesis_peer));
        assert!(add.contains(&format!("--rewards-address {REWARDS_ADDRESS}")));
        assert!(add.contains("--network-id 5"));
        assert!(add.contains("--max-log-files=10"));
    }

    let status = ctx.orchestrator.status("alpha").await.unwrap();
    assert_eq!(status.totals().total, 1 + 3 * 3);
}

#[tokio::test]
async fn test_conflicting_binaries_rejected_before_remote_calls() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    let mut options = deploy_options("alpha");
    options.binary.version = Some("0.3.1".to_string());
    options.binary.branch = Some("main".to_string());
    options.binary.repo_owner = Some("maidsafe".to_string());

    let err = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<DeployError>(),
        Some(&DeployError::ConflictingArguments {
            first: "version",
            second: "branch",
        })
    );
    assert_eq!(ctx.infra.applies(), 0);
    assert!(ctx.executor.commands().is_empty());
    assert!(summary.is_empty());
    assert!(ctx.orchestrator.state().load("alpha").await.unwrap().is_none());
}

#[tokio::test]
async fn test_clean_removes_state() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();

    ctx.orchestrator.clean("alpha", None).await.unwrap();
    assert_eq!(*ctx.infra.destroyed.lock().unwrap(), vec!["alpha".to_string()]);
    assert!(ctx.orchestrator.state().load("alpha").await.unwrap().is_none());

    // Without state the provider has to be given.
    let err = ctx.orchestrator.clean("alpha", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::MissingArgument { missing: "provider", .. })
    ));
    ctx.orchestrator
        .clean("alpha", Some(CloudProvider::DigitalOcean))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_inventory_rejects_other_provider() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();

    let inventory = ctx.orchestrator.inventory("alpha", None).await.unwrap();
    assert_eq!(inventory.role(Role::Node).len(), 3);
    assert!(ctx
        .orchestrator
        .inventory("alpha", Some(CloudProvider::Aws))
        .await
        .is_err());
}

#[tokio::test]
async fn test_redeploy_rejects_fewer_vms() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let mut options = deploy_options("alpha");
    options.vm_counts.insert(Role::Node, 1);
    let err = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<DeployError>(),
        Some(&DeployError::ShrinkNotSupported {
            what: "VM count",
            desired: 1,
            current: 3,
        })
    );
    assert_eq!(ctx.infra.applies(), 1);
    assert_eq!(ctx.node_hosts().len(), 3);
    assert!(ctx.executor.commands().is_empty());

    // Fewer services per VM is rejected the same way.
    let mut options = deploy_options("alpha");
    options.nodes_per_vm.insert(Role::Node, 1);
    let err = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::ShrinkNotSupported { what: "node count", .. })
    ));
    assert_eq!(ctx.infra.applies(), 1);
}

#[tokio::test]
async fn test_redeploy_joining_network_keeps_genesis_vm() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    let genesis = ctx.genesis_host();

    let mut options = deploy_options("alpha");
    options.bootstrap_peer = Some(format!("/ip4/{genesis}/udp/12001/quic-v1").parse().unwrap());
    let details = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap();
    assert_eq!(details.role_spec(Role::Genesis).vm_count, 1);
    assert_eq!(ctx.genesis_host(), genesis);
}

#[tokio::test]
async fn test_failure_threshold_stops_deploy() {
    let ctx = TestContext::new();
    ctx.playbooks.fail_on("alpha-node-2");
    let mut summary = RunSummary::default();

    let err = ctx
        .orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap_err();
    let Some(DeployError::FailureThresholdExceeded {
        failed,
        total,
        max_percentage,
        failed_hosts,
        ..
    }) = err.downcast_ref::<DeployError>()
    else {
        panic!("expected the failure threshold to be exceeded, got {err:#}");
    };
    assert_eq!(*failed, 1);
    assert_eq!(*max_percentage, 10);
    assert!(*total > 1);
    assert_eq!(failed_hosts.len(), 1);
    assert!(failed_hosts[0].starts_with("alpha-node-2 ("));

    // The failing phase is still part of the summary.
    assert!(summary.reports.iter().any(|report| report.failed_count() == 1));
    assert!(ctx.executor.commands_with("add").is_empty());
    assert!(ctx.orchestrator.state().load("alpha").await.unwrap().is_none());
}

#[tokio::test]
async fn test_genesis_without_public_address_stops_deploy() {
    let ctx = TestContext::new();
    ctx.executor.loopback_only.store(true, Ordering::SeqCst);
    let mut options = deploy_options("alpha");
    options.vm_counts.insert(Role::PeerCache, 1);
    let mut summary = RunSummary::default();

    let err = ctx.orchestrator.deploy(&mut summary, &options).await.unwrap_err();
    let genesis = ctx.genesis_host();
    assert_eq!(
        err.downcast_ref::<DeployError>(),
        Some(&DeployError::GenesisListenAddressMissing(genesis.to_string()))
    );
    let adds = ctx.executor.commands_with("add");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].0, genesis);
    assert!(ctx.executor.commands().iter().all(|(_, cmd)| !cmd.contains("bootstrap_cache.json")));
}

#[tokio::test]
async fn test_anvil_clients_receive_the_funded_key() {
    let ctx = TestContext::new();
    let mut options = deploy_options("alpha");
    options.evm_network = EvmNetwork::Anvil;
    options.vm_counts.insert(Role::Client, 1);
    let mut summary = RunSummary::default();
    ctx.orchestrator.deploy(&mut summary, &options).await.unwrap();

    let vars = ctx.playbooks.vars_of(Playbook::Clients).unwrap();
    assert_eq!(
        vars.get("client_secret_key"),
        Some(&Value::String(ANVIL_DEPLOYER_SECRET_KEY.to_string()))
    );
    assert_eq!(vars.get("evm_network_type"), Some(&json!("evm-custom")));
    assert!(ctx.playbooks.ran(Playbook::EvmNode));
}

#[tokio::test]
async fn test_upgrade_from_url_forces_reinstall() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let request = UpgradeRequest {
        name: "alpha".to_string(),
        url: Some("https://builds.example.com/antnode.tar.gz".to_string()),
        ..Default::default()
    };
    ctx.orchestrator.upgrade(&mut summary, &request).await.unwrap();

    let upgrades = ctx.executor.commands_with("upgrade");
    // Every node VM plus the genesis VM.
    assert_eq!(upgrades.len(), 4);
    for (_, cmd) in &upgrades {
        assert!(cmd.contains("--force"));
        assert!(cmd.ends_with("--url=https://builds.example.com/antnode.tar.gz"));
        assert!(!cmd.contains("--env"));
    }
}

#[tokio::test]
async fn test_upgrade_to_version_updates_state() {
    let ctx = TestContext::new();
    let mut summary = RunSummary::default();
    ctx.orchestrator
        .deploy(&mut summary, &deploy_options("alpha"))
        .await
        .unwrap();
    ctx.executor.clear_commands();

    let request = UpgradeRequest {
        name: "alpha".to_string(),
        version: Some("0.4.1".to_string()),
        env_variables: Some(vec![("RUST_LOG".to_string(), "debug".to_string())]),
        ..Default::default()
    };
    ctx.orchestrator.upgrade(&mut summary, &request).await.unwrap();

    for (_, cmd) in ctx.executor.commands_with("upgrade") {
        assert!(!cmd.contains("--force"));
        assert!(cmd.contains("--env=RUST_LOG=debug"));
    }
    let stored = ctx.orchestrator.state().get("alpha").await.unwrap();
    let BinaryOption::Versioned { node_version, .. } = &stored.binary_option else {
        panic!("expected a versioned deployment");
    };
    assert_eq!(node_version.as_ref().map(ToString::to_string).as_deref(), Some("0.4.1"));
    assert_eq!(
        stored.env_variables,
        Some(vec![("RUST_LOG".to_string(), "debug".to_string())])
    );
}
