//! fleetnet deploys node testnets onto cloud VMs and operates them afterwards.

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Command};
use fleetnet_deploy::{
    AnsibleRunner, EnvironmentStateStore, Orchestrator, RunSummary, Settings, SshExecutor,
    TerraformDriver, UpscaleOutcome,
};

type Fleetnet = Orchestrator<TerraformDriver, SshExecutor, AnsibleRunner>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(forks) = cli.forks {
        settings.forks = forks;
    }
    if let Some(percentage) = cli.max_failure_percentage {
        settings.max_failure_percentage = percentage.min(100);
    }

    let orchestrator = orchestrator(settings)?;

    // The summary is printed even when the command fails part way.
    let mut summary = RunSummary::default();
    let result = run(&orchestrator, &mut summary, cli.command).await;
    if !summary.is_empty() {
        println!("{}", summary.table());
    }
    result
}

fn orchestrator(settings: Settings) -> Result<Fleetnet> {
    let infra = TerraformDriver::new(&settings.terraform_binary, settings.terraform_dir());
    let executor = SshExecutor::new(&settings.ssh_private_key_path)
        .connect_timeout(settings.ssh_connect_timeout());
    let playbooks = AnsibleRunner::new(
        settings.ansible_dir(),
        &settings.ssh_private_key_path,
        settings.forks,
    );
    let state = EnvironmentStateStore::new(&settings.state)?.retry(settings.retry_policy());
    Ok(Orchestrator::new(infra, executor, playbooks, state, settings))
}

async fn run(orchestrator: &Fleetnet, summary: &mut RunSummary, command: Command) -> Result<()> {
    match command {
        Command::Deploy(args) => {
            let options = args.into_options()?;
            let details = orchestrator.deploy(summary, &options).await?;
            tracing::info!(
                name = %details.name,
                provider = %details.provider,
                updated_at = %details.updated_at,
                "Deploy complete"
            );
        }
        Command::Upscale(args) => match orchestrator.upscale(summary, &args.into()).await? {
            UpscaleOutcome::Planned { vars, plan } => {
                for (name, value) in vars {
                    println!("{name} = {value}");
                }
                println!("{plan}");
            }
            UpscaleOutcome::Applied(details) => {
                tracing::info!(name = %details.name, "Upscale complete");
            }
        },
        Command::Upgrade(args) => {
            orchestrator.upgrade(summary, &args.into()).await?;
        }
        Command::Status { name } => {
            let report = orchestrator.status(&name).await?;
            println!("{}", report.table());
        }
        Command::Clean { name, provider } => {
            orchestrator.clean(&name, provider).await?;
        }
        Command::Inventory { name, provider } => {
            let inventory = orchestrator.inventory(&name, provider).await?;
            println!("{}", inventory.table());
        }
        Command::Start {
            name,
            interval,
            role,
        } => {
            let interval = interval.map(std::time::Duration::from_millis);
            orchestrator.start(summary, &name, interval, role).await?;
        }
        Command::Stop {
            name,
            interval,
            delay,
            service_names,
            role,
        } => {
            let options = cli::stop_options(interval, delay, service_names);
            orchestrator.stop(summary, &name, &options, role).await?;
        }
        Command::ResetToNNodes {
            name,
            node_count,
            start_interval,
            stop_interval,
            version,
            role,
        } => {
            let request = cli::reset_request(
                name,
                node_count,
                start_interval,
                stop_interval,
                version,
                role,
            );
            orchestrator.reset_to_n(summary, &request).await?;
        }
    }
    Ok(())
}
