//! Infrastructure driver: applies per-role VM counts and reads back the resulting hosts.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use strum::IntoEnumIterator;

use crate::environment::{CloudProvider, EnvironmentDetails, EnvironmentType};
use crate::error::DeployError;
use crate::inventory::VirtualMachine;
use crate::roles::{Role, RoleSpec};

/// Everything needed to converge a deployment's infrastructure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraRunOptions {
    pub name: String,
    pub provider: CloudProvider,
    pub environment_type: EnvironmentType,
    pub region: String,
    pub roles: BTreeMap<Role, RoleSpec>,
}

impl InfraRunOptions {
    /// Variables for every role. Roles without a spec get a VM count of zero.
    ///
    /// A volume size of zero disables the volume resources of a role altogether.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![("region".to_string(), self.region.clone())];
        for role in Role::iter() {
            let res = role.resource_name();
            let Some(spec) = self.roles.get(&role) else {
                vars.push((format!("{res}_vm_count"), "0".to_string()));
                continue;
            };

            vars.push((format!("{res}_vm_count"), spec.vm_count.to_string()));
            vars.push((format!("{res}_vm_size"), spec.vm_size.clone()));
            if let Some(image) = &spec.image_id {
                vars.push((format!("{res}_image_id"), image.clone()));
            }
            if role.runs_nodes() {
                let (volumes, size) = if spec.has_volumes() {
                    (spec.volumes_per_vm, spec.volume_size_gb)
                } else {
                    (0, 0)
                };
                vars.push((format!("{res}_volumes_per_vm"), volumes.to_string()));
                vars.push((format!("{res}_volume_size"), size.to_string()));
            }
        }
        vars
    }

    /// Tfvars files, relative to the provider's terraform directory.
    pub fn tfvars_files(&self) -> Vec<String> {
        vec![
            self.environment_type.tfvars_filename(),
            self.environment_type.images_tfvars_filename(&self.region),
        ]
    }
}

impl From<&EnvironmentDetails> for InfraRunOptions {
    fn from(details: &EnvironmentDetails) -> Self {
        Self {
            name: details.name.clone(),
            provider: details.provider,
            environment_type: details.environment_type,
            region: details.region.clone(),
            roles: details.roles.clone(),
        }
    }
}

/// Wraps the declarative infrastructure tool.
pub trait InfraDriver: Send + Sync {
    /// Create or update resources so they match `options`, returning every VM.
    ///
    /// Applying unchanged options must not change the infrastructure.
    fn apply(
        &self,
        options: &InfraRunOptions,
    ) -> impl Future<Output = Result<Vec<VirtualMachine>>> + Send;

    /// Describe the changes `apply` would make.
    fn plan(&self, options: &InfraRunOptions) -> impl Future<Output = Result<String>> + Send;

    /// Query the VMs that currently exist for a deployment.
    fn resources(
        &self,
        provider: CloudProvider,
        name: &str,
    ) -> impl Future<Output = Result<Vec<VirtualMachine>>> + Send;

    /// Remove every resource of a deployment.
    fn destroy(&self, options: &InfraRunOptions) -> impl Future<Output = Result<()>> + Send;
}

/// Drives `terraform`, one workspace per deployment.
#[derive(Debug, Clone)]
pub struct TerraformDriver {
    binary: PathBuf,
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TerraformOutput {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InstanceOutput {
    id: String,
    name: String,
    public_ip: IpAddr,
    private_ip: IpAddr,
}

impl TerraformDriver {
    /// `root` holds one terraform directory per provider.
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
        }
    }

    fn dir(&self, provider: CloudProvider) -> PathBuf {
        self.root.join(provider.terraform_dir())
    }

    async fn run(&self, dir: &Path, args: &[String]) -> Result<String> {
        tracing::debug!(dir = %dir.display(), args = %args.join(" "), "Running terraform");

        let output = tokio::process::Command::new(&self.binary)
            .current_dir(dir)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::Error::new(DeployError::ExternalCommandFailed {
                binary: format!("terraform {}", args.first().map(String::as_str).unwrap_or_default()),
                exit_code: output.status.code(),
            })
            .context(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn prepare(&self, provider: CloudProvider, name: &str) -> Result<PathBuf> {
        let dir = self.dir(provider);
        self.run(&dir, &args(["init", "-input=false"])).await?;
        self.run(&dir, &args(["workspace", "select", "-or-create=true", name]))
            .await
            .with_context(|| format!("Failed to select the '{name}' workspace"))?;
        Ok(dir)
    }

    fn var_args(options: &InfraRunOptions) -> Vec<String> {
        let mut out = Vec::new();
        for file in options.tfvars_files() {
            out.push(format!("-var-file={file}"));
        }
        for (key, value) in options.vars() {
            out.push("-var".to_string());
            out.push(format!("{key}={value}"));
        }
        out
    }

    async fn outputs(&self, dir: &Path) -> Result<Vec<VirtualMachine>> {
        let json = self.run(dir, &args(["output", "-json"])).await?;
        parse_outputs(&json)
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Parse `terraform output -json`.
///
/// Every role exposes a `<resource>_instances` output listing its VMs.
pub fn parse_outputs(json: &str) -> Result<Vec<VirtualMachine>> {
    let outputs: BTreeMap<String, TerraformOutput> =
        serde_json::from_str(json).context("Failed to parse terraform outputs")?;

    let mut vms = Vec::new();
    for (key, output) in outputs {
        let Some(role) = key
            .strip_suffix("_instances")
            .and_then(Role::from_resource_name)
        else {
            continue;
        };
        let instances: Vec<InstanceOutput> = serde_json::from_value(output.value)
            .with_context(|| format!("Malformed terraform output '{key}'"))?;
        vms.extend(instances.into_iter().map(|instance| VirtualMachine {
            id: instance.id,
            name: instance.name,
            role,
            public_ip: instance.public_ip,
            private_ip: instance.private_ip,
        }));
    }
    Ok(vms)
}

impl InfraDriver for TerraformDriver {
    async fn apply(&self, options: &InfraRunOptions) -> Result<Vec<VirtualMachine>> {
        tracing::info!(name = %options.name, provider = %options.provider, "Applying infrastructure...");
        let dir = self.prepare(options.provider, &options.name).await?;

        let mut cmd = args(["apply", "-auto-approve", "-input=false"]);
        cmd.extend(Self::var_args(options));
        self.run(&dir, &cmd).await?;

        let vms = self.outputs(&dir).await?;
        tracing::info!(name = %options.name, vms = vms.len(), "Infrastructure applied");
        Ok(vms)
    }

    async fn plan(&self, options: &InfraRunOptions) -> Result<String> {
        let dir = self.prepare(options.provider, &options.name).await?;
        let mut cmd = args(["plan", "-input=false"]);
        cmd.extend(Self::var_args(options));
        self.run(&dir, &cmd).await
    }

    async fn resources(&self, provider: CloudProvider, name: &str) -> Result<Vec<VirtualMachine>> {
        let dir = self.prepare(provider, name).await?;
        self.outputs(&dir).await
    }

    async fn destroy(&self, options: &InfraRunOptions) -> Result<()> {
        tracing::info!(name = %options.name, provider = %options.provider, "Destroying infrastructure...");
        let dir = self.prepare(options.provider, &options.name).await?;

        let mut cmd = args(["destroy", "-auto-approve", "-input=false"]);
        cmd.extend(Self::var_args(options));
        self.run(&dir, &cmd).await?;

        self.run(&dir, &args(["workspace", "select", "default"])).await?;
        self.run(&dir, &args(["workspace", "delete", &options.name])).await?;
        Ok(())
    }
}
