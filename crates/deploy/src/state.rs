//! Environment state store: deployment metadata persisted in an object store.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentDetails;
use crate::error::DeployError;
use crate::remote::RetryPolicy;

/// Which object store backs the state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StoreType {
    #[default]
    S3,
    Local,
    Memory,
}

/// Location of the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStoreSettings {
    pub store_type: StoreType,
    /// Bucket name for S3, base directory for the local store.
    pub bucket: String,
    /// Key prefix under which every deployment is stored.
    pub prefix: String,
    pub region: Option<String>,
    /// Endpoint of an S3-compatible store.
    pub endpoint: Option<String>,
}

impl Default for StateStoreSettings {
    fn default() -> Self {
        Self {
            store_type: StoreType::S3,
            bucket: "fleetnet-environments".to_string(),
            prefix: "environments".to_string(),
            region: Some("eu-west-2".to_string()),
            endpoint: None,
        }
    }
}

/// Reads and writes [`EnvironmentDetails`] as `{prefix}/{name}.json`.
///
/// Every read is a fresh fetch; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct EnvironmentStateStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
}

impl EnvironmentStateStore {
    pub fn new(settings: &StateStoreSettings) -> Result<Self> {
        Ok(Self::with_store(create_object_store(settings)?, settings.prefix.clone()))
    }

    /// Use an already configured object store.
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn path(&self, name: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{name}.json", self.prefix.trim_end_matches('/')))
    }

    /// Fetch a deployment's details, or `None` if it was never stored.
    pub async fn load(&self, name: &str) -> Result<Option<EnvironmentDetails>> {
        let path = self.path(name);
        let data = self
            .retry
            .retry("download environment state", || async {
                match self.store.get(&path).await {
                    Ok(result) => Ok(Some(result.bytes().await?)),
                    Err(object_store::Error::NotFound { .. }) => Ok(None),
                    Err(e) => Err(anyhow::Error::new(e)),
                }
            })
            .await
            .with_context(|| format!("Failed to download environment state from {path}"))?;

        let Some(data) = data else {
            tracing::debug!(name, %path, "No environment state stored");
            return Ok(None);
        };

        let details = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse environment state at {path}"))?;
        Ok(Some(details))
    }

    /// Fetch a deployment's details, failing if none are stored.
    pub async fn get(&self, name: &str) -> Result<EnvironmentDetails> {
        self.load(name)
            .await?
            .ok_or_else(|| DeployError::EnvironmentNotFound(name.to_string()).into())
    }

    pub async fn save(&self, details: &EnvironmentDetails) -> Result<()> {
        let path = self.path(&details.name);
        let data = serde_json::to_vec_pretty(details).context("Failed to serialize environment state")?;

        tracing::debug!(name = %details.name, %path, size = data.len(), "Uploading environment state");
        self.store
            .put(&path, Bytes::from(data).into())
            .await
            .with_context(|| format!("Failed to upload environment state to {path}"))?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete environment state at {path}")),
        }
    }
}

fn create_object_store(settings: &StateStoreSettings) -> Result<Arc<dyn ObjectStore>> {
    match settings.store_type {
        StoreType::S3 => {
            use object_store::aws::AmazonS3Builder;
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(&settings.bucket);
            if let Some(region) = &settings.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &settings.endpoint {
                builder = builder.with_endpoint(endpoint);
            }
            let store = builder.build().context("Failed to create S3 state store")?;
            Ok(Arc::new(store))
        }
        StoreType::Local => {
            std::fs::create_dir_all(&settings.bucket)
                .with_context(|| format!("Failed to create state directory {}", settings.bucket))?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&settings.bucket)
                .context("Failed to create local state store")?;
            Ok(Arc::new(store))
        }
        StoreType::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
    }
}
