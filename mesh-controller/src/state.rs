//! ConfigMap persistence for the TCP listener port table.
//!
//! The table is stored in a single ConfigMap in the mesh namespace so that
//! listener assignments survive controller restarts. Writes go through
//! replace-with-resourceVersion, retrying a bounded number of times on
//! optimistic-concurrency conflicts.

use anyhow::{anyhow, Context, Result};
use mesh_controller_core::ports::PortStateTable;
use mesh_controller_k8s_api::{self as k8s, Api, Client, PostParams};
use std::collections::BTreeMap;

pub const STATE_TABLE_NAME: &str = "tcp-state-table";
const STATE_TABLE_KEY: &str = "ports.yaml";
const MAX_SAVE_ATTEMPTS: usize = 3;

pub struct PortAllocator {
    api: Api<k8s::ConfigMap>,
    namespace: String,
    resource_version: Option<String>,
    table: PortStateTable,
}

// === impl PortAllocator ===

impl PortAllocator {
    /// Loads the persisted table, creating an empty ConfigMap on first run.
    /// A table that cannot be loaded or parsed is fatal to startup.
    pub async fn load(client: Client, mesh_namespace: &str, min: u16, max: u16) -> Result<Self> {
        let api: Api<k8s::ConfigMap> = Api::namespaced(client, mesh_namespace);
        let existing = api
            .get_opt(STATE_TABLE_NAME)
            .await
            .context("loading the port-state table")?;

        match existing {
            Some(configmap) => {
                let entries = configmap
                    .data
                    .as_ref()
                    .and_then(|data| data.get(STATE_TABLE_KEY))
                    .filter(|raw| !raw.trim().is_empty())
                    .map(|raw| serde_yaml::from_str::<BTreeMap<String, String>>(raw))
                    .transpose()
                    .context("decoding the port-state table")?
                    .unwrap_or_default();
                let table = PortStateTable::from_map(min, max, &entries)
                    .context("restoring the port-state table")?;
                tracing::debug!(
                    entries = entries.len(),
                    "Restored the persisted port-state table"
                );
                Ok(Self {
                    api,
                    namespace: mesh_namespace.to_string(),
                    resource_version: configmap.metadata.resource_version,
                    table,
                })
            }
            None => {
                let mut allocator = Self {
                    api,
                    namespace: mesh_namespace.to_string(),
                    resource_version: None,
                    table: PortStateTable::new(min, max),
                };
                let encoded = serde_yaml::to_string(&allocator.table.to_map())
                    .context("encoding the port-state table")?;
                let created = allocator
                    .api
                    .create(&PostParams::default(), &allocator.configmap(encoded))
                    .await
                    .context("creating the port-state table")?;
                allocator.resource_version = created.metadata.resource_version;
                tracing::info!("Created an empty port-state table");
                Ok(allocator)
            }
        }
    }

    pub fn table(&self) -> &PortStateTable {
        &self.table
    }

    /// Finds or assigns a listener for the service port, persisting the
    /// table before returning a fresh assignment.
    pub async fn ensure(&mut self, name: &str, namespace: &str, port: u16) -> Result<u16> {
        if let Some(listener) = self.table.find(name, namespace, port) {
            return Ok(listener);
        }
        let listener = self.table.add(name, namespace, port)?;
        self.save().await?;
        tracing::info!(service = %name, %namespace, port, listener, "Assigned TCP listener");
        Ok(listener)
    }

    /// Releases every listener held by the service.
    pub async fn release(&mut self, name: &str, namespace: &str) -> Result<()> {
        let released = self.table.remove(name, namespace);
        if released.is_empty() {
            return Ok(());
        }
        self.save().await?;
        tracing::info!(service = %name, %namespace, ?released, "Released TCP listeners");
        Ok(())
    }

    async fn save(&mut self) -> Result<()> {
        let encoded =
            serde_yaml::to_string(&self.table.to_map()).context("encoding the port-state table")?;

        for _ in 0..MAX_SAVE_ATTEMPTS {
            let configmap = self.configmap(encoded.clone());
            match self
                .api
                .replace(STATE_TABLE_NAME, &PostParams::default(), &configmap)
                .await
            {
                Ok(saved) => {
                    self.resource_version = saved.metadata.resource_version;
                    return Ok(());
                }
                Err(error) if k8s::is_conflict(&error) => {
                    tracing::debug!(%error, "Conflict saving the port-state table; refreshing");
                    let current = self
                        .api
                        .get(STATE_TABLE_NAME)
                        .await
                        .context("refreshing the port-state table")?;
                    self.resource_version = current.metadata.resource_version;
                }
                Err(error) => return Err(error).context("saving the port-state table"),
            }
        }

        Err(anyhow!(
            "saving the port-state table failed after {MAX_SAVE_ATTEMPTS} conflicts"
        ))
    }

    fn configmap(&self, encoded: String) -> k8s::ConfigMap {
        k8s::ConfigMap {
            metadata: k8s::ObjectMeta {
                name: Some(STATE_TABLE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version: self.resource_version.clone(),
                ..Default::default()
            },
            data: Some(
                [(STATE_TABLE_KEY.to_string(), encoded)]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        }
    }
}
