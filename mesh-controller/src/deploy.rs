//! The versioned deploy engine.
//!
//! A planner fans each new snapshot out into one task per mesh-node pod;
//! a dispatcher runs tasks on a bounded set of concurrent deploys, at most
//! one per pod at a time. A newer task for a pod supersedes one waiting to
//! run. The pod's own API is the source of truth for its installed
//! version, so outdated tasks are dropped instead of rolling a node back.

use crate::metrics::Metrics;
use anyhow::{bail, Context, Result};
use mesh_controller_core::{config, Configuration, DeployLog};
use mesh_controller_k8s_index::{MeshNode, SharedIndex};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{self, Duration},
};

/// Port of the configuration API every mesh node exposes.
const NODE_API_PORT: u16 = 8080;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRY: u32 = 3;
const MAX_IN_FLIGHT: usize = 4;
const CONVERGE_POLLS: u32 = 8;
const CONVERGE_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// A versioned configuration handed to the deploy engine.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: i64,
    pub config: Arc<Configuration>,
}

#[derive(Clone, Debug)]
pub enum PlanEvent {
    /// A new snapshot to fan out to every mesh node.
    Snapshot(Snapshot),
    /// A proxy that (re)started and needs the current snapshot.
    MeshNode(MeshNode),
}

#[derive(Clone)]
struct Task {
    node: MeshNode,
    snapshot: Snapshot,
}

pub struct Deployer {
    index: SharedIndex,
    log: Arc<DeployLog>,
    metrics: Metrics,
    http: reqwest::Client,
}

// === impl Deployer ===

impl Deployer {
    pub fn new(index: SharedIndex, log: Arc<DeployLog>, metrics: Metrics) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building the deploy HTTP client")?;
        Ok(Self {
            index,
            log,
            metrics,
            http,
        })
    }

    pub async fn run(self, mut plan: mpsc::UnboundedReceiver<PlanEvent>, shutdown: drain::Watch) {
        let mut current: Option<Snapshot> = None;
        let mut pending: HashMap<String, Task> = HashMap::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut deploys: JoinSet<String> = JoinSet::new();

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Shutdown signaled");
                    return;
                }

                event = plan.recv() => match event {
                    None => return,
                    Some(PlanEvent::Snapshot(snapshot)) => {
                        tracing::debug!(version = snapshot.version, "Planning deployment");
                        current = Some(snapshot.clone());
                        let nodes = self.index.read().mesh_nodes();
                        for node in nodes.into_iter().filter(|node| node.ready) {
                            self.enqueue(
                                Task { node, snapshot: snapshot.clone() },
                                &mut pending,
                                &mut active,
                                &mut deploys,
                            );
                        }
                    }
                    Some(PlanEvent::MeshNode(node)) => {
                        if let Some(snapshot) = current.clone() {
                            tracing::debug!(pod = %node.name, "Mesh node restarted; redeploying");
                            self.enqueue(
                                Task { node, snapshot },
                                &mut pending,
                                &mut active,
                                &mut deploys,
                            );
                        }
                    }
                },

                Some(done) = deploys.join_next(), if !deploys.is_empty() => {
                    match done {
                        Ok(pod) => {
                            active.remove(&pod);
                        }
                        Err(error) => tracing::error!(%error, "Deploy task panicked"),
                    }
                    self.dispatch(&mut pending, &mut active, &mut deploys);
                }
            }
        }
    }

    /// Queues a task, or starts it immediately when its pod is idle and a
    /// deploy slot is free. A task already waiting for the pod is replaced.
    fn enqueue(
        &self,
        task: Task,
        pending: &mut HashMap<String, Task>,
        active: &mut HashSet<String>,
        deploys: &mut JoinSet<String>,
    ) {
        pending.insert(task.node.name.clone(), task);
        self.dispatch(pending, active, deploys);
    }

    fn dispatch(
        &self,
        pending: &mut HashMap<String, Task>,
        active: &mut HashSet<String>,
        deploys: &mut JoinSet<String>,
    ) {
        while deploys.len() < MAX_IN_FLIGHT {
            let next = pending
                .keys()
                .find(|pod| !active.contains(*pod))
                .cloned();
            let Some(pod) = next else { return };
            let task = pending.remove(&pod).expect("pending task must exist");

            active.insert(pod);
            let http = self.http.clone();
            let log = self.log.clone();
            let metrics = self.metrics.clone();
            deploys.spawn(deploy_to_node(http, log, metrics, task));
        }
    }
}

/// Deploys one snapshot to one pod, retrying transient failures a bounded
/// number of times before recording the failure.
async fn deploy_to_node(
    http: reqwest::Client,
    log: Arc<DeployLog>,
    metrics: Metrics,
    task: Task,
) -> String {
    let Task { node, snapshot } = task;
    let mut attempt = 0;
    loop {
        match deploy_once(&http, &node, &snapshot).await {
            Ok(None) => {
                tracing::info!(pod = %node.name, version = snapshot.version, "Deployed configuration");
                log.record_success(&node.name, &node.ip);
                metrics.deploys.inc();
                break;
            }
            Ok(Some(skip)) => {
                tracing::debug!(pod = %node.name, version = snapshot.version, %skip, "Dropping deploy task");
                break;
            }
            Err(error) => {
                attempt += 1;
                if attempt >= MAX_RETRY {
                    tracing::warn!(pod = %node.name, %error, "Deploy failed; giving up");
                    log.record_failure(&node.name, &node.ip, format!("{error:#}"));
                    metrics.deploy_failures.inc();
                    break;
                }
                tracing::debug!(pod = %node.name, %error, attempt, "Deploy failed; retrying");
                time::sleep(retry_backoff(attempt)).await;
            }
        }
    }
    node.name
}

/// One deploy attempt. Returns a skip reason when the pod already carries
/// this version or a newer one.
async fn deploy_once(
    http: &reqwest::Client,
    node: &MeshNode,
    snapshot: &Snapshot,
) -> Result<Option<&'static str>> {
    if let Some(installed) = installed_version(http, &node.ip).await? {
        if let Some(skip) = skip_reason(installed, snapshot.version) {
            return Ok(Some(skip));
        }
    }

    let url = format!("http://{}:{}/api/providers/rest", node.ip, NODE_API_PORT);
    let response = http
        .put(&url)
        .json(snapshot.config.as_ref())
        .send()
        .await
        .context("pushing the configuration")?;
    if !response.status().is_success() {
        bail!("mesh node returned {}", response.status());
    }

    // The node applies the configuration asynchronously; poll until it
    // reports the pushed version.
    let mut delay = Duration::from_millis(500);
    for _ in 0..CONVERGE_POLLS {
        time::sleep(delay).await;
        if installed_version(http, &node.ip).await? == Some(snapshot.version) {
            return Ok(None);
        }
        delay = (delay * 2).min(CONVERGE_BACKOFF_CAP);
    }
    bail!("mesh node did not converge to version {}", snapshot.version)
}

/// Version-ordering guard: deploy only when it would move the pod forward.
fn skip_reason(installed: i64, version: i64) -> Option<&'static str> {
    if installed > version {
        return Some("superseded by a newer version");
    }
    if installed == version {
        return Some("already applied");
    }
    None
}

/// Reads the version a mesh node currently has loaded, recovered from the
/// reserved pseudo-service the controller stamps into every snapshot.
async fn installed_version(http: &reqwest::Client, ip: &str) -> Result<Option<i64>> {
    let url = format!("http://{}:{}/api/rawdata", ip, NODE_API_PORT);
    let raw: Rawdata = http
        .get(&url)
        .send()
        .await
        .context("fetching the loaded configuration")?
        .error_for_status()
        .context("fetching the loaded configuration")?
        .json()
        .await
        .context("decoding the loaded configuration")?;
    Ok(raw.installed_version())
}

#[derive(Debug, Default, Deserialize)]
struct Rawdata {
    #[serde(default, alias = "Services")]
    services: HashMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
struct RawService {
    #[serde(default, rename = "loadBalancer", alias = "LoadBalancer")]
    load_balancer: RawLoadBalancer,
}

#[derive(Debug, Default, Deserialize)]
struct RawLoadBalancer {
    #[serde(default, alias = "Servers")]
    servers: Vec<RawServer>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    #[serde(default, alias = "URL")]
    url: Option<String>,
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.saturating_pow(attempt.saturating_sub(1)))
}

// === impl Rawdata ===

impl Rawdata {
    fn installed_version(&self) -> Option<i64> {
        let key = format!("{}@rest", config::VERSION_SERVICE);
        self.services
            .get(&key)?
            .load_balancer
            .servers
            .first()?
            .url
            .as_deref()?
            .parse()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outdated_tasks_are_dropped() {
        // A pod already at v2 must drop the task carrying v1.
        assert_eq!(skip_reason(2, 1), Some("superseded by a newer version"));
        assert_eq!(skip_reason(2, 2), Some("already applied"));
        assert_eq!(skip_reason(1, 2), None);
    }

    #[test]
    fn installed_version_is_recovered_from_rawdata() {
        let raw: Rawdata = serde_json::from_str(
            r#"{
                "routers": {},
                "services": {
                    "ab12cd34ef@rest": {
                        "loadBalancer": {"servers": [{"url": "http://10.1.1.50:50"}]}
                    },
                    "version@rest": {
                        "loadBalancer": {"servers": [{"url": "1700000000000000123"}]}
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(raw.installed_version(), Some(1_700_000_000_000_000_123));
    }

    #[test]
    fn missing_sentinel_yields_no_version() {
        let raw: Rawdata = serde_json::from_str(r#"{"services": {}}"#).unwrap();
        assert_eq!(raw.installed_version(), None);

        let raw: Rawdata = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(raw.installed_version(), None);
    }

    #[test]
    fn retry_backoff_doubles() {
        assert_eq!(retry_backoff(1), Duration::from_millis(500));
        assert_eq!(retry_backoff(2), Duration::from_millis(1000));
    }
}
