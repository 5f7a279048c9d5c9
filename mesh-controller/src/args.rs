use crate::{
    controller::Controller,
    deploy::Deployer,
    metrics::Metrics,
    shadow::ShadowServices,
    state::PortAllocator,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use mesh_controller_core::{DeployLog, ReadinessGate, SnapshotStore};
use mesh_controller_k8s_api::{self as k8s, smi, Client, Resource};
use mesh_controller_k8s_index::{IgnoreFilter, Index, MeshSettings, TrafficType};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "mesh-controller", about = "A service-mesh control plane")]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_controller=info,warn",
        env = "MESH_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace the mesh components run in.
    #[clap(long, default_value = "mesh")]
    mesh_namespace: String,

    /// Domain suffix that resolves into the mesh.
    #[clap(long, default_value = "mesh")]
    mesh_domain: String,

    /// Traffic mode for services without a traffic-type annotation.
    #[clap(long, default_value = "http")]
    default_mode: TrafficType,

    /// Enforce SMI access policies; traffic is blocked unless a
    /// TrafficTarget admits it.
    #[clap(long)]
    acl: bool,

    /// Namespaces the mesh never touches, in addition to the system set.
    #[clap(long = "ignore-namespace")]
    ignore_namespaces: Vec<String>,

    /// Lowest TCP listener port assigned to meshed TCP services.
    #[clap(long, default_value = "10000")]
    tcp_port_min: u16,

    /// Highest TCP listener port assigned to meshed TCP services.
    #[clap(long, default_value = "10200")]
    tcp_port_max: u16,

    /// Number of per-pod deploy records retained.
    #[clap(long, default_value = "1000")]
    deploy_log_capacity: usize,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            mesh_namespace,
            mesh_domain,
            default_mode,
            acl,
            ignore_namespaces,
            tcp_port_min,
            tcp_port_max,
            deploy_log_capacity,
        } = self;

        if tcp_port_min > tcp_port_max {
            bail!("--tcp-port-min must not exceed --tcp-port-max");
        }

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("mesh_controller"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let settings = Arc::new(MeshSettings {
            mesh_namespace: mesh_namespace.clone(),
            mesh_domain,
            default_mode,
            acl,
            ignore: IgnoreFilter::new(mesh_namespace.clone(), ignore_namespaces),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let index = Index::shared(settings.clone(), events_tx);

        // Spawn resource watches feeding the cache.

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), endpoints).instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        if acl {
            if api_resource_exists::<smi::TrafficTarget>(&runtime.client()).await {
                let targets = runtime.watch_all::<smi::TrafficTarget>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(index.clone(), targets)
                        .instrument(info_span!("traffictargets")),
                );
            } else {
                warn!("traffictargets.access.smi-spec.io resource kind not found, skipping watches");
            }

            if api_resource_exists::<smi::HTTPRouteGroup>(&runtime.client()).await {
                let groups = runtime.watch_all::<smi::HTTPRouteGroup>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(index.clone(), groups)
                        .instrument(info_span!("httproutegroups")),
                );
            } else {
                warn!("httproutegroups.specs.smi-spec.io resource kind not found, skipping watches");
            }

            if api_resource_exists::<smi::TrafficSplit>(&runtime.client()).await {
                let splits = runtime.watch_all::<smi::TrafficSplit>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(index.clone(), splits)
                        .instrument(info_span!("trafficsplits")),
                );
            } else {
                warn!("trafficsplits.split.smi-spec.io resource kind not found, skipping watches");
            }
        }

        // Failing to restore listener assignments would reshuffle live
        // traffic, so this is fatal.
        let ports = PortAllocator::load(
            runtime.client(),
            &mesh_namespace,
            tcp_port_min,
            tcp_port_max,
        )
        .await?;

        let snapshots = Arc::new(SnapshotStore::new());
        let readiness = Arc::new(ReadinessGate::new());
        let deploy_log = Arc::new(DeployLog::new(deploy_log_capacity));

        let (plan_tx, plan_rx) = mpsc::unbounded_channel();

        let deployer = Deployer::new(index.clone(), deploy_log, metrics.clone())?;
        tokio::spawn(
            deployer
                .run(plan_rx, runtime.shutdown_handle())
                .instrument(info_span!("deploy")),
        );

        let shadow = ShadowServices::new(runtime.client(), settings);
        let controller = Controller::new(
            index,
            shadow,
            ports,
            snapshots,
            readiness,
            metrics,
            plan_tx,
        );
        let reconcile = tokio::spawn(
            controller
                .run(events_rx, runtime.shutdown_handle())
                .instrument(info_span!("reconcile")),
        );

        // Block on the shutdown signal; a fatal reconcile error (e.g. an
        // exhausted port range) terminates the process instead.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = reconcile => match res {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error.context("reconcile controller failed")),
                Err(error) => {
                    return Err(anyhow::Error::from(error).context("reconcile controller panicked"))
                }
            },
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    let resources = match client.list_api_group_resources(&T::api_version(&dt)).await {
        Ok(resources) => resources,
        Err(error) => {
            warn!(%error, "Failed to list API group resources");
            return false;
        }
    };
    resources.resources.iter().any(|r| r.kind == T::kind(&dt))
}
