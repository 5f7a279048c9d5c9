//! The reconcile loop.
//!
//! A single worker drains cache events, folds them into a dirty flag plus
//! the set of services whose shadows need attention, and rebuilds the
//! configuration at a bounded cadence. Each successful pass publishes a
//! snapshot with a strictly increasing version and hands it to the deploy
//! engine; failures back off and are dropped after a bounded number of
//! attempts. Mesh-node events bypass the builder entirely and are routed
//! straight to the deploy engine, so a restarting proxy cannot feed back
//! into reconciliation.

use crate::{
    deploy::{PlanEvent, Snapshot},
    metrics::Metrics,
    shadow::ShadowServices,
    state::PortAllocator,
};
use anyhow::{Context, Result};
use chrono::Utc;
use mesh_controller_core::{
    ports::PortsError, ReadinessGate, SnapshotStore,
};
use mesh_controller_k8s_index::{topology, Event, ResourceId, ServiceEvent, SharedIndex};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant, MissedTickBehavior},
};

const TICK: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 3;

pub struct Controller {
    index: SharedIndex,
    shadow: ShadowServices,
    ports: PortAllocator,
    snapshots: Arc<SnapshotStore>,
    readiness: Arc<ReadinessGate>,
    metrics: Metrics,
    plan: mpsc::UnboundedSender<PlanEvent>,
    versions: VersionClock,
}

#[derive(Copy, Clone, Debug)]
enum ServiceOp {
    Ensure,
    Remove,
}

/// Issues strictly increasing versions derived from wall-clock nanoseconds.
///
/// Assumes a single active writer; after a failover the clock restarts
/// from the wall clock, which is assumed to have advanced past any version
/// the previous writer published.
#[derive(Debug, Default)]
struct VersionClock {
    last: i64,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        index: SharedIndex,
        shadow: ShadowServices,
        ports: PortAllocator,
        snapshots: Arc<SnapshotStore>,
        readiness: Arc<ReadinessGate>,
        metrics: Metrics,
        plan: mpsc::UnboundedSender<PlanEvent>,
    ) -> Self {
        Self {
            index,
            shadow,
            ports,
            snapshots,
            readiness,
            metrics,
            plan,
            versions: VersionClock::default(),
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        shutdown: drain::Watch,
    ) -> Result<()> {
        let mut tick = time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut dirty = false;
        let mut pending: HashMap<ResourceId, ServiceOp> = HashMap::new();
        let mut attempts = 0;
        let mut hold_until: Option<Instant> = None;

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Shutdown signaled");
                    return Ok(());
                }

                event = events.recv() => match event {
                    Some(event) => self.observe(event, &mut dirty, &mut pending),
                    None => return Ok(()),
                },

                _ = tick.tick(), if dirty => {
                    if hold_until.map(|until| Instant::now() < until).unwrap_or(false) {
                        continue;
                    }

                    match self.reconcile(&pending).await {
                        Ok(()) => {
                            pending.clear();
                            dirty = false;
                            attempts = 0;
                            hold_until = None;
                        }
                        Err(error) => {
                            self.metrics.reconcile_failures.inc();
                            if is_fatal(&error) {
                                return Err(error);
                            }
                            attempts += 1;
                            if attempts >= MAX_ATTEMPTS {
                                tracing::error!(
                                    %error,
                                    attempts,
                                    "Reconciliation failed; dropping the work item"
                                );
                                pending.clear();
                                dirty = false;
                                attempts = 0;
                                hold_until = None;
                            } else {
                                tracing::warn!(%error, attempt = attempts, "Reconciliation failed; backing off");
                                hold_until = Some(Instant::now() + retry_backoff(attempts));
                            }
                        }
                    }
                }
            }
        }
    }

    fn observe(
        &self,
        event: Event,
        dirty: &mut bool,
        pending: &mut HashMap<ResourceId, ServiceOp>,
    ) {
        match event {
            // Proxy restarts need the current snapshot, not a rebuild.
            Event::MeshNode(node) => {
                let _ = self.plan.send(PlanEvent::MeshNode(node));
            }
            Event::Service(ServiceEvent::Applied(id)) => {
                pending.insert(id, ServiceOp::Ensure);
                *dirty = true;
            }
            Event::Service(ServiceEvent::Deleted(id)) => {
                pending.insert(id, ServiceOp::Remove);
                *dirty = true;
            }
            Event::Endpoints(_)
            | Event::Pod(_)
            | Event::TrafficTarget(_)
            | Event::HttpRouteGroup(_)
            | Event::TrafficSplit(_) => *dirty = true,
        }
    }

    async fn reconcile(&mut self, pending: &HashMap<ResourceId, ServiceOp>) -> Result<()> {
        self.metrics.reconciles.inc();

        let mut ops: Vec<(&ResourceId, &ServiceOp)> = pending.iter().collect();
        ops.sort_by(|a, b| a.0.cmp(b.0));
        for (id, op) in ops {
            match op {
                ServiceOp::Ensure => {
                    // Read through the cache; the service may be gone by now.
                    let svc = self.index.read().service(id).cloned();
                    if let Some(svc) = svc {
                        self.shadow
                            .ensure(&svc, &mut self.ports)
                            .await
                            .with_context(|| format!("reconciling the shadow service of {id}"))?;
                    }
                }
                ServiceOp::Remove => {
                    self.shadow
                        .remove(id, &mut self.ports)
                        .await
                        .with_context(|| format!("removing the shadow service of {id}"))?;
                }
            }
        }

        let mut config = {
            let index = self.index.read();
            topology::build(&index, self.ports.table()).context("building the configuration")?
        };
        let version = self.versions.next();
        config.set_version(version);

        self.snapshots.set(config.clone());
        self.readiness.mark_ready();
        let _ = self.plan.send(PlanEvent::Snapshot(Snapshot {
            version,
            config: Arc::new(config),
        }));
        tracing::debug!(version, "Published configuration snapshot");
        Ok(())
    }
}

// === impl VersionClock ===

impl VersionClock {
    fn next(&mut self) -> i64 {
        let mut version = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        if version <= self.last {
            version = self.last + 1;
        }
        self.last = version;
        version
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<PortsError>(),
        Some(PortsError::PortsExhausted(..))
    )
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.saturating_pow(attempt.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_strictly_increase() {
        let mut clock = VersionClock::default();
        let mut last = clock.next();
        // Far more iterations than nanosecond resolution allows distinct
        // wall-clock reads for.
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(retry_backoff(1), Duration::from_millis(500));
        assert_eq!(retry_backoff(2), Duration::from_millis(1000));
        assert_eq!(retry_backoff(3), Duration::from_millis(2000));
    }

    #[test]
    fn exhausted_ports_are_fatal() {
        let error = anyhow::Error::from(PortsError::PortsExhausted(10000, 10200))
            .context("reconciling the shadow service of default/db");
        assert!(is_fatal(&error));

        let error = anyhow::anyhow!("mesh node returned 500");
        assert!(!is_fatal(&error));
    }
}
