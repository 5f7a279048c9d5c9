use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub reconciles: Counter,
    pub reconcile_failures: Counter,
    pub deploys: Counter,
    pub deploy_failures: Counter,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "reconciles",
            "Configuration rebuilds attempted",
            metrics.reconciles.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Configuration rebuilds that failed",
            metrics.reconcile_failures.clone(),
        );
        registry.register(
            "deploys",
            "Snapshot deployments accepted by a mesh node",
            metrics.deploys.clone(),
        );
        registry.register(
            "deploy_failures",
            "Snapshot deployments dropped after exhausting retries",
            metrics.deploy_failures.clone(),
        );
        metrics
    }
}
