//! Distills `Service` resources into the state the mesh acts on.

use crate::{ResourceId, TrafficType};
use mesh_controller_k8s_api as k8s;

/// Annotation selecting HTTP or TCP handling for a service's ports.
pub const ANNOTATION_TRAFFIC_TYPE: &str = "traffic-type";

/// Annotation enabling a retry middleware with the given attempt count.
pub const ANNOTATION_RETRY_ATTEMPTS: &str = "retry-attempts";

/// Annotation enabling a circuit-breaker middleware with the given expression.
pub const ANNOTATION_CIRCUIT_BREAKER: &str = "circuit-breaker-expression";

/// A user-declared service as observed by the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserService {
    pub id: ResourceId,
    pub cluster_ip: Option<String>,
    pub ports: Vec<Port>,
    pub traffic_type: Option<TrafficType>,
    pub retry_attempts: u32,
    pub circuit_breaker: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub name: Option<String>,
    pub port: u16,
}

// === impl UserService ===

impl UserService {
    pub fn from_resource(id: ResourceId, service: &k8s::Service) -> Self {
        let spec = service.spec.as_ref();

        let cluster_ip = spec
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None");

        let mut ports = Vec::new();
        for sp in spec.and_then(|s| s.ports.clone()).unwrap_or_default() {
            // The mesh forwards TCP only; other protocols are skipped.
            match sp.protocol.as_deref() {
                None | Some("TCP") => ports.push(Port {
                    name: sp.name,
                    port: sp.port as u16,
                }),
                Some(protocol) => {
                    tracing::info!(
                        service = %id,
                        port = sp.port,
                        %protocol,
                        "Skipping service port with unsupported protocol"
                    );
                }
            }
        }

        let annotations = service.metadata.annotations.clone().unwrap_or_default();

        let traffic_type = annotations.get(ANNOTATION_TRAFFIC_TYPE).and_then(|value| {
            value.parse().map(Some).unwrap_or_else(|error| {
                tracing::warn!(service = %id, %value, %error, "Invalid traffic-type annotation");
                None
            })
        });

        let retry_attempts = annotations
            .get(ANNOTATION_RETRY_ATTEMPTS)
            .and_then(|value| {
                value.parse().map(Some).unwrap_or_else(|error| {
                    tracing::warn!(service = %id, %value, %error, "Invalid retry-attempts annotation");
                    None
                })
            })
            .unwrap_or(0);

        let circuit_breaker = annotations
            .get(ANNOTATION_CIRCUIT_BREAKER)
            .filter(|value| !value.is_empty())
            .cloned();

        Self {
            id,
            cluster_ip,
            ports,
            traffic_type,
            retry_attempts,
            circuit_breaker,
        }
    }

    /// The traffic mode applied to this service's ports.
    pub fn mode(&self, default: TrafficType) -> TrafficType {
        self.traffic_type.unwrap_or(default)
    }
}
