//! Distills `Endpoints` resources for the topology builder.

use crate::ResourceId;
use mesh_controller_k8s_api as k8s;

/// The ready addresses behind a user service.
///
/// Subsets, addresses, and ports are sorted at distillation time so that
/// every iteration downstream is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub subsets: Vec<Subset>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subset {
    pub addresses: Vec<Address>,
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub ip: String,
    pub pod: Option<ResourceId>,
}

// === impl ServiceEndpoints ===

impl ServiceEndpoints {
    pub fn from_resource(endpoints: &k8s::Endpoints) -> Self {
        let mut subsets = Vec::new();
        for subset in endpoints.subsets.clone().unwrap_or_default() {
            let mut addresses: Vec<Address> = subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .map(|addr| Address {
                    ip: addr.ip,
                    pod: addr.target_ref.and_then(pod_ref),
                })
                .collect();
            addresses.sort();

            let mut ports: Vec<u16> = subset
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.port as u16)
                .collect();
            ports.sort_unstable();

            subsets.push(Subset { addresses, ports });
        }
        subsets.sort();
        Self { subsets }
    }
}

fn pod_ref(target: k8s::ObjectReference) -> Option<ResourceId> {
    if target.kind.as_deref() != Some("Pod") {
        return None;
    }
    Some(ResourceId::new(target.namespace?, target.name?))
}
