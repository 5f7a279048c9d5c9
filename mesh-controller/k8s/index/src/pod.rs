//! Distills `Pod` resources: source-IP resolution and mesh-node tracking.

use mesh_controller_k8s_api as k8s;

/// Label selecting the per-host proxy pods.
pub const MESH_NODE_COMPONENT_LABEL: &str = "component";
pub const MESH_NODE_COMPONENT: &str = "mesh-node";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub ip: Option<String>,
    pub service_account: String,
    pub mesh_node: bool,
    pub ready: bool,
}

// === impl PodInfo ===

impl PodInfo {
    pub fn from_resource(pod: &k8s::Pod) -> Self {
        let mesh_node = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MESH_NODE_COMPONENT_LABEL))
            .map(|component| component == MESH_NODE_COMPONENT)
            .unwrap_or(false);

        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.clone())
            .unwrap_or_default();

        let status = pod.status.as_ref();
        let ip = status.and_then(|s| s.pod_ip.clone());

        // A pod counts as ready only when every container reports ready.
        let statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.as_slice())
            .unwrap_or_default();
        let ready = !statuses.is_empty() && statuses.iter().all(|c| c.ready);

        Self {
            ip,
            service_account,
            mesh_node,
            ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_controller_k8s_api::ContainerStatus;

    fn pod(component: Option<&str>, ready: &[bool]) -> k8s::Pod {
        k8s::Pod {
            metadata: k8s::ObjectMeta {
                name: Some("pod-0".to_string()),
                namespace: Some("mesh".to_string()),
                labels: component.map(|c| {
                    [(MESH_NODE_COMPONENT_LABEL.to_string(), c.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            spec: Some(k8s::PodSpec {
                service_account_name: Some("mesh-node".to_string()),
                ..Default::default()
            }),
            status: Some(k8s::PodStatus {
                pod_ip: Some("10.4.0.7".to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|r| ContainerStatus {
                            ready: *r,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn detects_mesh_nodes() {
        assert!(PodInfo::from_resource(&pod(Some("mesh-node"), &[true])).mesh_node);
        assert!(!PodInfo::from_resource(&pod(Some("api"), &[true])).mesh_node);
        assert!(!PodInfo::from_resource(&pod(None, &[true])).mesh_node);
    }

    #[test]
    fn ready_requires_every_container() {
        assert!(PodInfo::from_resource(&pod(None, &[true, true])).ready);
        assert!(!PodInfo::from_resource(&pod(None, &[true, false])).ready);
        assert!(!PodInfo::from_resource(&pod(None, &[])).ready);
    }
}
