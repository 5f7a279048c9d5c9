//! Mesh controller resource cache.
//!
//! A single `Index` holds distilled views of every watched resource kind
//! (Services, Endpoints, Pods, and the SMI access-policy kinds) and
//! publishes a typed event for each observed change. The reconcile
//! controller and the deploy engine consume those events; the topology
//! builder reads the cache directly so that every snapshot is computed
//! from one consistent logical view, never from ad-hoc API fetches.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
mod ignore;
pub mod pod;
pub mod service;
pub mod topology;

#[cfg(test)]
mod tests;

pub use self::{
    endpoints::ServiceEndpoints,
    ignore::IgnoreFilter,
    pod::PodInfo,
    service::UserService,
};

use ahash::AHashMap as HashMap;
use mesh_controller_k8s_api::{self as k8s, smi, ResourceExt};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// First host port a mesh node listens on for HTTP traffic; port *i* of an
/// HTTP user service maps to `MESH_HTTP_PORT_BASE + i`.
pub const MESH_HTTP_PORT_BASE: u16 = 5000;

/// Identifies a namespaced resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// An observed cluster change, tagged by resource kind.
#[derive(Clone, Debug)]
pub enum Event {
    Service(ServiceEvent),
    Endpoints(ResourceId),
    Pod(ResourceId),
    /// A proxy pod became ready (or restarted); it needs the current
    /// snapshot redeployed, not a rebuild.
    MeshNode(MeshNode),
    TrafficTarget(ResourceId),
    HttpRouteGroup(ResourceId),
    TrafficSplit(ResourceId),
}

#[derive(Clone, Debug)]
pub enum ServiceEvent {
    Applied(ResourceId),
    Deleted(ResourceId),
}

/// A per-host proxy pod, as needed by the deploy engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshNode {
    pub name: String,
    pub ip: String,
    pub ready: bool,
}

/// How a service's traffic is carried through the mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrafficType {
    Http,
    Tcp,
}

/// Mesh-wide settings shared by the indexers, the shadow-service
/// reconciler, and the topology builder.
#[derive(Clone, Debug)]
pub struct MeshSettings {
    pub mesh_namespace: String,
    pub mesh_domain: String,
    pub default_mode: TrafficType,
    pub acl: bool,
    pub ignore: IgnoreFilter,
}

/// Holds all indexing state. Mutated only by the watch tasks; read by the
/// reconcile controller and the topology builder.
#[derive(Debug)]
pub struct Index {
    settings: Arc<MeshSettings>,
    events: mpsc::UnboundedSender<Event>,

    services: HashMap<ResourceId, UserService>,
    endpoints: HashMap<ResourceId, ServiceEndpoints>,
    pods: HashMap<ResourceId, PodInfo>,
    traffic_targets: HashMap<ResourceId, smi::TrafficTargetSpec>,
    route_groups: HashMap<ResourceId, smi::HTTPRouteGroupSpec>,
    traffic_splits: HashMap<ResourceId, smi::TrafficSplitSpec>,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl TrafficType ===

impl std::str::FromStr for TrafficType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            other => anyhow::bail!("unknown traffic type {other:?}; expected `http` or `tcp`"),
        }
    }
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Tcp => "tcp".fmt(f),
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(settings: Arc<MeshSettings>, events: mpsc::UnboundedSender<Event>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            settings,
            events,
            services: HashMap::default(),
            endpoints: HashMap::default(),
            pods: HashMap::default(),
            traffic_targets: HashMap::default(),
            route_groups: HashMap::default(),
            traffic_splits: HashMap::default(),
        }))
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    pub fn service(&self, id: &ResourceId) -> Option<&UserService> {
        self.services.get(id)
    }

    pub fn services(&self) -> impl Iterator<Item = (&ResourceId, &UserService)> {
        self.services.iter()
    }

    pub fn endpoints(&self, id: &ResourceId) -> Option<&ServiceEndpoints> {
        self.endpoints.get(id)
    }

    pub fn pod(&self, id: &ResourceId) -> Option<&PodInfo> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = (&ResourceId, &PodInfo)> {
        self.pods.iter()
    }

    pub fn traffic_targets(&self) -> impl Iterator<Item = (&ResourceId, &smi::TrafficTargetSpec)> {
        self.traffic_targets.iter()
    }

    pub fn route_group(&self, id: &ResourceId) -> Option<&smi::HTTPRouteGroupSpec> {
        self.route_groups.get(id)
    }

    pub fn traffic_splits(&self) -> impl Iterator<Item = (&ResourceId, &smi::TrafficSplitSpec)> {
        self.traffic_splits.iter()
    }

    /// The current proxy fleet, for the deploy planner and the node
    /// inventory endpoint.
    pub fn mesh_nodes(&self) -> Vec<MeshNode> {
        let mut nodes: Vec<MeshNode> = self
            .pods
            .iter()
            .filter(|(_, pod)| pod.mesh_node)
            .filter_map(|(id, pod)| {
                Some(MeshNode {
                    name: id.name.clone(),
                    ip: pod.ip.clone()?,
                    ready: pod.ready,
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    fn publish(&self, event: Event) {
        if let Err(error) = self.events.send(event) {
            tracing::error!(%error, "Failed to publish cache event");
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, resource: k8s::Service) {
        let namespace = resource.namespace().expect("service must have a namespace");
        let name = resource.name_unchecked();
        if self.settings.ignore.is_ignored(&name, &namespace) {
            return;
        }

        let id = ResourceId::new(namespace, name);
        let service = UserService::from_resource(id.clone(), &resource);
        if self.services.get(&id) == Some(&service) {
            return;
        }
        self.services.insert(id.clone(), service);
        self.publish(Event::Service(ServiceEvent::Applied(id)));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.services.remove(&id).is_some() {
            self.publish(Event::Service(ServiceEvent::Deleted(id)));
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, resource: k8s::Endpoints) {
        let namespace = resource.namespace().expect("endpoints must have a namespace");
        let name = resource.name_unchecked();
        if self.settings.ignore.is_ignored(&name, &namespace) {
            return;
        }

        let id = ResourceId::new(namespace, name);
        let endpoints = ServiceEndpoints::from_resource(&resource);
        if self.endpoints.get(&id) == Some(&endpoints) {
            return;
        }
        self.endpoints.insert(id.clone(), endpoints);
        self.publish(Event::Endpoints(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.endpoints.remove(&id).is_some() {
            self.publish(Event::Endpoints(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, resource: k8s::Pod) {
        let namespace = resource.namespace().expect("pod must have a namespace");
        let name = resource.name_unchecked();
        // Proxy pods live in the mesh namespace, so the mesh exclusion is
        // lifted for pod events.
        if self
            .settings
            .ignore
            .without_mesh()
            .is_ignored(&name, &namespace)
        {
            return;
        }

        let id = ResourceId::new(namespace, name);
        let pod = PodInfo::from_resource(&resource);
        let previous = self.pods.insert(id.clone(), pod.clone());
        if previous.as_ref() == Some(&pod) {
            return;
        }

        if pod.mesh_node {
            // A freshly ready proxy needs the current snapshot; a rebuild
            // would close a reconcile loop over our own pods.
            let became_ready = pod.ready && !previous.map(|p| p.ready).unwrap_or(false);
            if let (true, Some(ip)) = (became_ready, pod.ip) {
                self.publish(Event::MeshNode(MeshNode {
                    name: id.name,
                    ip,
                    ready: true,
                }));
            }
        } else {
            self.publish(Event::Pod(id));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if let Some(pod) = self.pods.remove(&id) {
            if !pod.mesh_node {
                self.publish(Event::Pod(id));
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<smi::TrafficTarget> for Index {
    fn apply(&mut self, resource: smi::TrafficTarget) {
        let namespace = resource.namespace().expect("TrafficTarget must have a namespace");
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);
        if self.traffic_targets.get(&id) == Some(&resource.spec) {
            return;
        }
        self.traffic_targets.insert(id.clone(), resource.spec);
        self.publish(Event::TrafficTarget(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.traffic_targets.remove(&id).is_some() {
            self.publish(Event::TrafficTarget(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<smi::HTTPRouteGroup> for Index {
    fn apply(&mut self, resource: smi::HTTPRouteGroup) {
        let namespace = resource.namespace().expect("HTTPRouteGroup must have a namespace");
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);
        if self.route_groups.get(&id) == Some(&resource.spec) {
            return;
        }
        self.route_groups.insert(id.clone(), resource.spec);
        self.publish(Event::HttpRouteGroup(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.route_groups.remove(&id).is_some() {
            self.publish(Event::HttpRouteGroup(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<smi::TrafficSplit> for Index {
    fn apply(&mut self, resource: smi::TrafficSplit) {
        let namespace = resource.namespace().expect("TrafficSplit must have a namespace");
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);
        if self.traffic_splits.get(&id) == Some(&resource.spec) {
            return;
        }
        self.traffic_splits.insert(id.clone(), resource.spec);
        self.publish(Event::TrafficSplit(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.traffic_splits.remove(&id).is_some() {
            self.publish(Event::TrafficSplit(id));
        }
    }
}
