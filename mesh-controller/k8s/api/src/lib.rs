#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod smi;

pub use k8s_openapi::api::{
    self,
    apps::v1::Deployment,
    core::v1::{
        ConfigMap, Container, ContainerPort, ContainerStatus, EndpointAddress, EndpointPort,
        EndpointSubset, Endpoints, Namespace, ObjectReference, Pod, PodSpec, PodStatus, Service,
        ServicePort, ServiceSpec,
    },
};
pub use k8s_openapi::apimachinery::{self, pkg::util::intstr::IntOrString};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt},
    error::ErrorResponse,
    Client, Error,
};

/// Whether a kube API error is an optimistic-concurrency conflict.
pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: 409, .. }))
}

/// Whether a kube API error reports a missing resource.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: 404, .. }))
}
