//! Service Mesh Interface access-policy resources consumed by the builder.

mod http_route_group;
mod traffic_split;
mod traffic_target;

pub use self::{
    http_route_group::{HTTPRouteGroup, HTTPRouteGroupSpec, HttpMatch},
    traffic_split::{TrafficSplit, TrafficSplitBackend, TrafficSplitSpec},
    traffic_target::{IdentityBindingSubject, TrafficTarget, TrafficTargetRule, TrafficTargetSpec},
};
