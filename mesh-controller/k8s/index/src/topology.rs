//! Computes a routing configuration from the observed cluster state.
//!
//! `build` is a pure function over the cache, the TCP port table, and the
//! mesh settings. Every map that reaches the output is iterated in key
//! order, so two builds over the same observation produce byte-identical
//! encodings; the caller stamps the version afterwards.

use crate::{
    endpoints::{ServiceEndpoints, Subset},
    service::UserService,
    Index, MeshSettings, ResourceId, TrafficType, MESH_HTTP_PORT_BASE,
};
use anyhow::{bail, Result};
use mesh_controller_core::{
    config::{
        CircuitBreaker, Configuration, IpWhiteList, LoadBalancer, Middleware, Retry, Router,
        Server, Service, TcpLoadBalancer, TcpRouter, TcpServer, TcpService,
    },
    fingerprint,
    ports::PortStateTable,
};
use mesh_controller_k8s_api::smi;
use std::collections::BTreeMap;

/// Key of the middleware that blocks traffic not admitted by an allow-list.
pub const BLOCK_ALL_MIDDLEWARE: &str = "block-all";

/// An address no client can hold, making the block-all allow-list unmatchable.
const BLOCK_ALL_SENTINEL: &str = "255.255.255.255";

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
const HTTP_ROUTE_GROUP_KIND: &str = "HTTPRouteGroup";

/// Builds a configuration snapshot from the current cache contents.
pub fn build(index: &Index, ports: &PortStateTable) -> Result<Configuration> {
    let settings = index.settings();
    let mut config = Configuration::default();

    if settings.acl {
        config.http.middlewares.insert(
            BLOCK_ALL_MIDDLEWARE.to_string(),
            Middleware {
                ip_white_list: Some(IpWhiteList {
                    source_range: vec![BLOCK_ALL_SENTINEL.to_string()],
                }),
                ..Default::default()
            },
        );
    }

    let services: BTreeMap<&ResourceId, &UserService> = index.services().collect();
    let targets: BTreeMap<&ResourceId, &smi::TrafficTargetSpec> =
        index.traffic_targets().collect();

    for (id, svc) in services {
        let endpoints = index.endpoints(id);
        for (port_index, port) in svc.ports.iter().enumerate() {
            match svc.mode(settings.default_mode) {
                TrafficType::Http => build_http(
                    &mut config,
                    index,
                    settings,
                    &targets,
                    id,
                    svc,
                    endpoints,
                    port_index,
                    port.port,
                )?,
                TrafficType::Tcp => build_tcp(&mut config, ports, id, endpoints, port.port)?,
            }
        }
    }

    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn build_http(
    config: &mut Configuration,
    index: &Index,
    settings: &MeshSettings,
    targets: &BTreeMap<&ResourceId, &smi::TrafficTargetSpec>,
    id: &ResourceId,
    svc: &UserService,
    endpoints: Option<&ServiceEndpoints>,
    port_index: usize,
    port: u16,
) -> Result<()> {
    let key = fingerprint::service_key(&id.name, &id.namespace, port);
    if config.http.routers.contains_key(&key) {
        bail!("fingerprint collision on {key} while keying {id} port {port}");
    }

    let entry_point = format!("http-{}", usize::from(MESH_HTTP_PORT_BASE) + port_index);

    let mut middlewares = Vec::new();
    if let Some(middleware) = annotation_middleware(svc) {
        config.http.middlewares.insert(key.clone(), middleware);
        middlewares.push(key.clone());
    }
    if settings.acl {
        middlewares.push(BLOCK_ALL_MIDDLEWARE.to_string());
    }

    config.http.routers.insert(
        key.clone(),
        Router {
            rule: host_rule(settings, id, svc),
            entry_points: vec![entry_point.clone()],
            service: key.clone(),
            middlewares,
        },
    );
    config.http.services.insert(
        key,
        Service {
            load_balancer: LoadBalancer {
                pass_host_header: true,
                servers: http_servers(endpoints),
            },
        },
    );

    if settings.acl {
        for (target_id, target) in targets {
            let subsets = applicable_subsets(index, target, id, endpoints);
            if subsets.is_empty() {
                continue;
            }
            build_target(
                config,
                index,
                settings,
                target_id,
                target,
                &subsets,
                id,
                svc,
                &entry_point,
                port,
            )?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_target(
    config: &mut Configuration,
    index: &Index,
    settings: &MeshSettings,
    target_id: &ResourceId,
    target: &smi::TrafficTargetSpec,
    subsets: &[&Subset],
    id: &ResourceId,
    svc: &UserService,
    entry_point: &str,
    port: u16,
) -> Result<()> {
    // The router rule is resolved first: a missing HTTPRouteGroup or an
    // unsupported rule kind leaves the target unrouted so that block-all
    // keeps the destination closed.
    let rule = match target_rule(index, settings, target_id, target, id, svc) {
        Some(rule) => rule,
        None => return Ok(()),
    };

    let key = fingerprint::target_key(&id.name, &id.namespace, port, &target_id.name, &target_id.namespace);
    if config.http.routers.contains_key(&key) {
        bail!("fingerprint collision on {key} while keying {id} port {port} target {target_id}");
    }

    let whitelist = format!("{}-{}-{}-whitelist", target_id.name, target_id.namespace, key);
    config.http.middlewares.insert(
        whitelist.clone(),
        Middleware {
            ip_white_list: Some(IpWhiteList {
                source_range: source_ips(index, &target.sources),
            }),
            ..Default::default()
        },
    );

    let servers = subsets
        .iter()
        .flat_map(|subset| subset_servers(subset))
        .map(|(ip, port)| Server {
            url: format!("http://{}:{}", ip, port),
        })
        .collect();
    config.http.services.insert(
        key.clone(),
        Service {
            load_balancer: LoadBalancer {
                pass_host_header: true,
                servers,
            },
        },
    );
    config.http.routers.insert(
        key.clone(),
        Router {
            rule,
            entry_points: vec![entry_point.to_string()],
            service: key,
            // The allow-list must precede block-all.
            middlewares: vec![whitelist, BLOCK_ALL_MIDDLEWARE.to_string()],
        },
    );

    Ok(())
}

fn build_tcp(
    config: &mut Configuration,
    ports: &PortStateTable,
    id: &ResourceId,
    endpoints: Option<&ServiceEndpoints>,
    port: u16,
) -> Result<()> {
    let listener = match ports.find(&id.name, &id.namespace, port) {
        Some(listener) => listener,
        None => {
            tracing::warn!(service = %id, port, "No TCP listener assigned yet; skipping");
            return Ok(());
        }
    };

    let key = fingerprint::service_key(&id.name, &id.namespace, port);
    if config.tcp.routers.contains_key(&key) {
        bail!("fingerprint collision on {key} while keying {id} port {port}");
    }

    config.tcp.routers.insert(
        key.clone(),
        TcpRouter {
            rule: "HostSNI(`*`)".to_string(),
            entry_points: vec![format!("tcp-{listener}")],
            service: key.clone(),
        },
    );

    let servers = endpoints
        .map(|eps| {
            eps.subsets
                .iter()
                .flat_map(subset_servers)
                .map(|(ip, port)| TcpServer {
                    address: format!("{}:{}", ip, port),
                })
                .collect()
        })
        .unwrap_or_default();
    config.tcp.services.insert(
        key,
        TcpService {
            load_balancer: TcpLoadBalancer { servers },
        },
    );

    Ok(())
}

/// Host rule admitting both the mesh domain name and the user service's
/// cluster IP.
fn host_rule(settings: &MeshSettings, id: &ResourceId, svc: &UserService) -> String {
    let domain = format!(
        "Host(`{}.{}.{}`)",
        id.name, id.namespace, settings.mesh_domain
    );
    match &svc.cluster_ip {
        Some(ip) => format!("{} || Host(`{}`)", domain, ip),
        None => domain,
    }
}

/// Middleware derived from service annotations, if any apply.
fn annotation_middleware(svc: &UserService) -> Option<Middleware> {
    let middleware = Middleware {
        circuit_breaker: svc.circuit_breaker.as_ref().map(|expression| CircuitBreaker {
            expression: expression.clone(),
        }),
        retry: (svc.retry_attempts > 0).then_some(Retry {
            attempts: svc.retry_attempts,
        }),
        ..Default::default()
    };
    (!middleware.is_empty()).then_some(middleware)
}

/// All `ip:port` pairs of the endpoints, in distillation order.
fn subset_servers(subset: &Subset) -> Vec<(String, u16)> {
    let mut servers = Vec::new();
    for address in &subset.addresses {
        for port in &subset.ports {
            servers.push((address.ip.clone(), *port));
        }
    }
    servers
}

fn http_servers(endpoints: Option<&ServiceEndpoints>) -> Vec<Server> {
    endpoints
        .map(|eps| {
            eps.subsets
                .iter()
                .flat_map(subset_servers)
                .map(|(ip, port)| Server {
                    url: format!("http://{}:{}", ip, port),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The endpoint subsets a traffic target applies to: same namespace, the
/// destination port (when set) served, and at least one address backed by
/// a pod running as the destination service account.
fn applicable_subsets<'e>(
    index: &Index,
    target: &smi::TrafficTargetSpec,
    id: &ResourceId,
    endpoints: Option<&'e ServiceEndpoints>,
) -> Vec<&'e Subset> {
    let destination = &target.destination;
    if destination.kind != SERVICE_ACCOUNT_KIND || destination.namespace != id.namespace {
        return Vec::new();
    }
    let endpoints = match endpoints {
        Some(endpoints) => endpoints,
        None => return Vec::new(),
    };

    endpoints
        .subsets
        .iter()
        .filter(|subset| {
            if let Some(port) = destination.port {
                if !subset.ports.contains(&port) {
                    return false;
                }
            }
            subset.addresses.iter().any(|address| {
                address
                    .pod
                    .as_ref()
                    .and_then(|pod_id| {
                        let pod = index.pod(pod_id)?;
                        Some(
                            pod_id.namespace == destination.namespace
                                && pod.service_account == destination.name,
                        )
                    })
                    .unwrap_or(false)
            })
        })
        .collect()
}

/// Resolves the router rule for a traffic target: the OR over every match
/// of every referenced HTTPRouteGroup. `None` when any reference is
/// missing or of an unsupported kind.
fn target_rule(
    index: &Index,
    settings: &MeshSettings,
    target_id: &ResourceId,
    target: &smi::TrafficTargetSpec,
    id: &ResourceId,
    svc: &UserService,
) -> Option<String> {
    let host = format!("({})", host_rule(settings, id, svc));

    let mut clauses = Vec::new();
    for rule in &target.specs {
        if rule.kind != HTTP_ROUTE_GROUP_KIND {
            tracing::warn!(
                target = %target_id,
                kind = %rule.kind,
                "Unsupported traffic spec kind; leaving target closed"
            );
            return None;
        }

        let group_id = ResourceId::new(target_id.namespace.clone(), rule.name.clone());
        let group = match index.route_group(&group_id) {
            Some(group) => group,
            None => {
                tracing::warn!(
                    target = %target_id,
                    group = %group_id,
                    "Referenced HTTPRouteGroup not found; leaving target closed"
                );
                return None;
            }
        };

        for http_match in &group.matches {
            if !rule.matches.is_empty() && !rule.matches.contains(&http_match.name) {
                continue;
            }
            clauses.push(match_clause(http_match, &host));
        }
    }

    if clauses.is_empty() {
        return None;
    }
    Some(format!("({})", clauses.join(" || ")))
}

fn match_clause(http_match: &smi::HttpMatch, host: &str) -> String {
    let mut parts = Vec::new();
    if let Some(path) = &http_match.path_regex {
        parts.push(format!("PathPrefix(`{}`)", path));
    }
    if !http_match.methods.is_empty() && !http_match.methods.iter().any(|m| m == "*") {
        let methods: Vec<String> = http_match
            .methods
            .iter()
            .map(|method| format!("`{}`", method))
            .collect();
        parts.push(format!("Method({})", methods.join(",")));
    }
    parts.push(host.to_string());
    format!("({})", parts.join(" && "))
}

/// Resolves source identities to the IPs of their pods, sorted and deduped.
fn source_ips(index: &Index, sources: &[smi::IdentityBindingSubject]) -> Vec<String> {
    let mut ips: Vec<String> = index
        .pods()
        .filter_map(|(pod_id, pod)| {
            let matched = sources.iter().any(|source| {
                source.kind == SERVICE_ACCOUNT_KIND
                    && source.namespace == pod_id.namespace
                    && source.name == pod.service_account
            });
            if matched {
                pod.ip.clone()
            } else {
                None
            }
        })
        .collect();
    ips.sort();
    ips.dedup();
    ips
}
