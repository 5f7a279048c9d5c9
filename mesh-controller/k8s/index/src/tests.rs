use crate::{
    topology, Event, IgnoreFilter, Index, MeshSettings, ResourceId, SharedIndex, TrafficType,
};
use kubert::index::IndexNamespacedResource;
use mesh_controller_core::{fingerprint, ports::PortStateTable};
use mesh_controller_k8s_api::{self as k8s, smi};
use std::sync::Arc;
use tokio::sync::mpsc;

struct TestConfig {
    index: SharedIndex,
    events: mpsc::UnboundedReceiver<Event>,
    ports: PortStateTable,
}

impl TestConfig {
    fn new(acl: bool) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let settings = Arc::new(MeshSettings {
            mesh_namespace: "mesh".to_string(),
            mesh_domain: "mesh".to_string(),
            default_mode: TrafficType::Http,
            acl,
            ignore: IgnoreFilter::new("mesh", vec![]),
        });
        Self {
            index: Index::shared(settings, tx),
            events,
            ports: PortStateTable::new(10000, 10200),
        }
    }

    fn build(&self) -> mesh_controller_core::Configuration {
        topology::build(&self.index.read(), &self.ports).expect("build should succeed")
    }
}

fn service(
    namespace: &str,
    name: &str,
    cluster_ip: &str,
    ports: &[(Option<&str>, i32)],
    annotations: &[(&str, &str)],
) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| k8s::ServicePort {
                        name: name.map(Into::into),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn endpoints(
    namespace: &str,
    name: &str,
    addresses: &[(&str, Option<&str>)],
    ports: &[i32],
) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(
                addresses
                    .iter()
                    .map(|(ip, pod)| k8s::EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: pod.map(|pod| k8s::ObjectReference {
                            kind: Some("Pod".to_string()),
                            name: Some(pod.to_string()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            not_ready_addresses: None,
            ports: Some(
                ports
                    .iter()
                    .map(|port| k8s::EndpointPort {
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
        }]),
    }
}

fn pod(
    namespace: &str,
    name: &str,
    ip: &str,
    service_account: &str,
    component: Option<&str>,
    ready: bool,
) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: component.map(|component| {
                [("component".to_string(), component.to_string())]
                    .into_iter()
                    .collect()
            }),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            service_account_name: Some(service_account.to_string()),
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(vec![k8s::ContainerStatus {
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn traffic_target(
    namespace: &str,
    name: &str,
    destination: smi::IdentityBindingSubject,
    sources: &[(&str, &str)],
    specs: &[(&str, &str)],
) -> smi::TrafficTarget {
    smi::TrafficTarget {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: smi::TrafficTargetSpec {
            destination,
            sources: sources
                .iter()
                .map(|(name, namespace)| smi::IdentityBindingSubject {
                    kind: "ServiceAccount".to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    port: None,
                })
                .collect(),
            specs: specs
                .iter()
                .map(|(kind, name)| smi::TrafficTargetRule {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    matches: vec![],
                })
                .collect(),
        },
    }
}

fn route_group(
    namespace: &str,
    name: &str,
    matches: &[(&str, &str, &[&str])],
) -> smi::HTTPRouteGroup {
    smi::HTTPRouteGroup {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: smi::HTTPRouteGroupSpec {
            matches: matches
                .iter()
                .map(|(name, path, methods)| smi::HttpMatch {
                    name: name.to_string(),
                    path_regex: Some(path.to_string()),
                    methods: methods.iter().map(|m| m.to_string()).collect(),
                })
                .collect(),
        },
    }
}

#[test]
fn single_http_service() {
    let test = TestConfig::new(false);
    test.index
        .write()
        .apply(service("default", "demo", "10.1.0.1", &[(Some("h"), 80)], &[]));
    test.index
        .write()
        .apply(endpoints("default", "demo", &[("10.1.1.50", None)], &[50]));

    let config = test.build();
    let key = fingerprint::service_key("demo", "default", 80);

    let router = config.http.routers.get(&key).expect("router should exist");
    assert_eq!(router.rule, "Host(`demo.default.mesh`) || Host(`10.1.0.1`)");
    assert_eq!(router.entry_points, vec!["http-5000".to_string()]);
    assert_eq!(router.service, key);
    assert!(router.middlewares.is_empty());

    let svc = config.http.services.get(&key).expect("service should exist");
    assert!(svc.load_balancer.pass_host_header);
    assert_eq!(svc.load_balancer.servers.len(), 1);
    assert_eq!(svc.load_balancer.servers[0].url, "http://10.1.1.50:50");

    assert!(config.tcp.routers.is_empty());
}

#[test]
fn tcp_service_uses_assigned_listener() {
    let mut test = TestConfig::new(false);
    assert_eq!(test.ports.add("db", "default", 5432).unwrap(), 10000);

    test.index.write().apply(service(
        "default",
        "db",
        "10.1.0.2",
        &[(None, 5432)],
        &[("traffic-type", "tcp")],
    ));
    test.index
        .write()
        .apply(endpoints("default", "db", &[("10.1.1.51", None)], &[5432]));

    let config = test.build();
    let key = fingerprint::service_key("db", "default", 5432);

    let router = config.tcp.routers.get(&key).expect("TCP router should exist");
    assert_eq!(router.rule, "HostSNI(`*`)");
    assert_eq!(router.entry_points, vec!["tcp-10000".to_string()]);

    let svc = config.tcp.services.get(&key).expect("TCP service should exist");
    assert_eq!(svc.load_balancer.servers.len(), 1);
    assert_eq!(svc.load_balancer.servers[0].address, "10.1.1.51:5432");

    assert!(config.http.routers.is_empty());
}

#[test]
fn tcp_service_without_listener_is_skipped() {
    let test = TestConfig::new(false);
    test.index.write().apply(service(
        "default",
        "db",
        "10.1.0.2",
        &[(None, 5432)],
        &[("traffic-type", "tcp")],
    ));

    let config = test.build();
    assert!(config.tcp.routers.is_empty());
    assert!(config.tcp.services.is_empty());
}

#[test]
fn annotation_middlewares_attach_to_router() {
    let test = TestConfig::new(false);
    test.index.write().apply(service(
        "default",
        "demo",
        "10.1.0.1",
        &[(None, 80)],
        &[
            ("retry-attempts", "3"),
            ("circuit-breaker-expression", "NetworkErrorRatio() > 0.5"),
        ],
    ));

    let config = test.build();
    let key = fingerprint::service_key("demo", "default", 80);

    let router = config.http.routers.get(&key).unwrap();
    assert_eq!(router.middlewares, vec![key.clone()]);

    let middleware = config.http.middlewares.get(&key).unwrap();
    assert_eq!(middleware.retry.as_ref().unwrap().attempts, 3);
    assert_eq!(
        middleware.circuit_breaker.as_ref().unwrap().expression,
        "NetworkErrorRatio() > 0.5"
    );
    assert!(middleware.ip_white_list.is_none());
}

#[test]
fn access_policy_whitelist() {
    let test = TestConfig::new(true);
    test.index.write().apply(service(
        "default",
        "api",
        "10.0.0.8",
        &[(None, 8080)],
        &[],
    ));
    test.index.write().apply(endpoints(
        "default",
        "api",
        &[("10.1.2.3", Some("api-0"))],
        &[8080],
    ));
    test.index
        .write()
        .apply(pod("default", "api-0", "10.1.2.3", "api", None, true));
    test.index.write().apply(pod(
        "default",
        "prometheus-0",
        "10.2.0.5",
        "prometheus",
        None,
        true,
    ));
    test.index.write().apply(pod(
        "default",
        "prometheus-1",
        "10.2.0.6",
        "prometheus",
        None,
        true,
    ));
    test.index.write().apply(traffic_target(
        "default",
        "tt",
        smi::IdentityBindingSubject {
            kind: "ServiceAccount".to_string(),
            name: "api".to_string(),
            namespace: "default".to_string(),
            port: Some(8080),
        },
        &[("prometheus", "default")],
        &[("HTTPRouteGroup", "api-routes")],
    ));
    test.index.write().apply(route_group(
        "default",
        "api-routes",
        &[("metrics", "/metrics", &["GET"])],
    ));

    let config = test.build();
    let key = fingerprint::service_key("api", "default", 8080);
    let target_key = fingerprint::target_key("api", "default", 8080, "tt", "default");
    let whitelist = format!("tt-default-{}-whitelist", target_key);

    // The base router fails closed.
    let base = config.http.routers.get(&key).unwrap();
    assert_eq!(base.middlewares, vec!["block-all".to_string()]);
    let block_all = config.http.middlewares.get("block-all").unwrap();
    assert_eq!(
        block_all.ip_white_list.as_ref().unwrap().source_range,
        vec!["255.255.255.255".to_string()]
    );

    // The target router admits the whitelisted sources.
    let router = config.http.routers.get(&target_key).expect("target router");
    assert_eq!(
        router.rule,
        "((PathPrefix(`/metrics`) && Method(`GET`) && (Host(`api.default.mesh`) || Host(`10.0.0.8`))))"
    );
    assert_eq!(
        router.middlewares,
        vec![whitelist.clone(), "block-all".to_string()]
    );

    let middleware = config.http.middlewares.get(&whitelist).unwrap();
    assert_eq!(
        middleware.ip_white_list.as_ref().unwrap().source_range,
        vec!["10.2.0.5".to_string(), "10.2.0.6".to_string()]
    );

    let svc = config.http.services.get(&target_key).unwrap();
    assert_eq!(svc.load_balancer.servers.len(), 1);
    assert_eq!(svc.load_balancer.servers[0].url, "http://10.1.2.3:8080");
}

#[test]
fn missing_route_group_fails_closed() {
    let test = TestConfig::new(true);
    test.index.write().apply(service(
        "default",
        "api",
        "10.0.0.8",
        &[(None, 8080)],
        &[],
    ));
    test.index.write().apply(endpoints(
        "default",
        "api",
        &[("10.1.2.3", Some("api-0"))],
        &[8080],
    ));
    test.index
        .write()
        .apply(pod("default", "api-0", "10.1.2.3", "api", None, true));
    test.index.write().apply(traffic_target(
        "default",
        "tt",
        smi::IdentityBindingSubject {
            kind: "ServiceAccount".to_string(),
            name: "api".to_string(),
            namespace: "default".to_string(),
            port: None,
        },
        &[("prometheus", "default")],
        &[("HTTPRouteGroup", "absent-routes")],
    ));

    let config = test.build();
    let target_key = fingerprint::target_key("api", "default", 8080, "tt", "default");

    assert!(config.http.routers.get(&target_key).is_none());
    let base = config
        .http
        .routers
        .get(&fingerprint::service_key("api", "default", 8080))
        .unwrap();
    assert_eq!(base.middlewares, vec!["block-all".to_string()]);
}

#[test]
fn missing_endpoints_yield_empty_server_list() {
    let test = TestConfig::new(false);
    test.index
        .write()
        .apply(service("default", "demo", "10.1.0.1", &[(None, 80)], &[]));

    let config = test.build();
    let key = fingerprint::service_key("demo", "default", 80);
    assert!(config.http.routers.contains_key(&key));
    assert!(config.http.services.get(&key).unwrap().load_balancer.servers.is_empty());
}

#[test]
fn builds_are_deterministic() {
    let populate = |test: &TestConfig| {
        test.index.write().apply(service(
            "default",
            "demo",
            "10.1.0.1",
            &[(Some("h"), 80), (Some("h2"), 81)],
            &[("retry-attempts", "2")],
        ));
        test.index
            .write()
            .apply(endpoints("default", "demo", &[("10.1.1.50", None)], &[50]));
        test.index
            .write()
            .apply(service("prod", "other", "10.1.0.9", &[(None, 80)], &[]));
    };

    let test_a = TestConfig::new(false);
    populate(&test_a);
    let test_b = TestConfig::new(false);
    populate(&test_b);

    let a = serde_json::to_string(&test_a.build()).unwrap();
    let b = serde_json::to_string(&test_b.build()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn one_router_per_fingerprint() {
    let test = TestConfig::new(false);
    test.index
        .write()
        .apply(service("default", "demo", "10.1.0.1", &[(None, 80)], &[]));
    test.index
        .write()
        .apply(service("prod", "demo", "10.1.0.2", &[(None, 80)], &[]));

    let config = test.build();
    assert_eq!(config.http.routers.len(), 2);
    assert_ne!(
        fingerprint::service_key("demo", "default", 80),
        fingerprint::service_key("demo", "prod", 80)
    );
}

#[test]
fn second_port_uses_next_entrypoint() {
    let test = TestConfig::new(false);
    test.index.write().apply(service(
        "default",
        "demo",
        "10.1.0.1",
        &[(Some("a"), 80), (Some("b"), 90)],
        &[],
    ));

    let config = test.build();
    let second = config
        .http
        .routers
        .get(&fingerprint::service_key("demo", "default", 90))
        .unwrap();
    assert_eq!(second.entry_points, vec!["http-5001".to_string()]);
}

#[test]
fn mesh_pod_events_route_to_deployer() {
    let mut test = TestConfig::new(false);

    test.index
        .write()
        .apply(pod("mesh", "mesh-node-abc", "10.4.0.7", "mesh-node", Some("mesh-node"), true));
    match test.events.try_recv() {
        Ok(Event::MeshNode(node)) => {
            assert_eq!(node.name, "mesh-node-abc");
            assert_eq!(node.ip, "10.4.0.7");
        }
        other => panic!("expected a mesh-node event, got {other:?}"),
    }

    // A plain workload pod marks the topology dirty instead.
    test.index
        .write()
        .apply(pod("default", "app-0", "10.1.9.9", "app", None, true));
    assert!(matches!(test.events.try_recv(), Ok(Event::Pod(_))));
}

#[test]
fn resyncs_do_not_reemit_events() {
    let mut test = TestConfig::new(false);
    let svc = service("default", "demo", "10.1.0.1", &[(None, 80)], &[]);

    test.index.write().apply(svc.clone());
    assert!(matches!(
        test.events.try_recv(),
        Ok(Event::Service(crate::ServiceEvent::Applied(_)))
    ));

    test.index.write().apply(svc);
    assert!(test.events.try_recv().is_err(), "identical re-apply must be silent");
}

#[test]
fn ignored_namespaces_are_not_indexed() {
    let mut test = TestConfig::new(false);
    test.index
        .write()
        .apply(service("kube-system", "dns", "10.0.0.10", &[(None, 53)], &[]));
    test.index
        .write()
        .apply(service("default", "kubernetes", "10.0.0.1", &[(None, 443)], &[]));

    assert!(test.events.try_recv().is_err());
    assert!(test
        .index
        .read()
        .service(&ResourceId::new("kube-system", "dns"))
        .is_none());
    assert!(test.build().http.routers.is_empty());
}
