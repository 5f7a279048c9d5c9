//! The dynamic routing configuration deployed to mesh nodes.
//!
//! A `Configuration` is the unit of deployment: a complete snapshot of HTTP
//! and TCP routers, load-balanced services, and middlewares. Entries are
//! held in `BTreeMap`s so that two builds over the same observation encode
//! to identical JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of the reserved pseudo-service that carries the snapshot version.
///
/// Mesh nodes echo the configuration back on their API; the version is
/// recovered from this entry's first server URL, which holds a decimal
/// nanosecond timestamp rather than an address.
pub const VERSION_SERVICE: &str = "version";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "HTTP")]
    pub http: HttpConfiguration,
    #[serde(rename = "TCP")]
    pub tcp: TcpConfiguration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpConfiguration {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpConfiguration {
    pub routers: BTreeMap<String, TcpRouter>,
    pub services: BTreeMap<String, TcpService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Router {
    pub rule: String,
    pub entry_points: Vec<String>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancer {
    pub pass_host_header: bool,
    pub servers: Vec<Server>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpRouter {
    pub rule: String,
    pub entry_points: Vec<String>,
    pub service: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpService {
    pub load_balancer: TcpLoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpLoadBalancer {
    pub servers: Vec<TcpServer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpServer {
    pub address: String,
}

/// A middleware attached to an HTTP router. At most one is emitted per
/// router key; the fields that apply are populated and the rest are left
/// out of the encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Middleware {
    #[serde(rename = "IPWhiteList", skip_serializing_if = "Option::is_none")]
    pub ip_white_list: Option<IpWhiteList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpWhiteList {
    pub source_range: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreaker {
    pub expression: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retry {
    pub attempts: u32,
}

// === impl Configuration ===

impl Configuration {
    /// Stamps the snapshot with its version by installing the reserved
    /// pseudo-service. Replaces any previously stamped version.
    pub fn set_version(&mut self, version: i64) {
        self.http.services.insert(
            VERSION_SERVICE.to_string(),
            Service {
                load_balancer: LoadBalancer {
                    pass_host_header: true,
                    servers: vec![Server {
                        url: version.to_string(),
                    }],
                },
            },
        );
    }

    /// Reads the version stamped by `set_version`, if any.
    pub fn version(&self) -> Option<i64> {
        let svc = self.http.services.get(VERSION_SERVICE)?;
        let server = svc.load_balancer.servers.first()?;
        server.url.parse().ok()
    }
}

impl Middleware {
    pub fn is_empty(&self) -> bool {
        self.ip_white_list.is_none() && self.circuit_breaker.is_none() && self.retry.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_config() -> Configuration {
        let mut config = Configuration::default();
        config.http.routers.insert(
            "ab12cd34ef".to_string(),
            Router {
                rule: "Host(`demo.default.mesh`) || Host(`10.1.0.1`)".to_string(),
                entry_points: vec!["http-5000".to_string()],
                service: "ab12cd34ef".to_string(),
                middlewares: vec![],
            },
        );
        config.http.services.insert(
            "ab12cd34ef".to_string(),
            Service {
                load_balancer: LoadBalancer {
                    pass_host_header: true,
                    servers: vec![Server {
                        url: "http://10.1.1.50:50".to_string(),
                    }],
                },
            },
        );
        config.tcp.routers.insert(
            "99aabbccdd".to_string(),
            TcpRouter {
                rule: "HostSNI(`*`)".to_string(),
                entry_points: vec!["tcp-10000".to_string()],
                service: "99aabbccdd".to_string(),
            },
        );
        config
    }

    #[test]
    fn roundtrips_through_json() {
        let config = demo_config();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Configuration = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn wire_shape() {
        let config = demo_config();
        let value: serde_json::Value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value["HTTP"]["Routers"]["ab12cd34ef"]["EntryPoints"][0],
            "http-5000"
        );
        assert_eq!(
            value["HTTP"]["Services"]["ab12cd34ef"]["LoadBalancer"]["PassHostHeader"],
            true
        );
        assert_eq!(
            value["HTTP"]["Services"]["ab12cd34ef"]["LoadBalancer"]["Servers"][0]["URL"],
            "http://10.1.1.50:50"
        );
        assert_eq!(value["TCP"]["Routers"]["99aabbccdd"]["Rule"], "HostSNI(`*`)");
        // No middlewares were attached, so the router key is absent.
        assert!(value["HTTP"]["Routers"]["ab12cd34ef"]
            .get("Middlewares")
            .is_none());
    }

    #[test]
    fn middleware_wire_shape() {
        let mw = Middleware {
            ip_white_list: Some(IpWhiteList {
                source_range: vec!["10.2.0.5".to_string(), "10.2.0.6".to_string()],
            }),
            circuit_breaker: Some(CircuitBreaker {
                expression: "NetworkErrorRatio() > 0.5".to_string(),
            }),
            retry: Some(Retry { attempts: 3 }),
        };
        let value = serde_json::to_value(&mw).unwrap();
        assert_eq!(value["IPWhiteList"]["SourceRange"][0], "10.2.0.5");
        assert_eq!(
            value["CircuitBreaker"]["Expression"],
            "NetworkErrorRatio() > 0.5"
        );
        assert_eq!(value["Retry"]["Attempts"], 3);
    }

    #[test]
    fn version_stamp_roundtrip() {
        let mut config = demo_config();
        assert_eq!(config.version(), None);
        config.set_version(1_700_000_000_000_000_123);
        assert_eq!(config.version(), Some(1_700_000_000_000_000_123));

        // Restamping replaces the sentinel rather than accumulating.
        config.set_version(1_700_000_000_000_000_124);
        assert_eq!(config.version(), Some(1_700_000_000_000_000_124));
        assert_eq!(
            config
                .http
                .services
                .get(VERSION_SERVICE)
                .unwrap()
                .load_balancer
                .servers
                .len(),
            1
        );
    }

    #[test]
    fn identical_inputs_encode_identically() {
        let a = serde_json::to_string(&demo_config()).unwrap();
        let b = serde_json::to_string(&demo_config()).unwrap();
        assert_eq!(a, b);
    }
}
