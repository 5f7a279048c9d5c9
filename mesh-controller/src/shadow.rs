//! Maintains the shadow service behind every user service.
//!
//! A shadow service lives in the mesh namespace, selects the mesh-node
//! pods, and maps each user port to the mesh listener that carries it:
//! `5000 + i` for HTTP ports, the assigned TCP listener otherwise. After a
//! shadow is first created, the user service's external IPs are pointed at
//! the shadow's cluster IP so the mesh domain resolves into the mesh.

use crate::state::PortAllocator;
use anyhow::{bail, Context, Result};
use mesh_controller_k8s_api::{self as k8s, Api, Client, DeleteParams, PostParams};
use mesh_controller_k8s_index::{
    MeshSettings, ResourceId, TrafficType, UserService, MESH_HTTP_PORT_BASE,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const MAX_NAME_LEN: usize = 63;
const NAME_HASH_LEN: usize = 10;
const MAX_UPDATE_ATTEMPTS: usize = 3;

const LABEL_APP: &str = "app";
const LABEL_COMPONENT: &str = "component";
const LABEL_SERVICE_NAME: &str = "service-name";
const LABEL_SERVICE_NAMESPACE: &str = "service-namespace";

pub struct ShadowServices {
    client: Client,
    settings: Arc<MeshSettings>,
}

/// The name of the shadow service for a user service. Names that would
/// exceed the orchestrator's 63-character limit are truncated and suffixed
/// with a digest of the full name, so two distinct services never collide.
pub fn shadow_name(mesh_namespace: &str, name: &str, namespace: &str) -> String {
    let full = format!("{}-{}-{}", mesh_namespace, name, namespace);
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let digest = Sha256::digest(full.as_bytes());
    let mut suffix = String::with_capacity(NAME_HASH_LEN);
    for byte in digest.iter() {
        suffix.push_str(&format!("{:02x}", byte));
        if suffix.len() >= NAME_HASH_LEN {
            break;
        }
    }
    suffix.truncate(NAME_HASH_LEN);

    format!("{}-{}", &full[..MAX_NAME_LEN - NAME_HASH_LEN - 1], suffix)
}

// === impl ShadowServices ===

impl ShadowServices {
    pub fn new(client: Client, settings: Arc<MeshSettings>) -> Self {
        Self { client, settings }
    }

    /// Creates or updates the shadow service for a user service.
    pub async fn ensure(&self, svc: &UserService, ports: &mut PortAllocator) -> Result<()> {
        let name = shadow_name(&self.settings.mesh_namespace, &svc.id.name, &svc.id.namespace);

        let mut shadow_ports = Vec::with_capacity(svc.ports.len());
        for (port_index, port) in svc.ports.iter().enumerate() {
            let target = match svc.mode(self.settings.default_mode) {
                TrafficType::Http => MESH_HTTP_PORT_BASE + port_index as u16,
                TrafficType::Tcp => {
                    ports
                        .ensure(&svc.id.name, &svc.id.namespace, port.port)
                        .await?
                }
            };
            shadow_ports.push(k8s::ServicePort {
                name: port.name.clone(),
                port: i32::from(port.port),
                protocol: Some("TCP".to_string()),
                target_port: Some(k8s::IntOrString::Int(i32::from(target))),
                ..Default::default()
            });
        }

        let api = Api::<k8s::Service>::namespaced(self.client.clone(), &self.settings.mesh_namespace);
        match api
            .get_opt(&name)
            .await
            .with_context(|| format!("looking up shadow service {name}"))?
        {
            None => {
                let created = api
                    .create(
                        &PostParams::default(),
                        &self.shadow_service(&name, svc, shadow_ports),
                    )
                    .await
                    .with_context(|| format!("creating shadow service {name}"))?;
                tracing::info!(shadow = %name, service = %svc.id, "Created shadow service");

                if let Some(cluster_ip) = created
                    .spec
                    .and_then(|spec| spec.cluster_ip)
                    .filter(|ip| !ip.is_empty() && ip != "None")
                {
                    self.set_external_ip(svc, cluster_ip).await?;
                }
            }
            Some(existing) => {
                self.check_ownership(&name, &existing, svc)?;
                self.update(&api, &name, existing, shadow_ports, svc).await?;
            }
        }

        Ok(())
    }

    /// Deletes the shadow service and releases its TCP listeners.
    pub async fn remove(&self, id: &ResourceId, ports: &mut PortAllocator) -> Result<()> {
        let name = shadow_name(&self.settings.mesh_namespace, &id.name, &id.namespace);
        let api = Api::<k8s::Service>::namespaced(self.client.clone(), &self.settings.mesh_namespace);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => tracing::info!(shadow = %name, service = %id, "Deleted shadow service"),
            Err(error) if k8s::is_not_found(&error) => {}
            Err(error) => {
                return Err(error).with_context(|| format!("deleting shadow service {name}"))
            }
        }

        ports.release(&id.name, &id.namespace).await
    }

    /// Refuses to adopt a shadow service created for a different user
    /// service, e.g. after a truncated-name collision.
    fn check_ownership(&self, name: &str, existing: &k8s::Service, svc: &UserService) -> Result<()> {
        let labels = existing.metadata.labels.as_ref();
        let owned = labels
            .map(|labels| {
                labels.get(LABEL_SERVICE_NAME) == Some(&svc.id.name)
                    && labels.get(LABEL_SERVICE_NAMESPACE) == Some(&svc.id.namespace)
            })
            .unwrap_or(false);
        if !owned {
            bail!("shadow service {name} belongs to a different user service; refusing to update");
        }
        Ok(())
    }

    async fn update(
        &self,
        api: &Api<k8s::Service>,
        name: &str,
        existing: k8s::Service,
        shadow_ports: Vec<k8s::ServicePort>,
        svc: &UserService,
    ) -> Result<()> {
        let mut current = existing;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut desired = current.clone();
            if let Some(spec) = desired.spec.as_mut() {
                spec.ports = Some(shadow_ports.clone());
            }
            match api.replace(name, &PostParams::default(), &desired).await {
                Ok(_) => {
                    tracing::debug!(shadow = %name, service = %svc.id, "Updated shadow service");
                    return Ok(());
                }
                Err(error) if k8s::is_conflict(&error) => {
                    tracing::debug!(shadow = %name, %error, "Conflict updating shadow service; refreshing");
                    current = api
                        .get(name)
                        .await
                        .with_context(|| format!("refreshing shadow service {name}"))?;
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("updating shadow service {name}"))
                }
            }
        }
        bail!("updating shadow service {name} failed after {MAX_UPDATE_ATTEMPTS} conflicts")
    }

    /// Points the user service's external IPs at the shadow cluster IP so
    /// that the mesh domain resolves into the mesh.
    async fn set_external_ip(&self, svc: &UserService, cluster_ip: String) -> Result<()> {
        let api = Api::<k8s::Service>::namespaced(self.client.clone(), &svc.id.namespace);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut user = match api.get_opt(&svc.id.name).await? {
                Some(user) => user,
                // The user service vanished; the delete event will clean up.
                None => return Ok(()),
            };
            if let Some(spec) = user.spec.as_mut() {
                spec.external_ips = Some(vec![cluster_ip.clone()]);
            }
            match api.replace(&svc.id.name, &PostParams::default(), &user).await {
                Ok(_) => {
                    tracing::debug!(service = %svc.id, %cluster_ip, "Set user service external IP");
                    return Ok(());
                }
                Err(error) if k8s::is_conflict(&error) => {
                    tracing::debug!(service = %svc.id, %error, "Conflict setting external IP; retrying");
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("setting external IP on {}", svc.id))
                }
            }
        }
        bail!(
            "setting external IP on {} failed after {MAX_UPDATE_ATTEMPTS} conflicts",
            svc.id
        )
    }

    fn shadow_service(
        &self,
        name: &str,
        svc: &UserService,
        ports: Vec<k8s::ServicePort>,
    ) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.settings.mesh_namespace.clone()),
                labels: Some(
                    [
                        (LABEL_APP.to_string(), "mesh".to_string()),
                        (LABEL_COMPONENT.to_string(), "mesh-service".to_string()),
                        (LABEL_SERVICE_NAME.to_string(), svc.id.name.clone()),
                        (
                            LABEL_SERVICE_NAMESPACE.to_string(),
                            svc.id.namespace.clone(),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                selector: Some(
                    [("component".to_string(), "mesh-node".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ports: Some(ports),
                ..Default::default()
            }),
            status: None,
        }
    }
}
