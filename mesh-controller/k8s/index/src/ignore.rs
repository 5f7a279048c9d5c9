//! Decides which service and namespace events the controller acts on.

use std::collections::BTreeSet;

/// Namespaces (and the one special service) the mesh never touches.
///
/// Built once at startup from the mesh namespace and the operator-supplied
/// ignore list; `kube-system` is always excluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoreFilter {
    mesh_namespace: String,
    namespaces: BTreeSet<String>,
}

// === impl IgnoreFilter ===

impl IgnoreFilter {
    pub fn new(mesh_namespace: impl Into<String>, ignored: impl IntoIterator<Item = String>) -> Self {
        let mesh_namespace = mesh_namespace.into();
        let mut namespaces: BTreeSet<String> = ignored.into_iter().collect();
        namespaces.insert("kube-system".to_string());
        namespaces.insert(mesh_namespace.clone());
        Self {
            mesh_namespace,
            namespaces,
        }
    }

    pub fn is_ignored(&self, name: &str, namespace: &str) -> bool {
        if name == "kubernetes" && namespace == "default" {
            return true;
        }
        self.namespaces.contains(namespace)
    }

    /// A copy of the filter that does not exclude the mesh namespace, for
    /// handling events originating from the mesh namespace itself.
    pub fn without_mesh(&self) -> Self {
        let mut filter = self.clone();
        filter.namespaces.remove(&self.mesh_namespace);
        filter
    }
}
