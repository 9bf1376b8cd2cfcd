//! Resource kinds and scope normalization
//!
//! The UI names kinds loosely (`pods`, `Pod`, `po`) and sends scopes as free
//! text (`default`, `namespace:default`, `*`, empty). Both are resolved here
//! into a canonical [`ResourceKind`] and [`Scope`]. Normalization is pure and
//! idempotent: feeding a canonical scope back in yields the same scope.
//!
//! Canonical scope strings:
//!
//! | scope | meaning |
//! |---|---|
//! | `namespace:<name>` | one namespace of a namespaced kind |
//! | `all-namespaces` | every namespace of a namespaced kind |
//! | `cluster` | a cluster-scoped kind |

use std::collections::HashMap;
use std::fmt;

use kube::discovery::ApiResource;
use serde::{Serialize, Serializer};

use crate::error::StreamError;

const NAMESPACE_PREFIX: &str = "namespace:";
const ALL_NAMESPACES: &str = "all-namespaces";
const CLUSTER: &str = "cluster";

/// A watchable Kubernetes resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// Canonical name: the lowercase plural (`pods`)
    pub name: String,
    /// API group; empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind (`Pod`)
    pub kind: String,
    /// Whether objects live in namespaces
    pub namespaced: bool,
    /// Accepted short names (`po`)
    pub short_names: Vec<String>,
}

impl ResourceKind {
    fn builtin(
        name: &str,
        group: &str,
        version: &str,
        kind: &str,
        namespaced: bool,
        short_names: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespaced,
            short_names: short_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `group/resource`, or just `resource` for the core group
    pub fn qualified_name(&self) -> String {
        if self.group.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.group, self.name)
        }
    }

    /// Dynamic API descriptor for kube-rs
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.name.clone(),
        }
    }
}

/// Breadth of a resource query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// A single namespace
    Namespace(String),
    /// Every namespace
    AllNamespaces,
    /// A cluster-scoped kind
    Cluster,
}

impl Scope {
    /// Namespace to restrict the watch to, if any
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespace(ns) => Some(ns),
            Self::AllNamespaces | Self::Cluster => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(ns) => write!(f, "{NAMESPACE_PREFIX}{ns}"),
            Self::AllNamespaces => f.write_str(ALL_NAMESPACES),
            Self::Cluster => f.write_str(CLUSTER),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Normalize a free-form scope for `kind`
pub fn normalize_scope(kind: &ResourceKind, raw: &str) -> Result<Scope, StreamError> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| StreamError::InvalidScope {
        kind: kind.name.clone(),
        scope: raw.to_string(),
        reason: reason.to_string(),
    };

    let breadth = matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "" | "*" | "all" | ALL_NAMESPACES | CLUSTER
    );

    if !kind.namespaced {
        return if breadth {
            Ok(Scope::Cluster)
        } else {
            Err(invalid("kind is cluster-scoped"))
        };
    }

    if breadth {
        return Ok(Scope::AllNamespaces);
    }

    let name = trimmed
        .strip_prefix(NAMESPACE_PREFIX)
        .or_else(|| trimmed.strip_prefix("ns:"))
        .or_else(|| trimmed.strip_prefix("namespace/"))
        .unwrap_or(trimmed)
        .trim()
        .to_ascii_lowercase();

    if !is_dns_label(&name) {
        return Err(invalid("namespace must be a DNS-1123 label"));
    }
    Ok(Scope::Namespace(name))
}

/// RFC 1123 label: 1-63 chars of `[a-z0-9-]`, alphanumeric at both ends
fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// Known resource kinds, looked up by plural, kind, or short name
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    kinds: Vec<ResourceKind>,
    aliases: HashMap<String, usize>,
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ResourceCatalog {
    /// Catalog of the built-in workload, networking, config, and cluster kinds
    pub fn builtin() -> Self {
        let kinds = vec![
            ResourceKind::builtin("pods", "", "v1", "Pod", true, &["po"]),
            ResourceKind::builtin("services", "", "v1", "Service", true, &["svc"]),
            ResourceKind::builtin("endpoints", "", "v1", "Endpoints", true, &["ep"]),
            ResourceKind::builtin("configmaps", "", "v1", "ConfigMap", true, &["cm"]),
            ResourceKind::builtin("secrets", "", "v1", "Secret", true, &[]),
            ResourceKind::builtin("serviceaccounts", "", "v1", "ServiceAccount", true, &["sa"]),
            ResourceKind::builtin(
                "persistentvolumeclaims",
                "",
                "v1",
                "PersistentVolumeClaim",
                true,
                &["pvc"],
            ),
            ResourceKind::builtin("events", "", "v1", "Event", true, &["ev"]),
            ResourceKind::builtin("nodes", "", "v1", "Node", false, &["no"]),
            ResourceKind::builtin("namespaces", "", "v1", "Namespace", false, &["ns"]),
            ResourceKind::builtin("persistentvolumes", "", "v1", "PersistentVolume", false, &["pv"]),
            ResourceKind::builtin("deployments", "apps", "v1", "Deployment", true, &["deploy"]),
            ResourceKind::builtin("replicasets", "apps", "v1", "ReplicaSet", true, &["rs"]),
            ResourceKind::builtin("statefulsets", "apps", "v1", "StatefulSet", true, &["sts"]),
            ResourceKind::builtin("daemonsets", "apps", "v1", "DaemonSet", true, &["ds"]),
            ResourceKind::builtin("jobs", "batch", "v1", "Job", true, &[]),
            ResourceKind::builtin("cronjobs", "batch", "v1", "CronJob", true, &["cj"]),
            ResourceKind::builtin(
                "horizontalpodautoscalers",
                "autoscaling",
                "v2",
                "HorizontalPodAutoscaler",
                true,
                &["hpa"],
            ),
            ResourceKind::builtin("ingresses", "networking.k8s.io", "v1", "Ingress", true, &["ing"]),
            ResourceKind::builtin(
                "networkpolicies",
                "networking.k8s.io",
                "v1",
                "NetworkPolicy",
                true,
                &["netpol"],
            ),
            ResourceKind::builtin("storageclasses", "storage.k8s.io", "v1", "StorageClass", false, &["sc"]),
            ResourceKind::builtin(
                "customresourcedefinitions",
                "apiextensions.k8s.io",
                "v1",
                "CustomResourceDefinition",
                false,
                &["crd", "crds"],
            ),
        ];

        let mut catalog = Self {
            kinds: Vec::with_capacity(kinds.len()),
            aliases: HashMap::new(),
        };
        for kind in kinds {
            catalog.register(kind);
        }
        catalog
    }

    /// Add (or replace) a kind, e.g. a custom resource
    ///
    /// Replacing a kind drops every alias of the kind it replaces.
    pub fn register(&mut self, kind: ResourceKind) {
        let index = match self.aliases.get(&kind.name.to_ascii_lowercase()).copied() {
            Some(index) => {
                self.aliases.retain(|_, existing| *existing != index);
                self.kinds[index] = kind.clone();
                index
            }
            None => {
                self.kinds.push(kind.clone());
                self.kinds.len() - 1
            }
        };

        self.aliases.insert(kind.name.to_ascii_lowercase(), index);
        self.aliases.insert(kind.kind.to_ascii_lowercase(), index);
        for short in &kind.short_names {
            self.aliases.insert(short.to_ascii_lowercase(), index);
        }
    }

    /// Resolve a kind by any accepted name, case-insensitively
    pub fn lookup(&self, name: &str) -> Option<&ResourceKind> {
        self.aliases
            .get(&name.trim().to_ascii_lowercase())
            .map(|&index| &self.kinds[index])
    }

    /// Resolve a kind and normalize a scope for it
    pub fn normalize(&self, kind: &str, raw_scope: &str) -> Result<(ResourceKind, Scope), StreamError> {
        let resolved = self
            .lookup(kind)
            .ok_or_else(|| StreamError::UnknownKind(kind.to_string()))?;
        let scope = normalize_scope(resolved, raw_scope)?;
        Ok((resolved.clone(), scope))
    }

    /// All registered kinds
    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceKind {
        ResourceCatalog::builtin().lookup("pods").unwrap().clone()
    }

    fn nodes() -> ResourceKind {
        ResourceCatalog::builtin().lookup("nodes").unwrap().clone()
    }

    #[test]
    fn test_lookup_accepts_aliases() {
        let catalog = ResourceCatalog::builtin();
        for name in ["pods", "Pod", "po", " PODS "] {
            assert_eq!(catalog.lookup(name).unwrap().name, "pods");
        }
        assert_eq!(catalog.lookup("deploy").unwrap().group, "apps");
        assert!(catalog.lookup("widgets").is_none());
    }

    #[test]
    fn test_namespaced_scope_forms() {
        let kind = pods();
        let expected = Scope::Namespace("default".into());
        for raw in ["default", "namespace:default", "ns:default", "namespace/default", " Default "] {
            assert_eq!(normalize_scope(&kind, raw).unwrap(), expected, "raw = {raw:?}");
        }
        for raw in ["", "*", "all", "all-namespaces", "cluster"] {
            assert_eq!(normalize_scope(&kind, raw).unwrap(), Scope::AllNamespaces);
        }
    }

    #[test]
    fn test_cluster_scoped_kind() {
        let kind = nodes();
        assert_eq!(normalize_scope(&kind, "").unwrap(), Scope::Cluster);
        assert_eq!(normalize_scope(&kind, "all-namespaces").unwrap(), Scope::Cluster);

        let err = normalize_scope(&kind, "default").unwrap_err();
        assert!(matches!(err, StreamError::InvalidScope { .. }));
    }

    #[test]
    fn test_rejects_invalid_namespace() {
        let kind = pods();
        let long = "a".repeat(64);
        for raw in ["-bad", "bad-", "under_score", "namespace:", long.as_str()] {
            assert!(normalize_scope(&kind, raw).is_err(), "raw = {raw:?}");
        }
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let catalog = ResourceCatalog::builtin();
        let inputs = [
            ("pods", "default"),
            ("pods", "NS:kube-system"),
            ("pods", "*"),
            ("deploy", ""),
            ("nodes", "all"),
            ("pv", "cluster"),
        ];
        for (kind, raw) in inputs {
            let (resolved, once) = catalog.normalize(kind, raw).unwrap();
            let (_, twice) = catalog.normalize(&resolved.name, &once.to_string()).unwrap();
            assert_eq!(once, twice, "kind = {kind}, raw = {raw:?}");
            assert_eq!(once.to_string(), twice.to_string());
        }
    }

    #[test]
    fn test_unknown_kind_is_error() {
        let err = ResourceCatalog::builtin().normalize("widgets", "default").unwrap_err();
        assert_eq!(err, StreamError::UnknownKind("widgets".into()));
    }

    #[test]
    fn test_register_custom_kind() {
        let mut catalog = ResourceCatalog::builtin();
        catalog.register(ResourceKind {
            name: "clusters".into(),
            group: "cluster.x-k8s.io".into(),
            version: "v1beta1".into(),
            kind: "Cluster".into(),
            namespaced: true,
            short_names: vec!["cl".into()],
        });
        let kind = catalog.lookup("cl").unwrap();
        assert_eq!(kind.qualified_name(), "cluster.x-k8s.io/clusters");
        assert_eq!(kind.api_resource().api_version, "cluster.x-k8s.io/v1beta1");
    }

    #[test]
    fn test_replacing_kind_drops_its_old_aliases() {
        let mut catalog = ResourceCatalog::builtin();
        let widgets = |kind: &str, short: &str| ResourceKind {
            name: "widgets".into(),
            group: "example.io".into(),
            version: "v1".into(),
            kind: kind.into(),
            namespaced: true,
            short_names: vec![short.into()],
        };
        catalog.register(widgets("Widget", "wd"));
        catalog.register(widgets("Gadget", "gd"));

        assert!(catalog.lookup("wd").is_none());
        assert!(catalog.lookup("widget").is_none());
        assert_eq!(catalog.lookup("gd").unwrap().kind, "Gadget");
        assert_eq!(catalog.lookup("widgets").unwrap().kind, "Gadget");
        assert_eq!(catalog.lookup("gadget").unwrap().name, "widgets");
        assert_eq!(catalog.lookup("pods").unwrap().kind, "Pod");
    }

    #[test]
    fn test_scope_serializes_canonically() {
        let json = serde_json::to_string(&Scope::Namespace("prod".into())).unwrap();
        assert_eq!(json, "\"namespace:prod\"");
        assert_eq!(Scope::AllNamespaces.to_string(), "all-namespaces");
        assert_eq!(Scope::Cluster.namespace(), None);
    }
}
