//! Resource type tags.

use serde::{Deserialize, Serialize};

use super::ops::{self, TypeOps};

/// Kinds of resources a stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Managed Kubernetes control plane.
    Cluster,
    /// Managed worker node pool attached to a cluster.
    NodeGroup,
    /// IAM role with a trust policy.
    IamRole,
    /// Cluster add-on such as a CSI driver.
    Addon,
    /// One or more Kubernetes objects applied to a cluster.
    KubernetesManifest,
    /// Cluster access entry granting a principal access policies.
    AccessEntry,
    /// Mapping of an IAM role onto Kubernetes groups.
    RoleMapping,
    /// Stack output. Materialised locally, never sent to the provider.
    Output,
}

impl ResourceType {
    /// All known resource types.
    pub const ALL: [Self; 8] = [
        Self::Cluster,
        Self::NodeGroup,
        Self::IamRole,
        Self::Addon,
        Self::KubernetesManifest,
        Self::AccessEntry,
        Self::RoleMapping,
        Self::Output,
    ];

    /// Returns the spec/wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::NodeGroup => "node_group",
            Self::IamRole => "iam_role",
            Self::Addon => "addon",
            Self::KubernetesManifest => "kubernetes_manifest",
            Self::AccessEntry => "access_entry",
            Self::RoleMapping => "role_mapping",
            Self::Output => "output",
        }
    }

    /// Parses a type name as written in a spec file.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Looks up the operation table for this type.
    #[must_use]
    pub fn ops(self) -> &'static TypeOps {
        ops::lookup(self)
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_names() {
        for kind in ResourceType::ALL {
            assert_eq!(ResourceType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceType::parse("load_balancer"), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ResourceType::KubernetesManifest).expect("serialize");
        assert_eq!(json, "\"kubernetes_manifest\"");
    }
}
