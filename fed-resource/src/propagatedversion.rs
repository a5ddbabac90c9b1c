use std::collections::BTreeMap;

pub use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Records which version of a target object was last written to which member
/// cluster, for federated types that are namespaced.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "PropagatedVersion",
    group = "core.kubefed.io",
    version = "v1alpha1",
    status = "PropagatedVersionStatus",
    plural = "propagatedversions",
    namespaced
)]
pub struct PropagatedVersionSpec {}

/// Cluster-scoped counterpart of [`PropagatedVersion`].
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "ClusterPropagatedVersion",
    group = "core.kubefed.io",
    version = "v1alpha1",
    status = "PropagatedVersionStatus",
    plural = "clusterpropagatedversions"
)]
pub struct ClusterPropagatedVersionSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PropagatedVersionStatus {
    /// Hash or resourceVersion of the template the versions were produced from.
    #[serde(default)]
    pub template_version: String,
    /// Hash of the overrides the versions were produced with.
    #[serde(default)]
    pub override_version: String,
    #[serde(default)]
    pub cluster_versions: Vec<ClusterObjectVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectVersion {
    pub cluster_name: String,
    pub version: String,
}

impl PropagatedVersionStatus {
    pub fn new(
        template_version: String,
        override_version: String,
        cluster_versions: Vec<ClusterObjectVersion>,
    ) -> PropagatedVersionStatus {
        let mut status = PropagatedVersionStatus {
            template_version,
            override_version,
            cluster_versions,
        };
        sort_cluster_versions(&mut status.cluster_versions);
        status
    }

    /// Whether the recorded cluster versions were produced from the given
    /// template and override versions.
    pub fn matches(&self, template_version: &str, override_version: &str) -> bool {
        self.template_version == template_version && self.override_version == override_version
    }

    /// Value equality, independent of the order cluster versions were recorded in.
    pub fn equivalent(&self, other: &PropagatedVersionStatus) -> bool {
        if !self.matches(&other.template_version, &other.override_version) {
            return false;
        }
        let mut left = self.cluster_versions.clone();
        let mut right = other.cluster_versions.clone();
        sort_cluster_versions(&mut left);
        sort_cluster_versions(&mut right);
        left == right
    }

    pub fn version_map(&self) -> BTreeMap<String, String> {
        self.cluster_versions
            .iter()
            .map(|v| (v.cluster_name.to_owned(), v.version.to_owned()))
            .collect()
    }
}

pub fn sort_cluster_versions(versions: &mut [ClusterObjectVersion]) {
    versions.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
}

/// Converts a cluster → version map into the persisted list form.
///
/// An empty version means the cluster's version is unknown and is left out.
pub fn version_map_to_cluster_versions(
    version_map: &BTreeMap<String, String>,
) -> Vec<ClusterObjectVersion> {
    let mut versions: Vec<ClusterObjectVersion> = version_map
        .iter()
        .filter(|(_, version)| !version.is_empty())
        .map(|(cluster_name, version)| ClusterObjectVersion {
            cluster_name: cluster_name.to_owned(),
            version: version.to_owned(),
        })
        .collect();
    sort_cluster_versions(&mut versions);
    versions
}

pub fn propagated_version_prefix(target_kind: &str) -> String {
    format!("{}-", target_kind.to_lowercase())
}

pub fn propagated_version_name(target_kind: &str, resource_name: &str) -> String {
    format!("{}{}", propagated_version_prefix(target_kind), resource_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(cluster: &str, version: &str) -> ClusterObjectVersion {
        ClusterObjectVersion {
            cluster_name: cluster.into(),
            version: version.into(),
        }
    }

    #[test]
    fn names_carry_lowercase_kind_prefix() {
        assert_eq!(propagated_version_prefix("Deployment"), "deployment-");
        assert_eq!(propagated_version_name("ConfigMap", "settings"), "configmap-settings");
    }

    #[test]
    fn equivalence_ignores_cluster_order() {
        let left = PropagatedVersionStatus {
            template_version: "t1".into(),
            override_version: "o1".into(),
            cluster_versions: vec![version("c2", "5"), version("c1", "3")],
        };
        let right = PropagatedVersionStatus::new(
            "t1".into(),
            "o1".into(),
            vec![version("c1", "3"), version("c2", "5")],
        );
        assert!(left.equivalent(&right));
    }

    #[test]
    fn equivalence_detects_version_changes() {
        let base = PropagatedVersionStatus::new("t1".into(), "o1".into(), vec![version("c1", "3")]);

        let mut changed = base.clone();
        changed.cluster_versions[0].version = "4".into();
        assert!(!base.equivalent(&changed));

        let mut changed = base.clone();
        changed.template_version = "t2".into();
        assert!(!base.equivalent(&changed));
    }

    #[test]
    fn empty_versions_are_dropped_and_list_is_sorted() {
        let map = BTreeMap::from([
            ("c3".to_string(), "9".to_string()),
            ("c1".to_string(), "".to_string()),
            ("c2".to_string(), "4".to_string()),
        ]);
        assert_eq!(
            version_map_to_cluster_versions(&map),
            vec![version("c2", "4"), version("c3", "9")]
        );
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let status = PropagatedVersionStatus::new("t".into(), "o".into(), vec![version("c1", "1")]);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["templateVersion"], "t");
        assert_eq!(value["clusterVersions"][0]["clusterName"], "c1");
    }
}
