use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How to reach a Kubernetes API server.
///
/// Used both for the host cluster and for every member cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, Default)]
pub enum KubeConfiguration {
    #[serde(rename = "incluster")]
    #[default]
    InCluster,
    #[serde(rename = "external")]
    External(KubeConfigurationExternal),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, Default)]
pub struct KubeConfigurationExternal {
    pub kube_context: Option<String>,
    /// Kubeconfig file to read instead of the default `$KUBECONFIG` lookup.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl KubeConfiguration {
    pub fn for_context(context: &str) -> KubeConfiguration {
        KubeConfiguration::External(KubeConfigurationExternal {
            kube_context: Some(context.into()),
            kubeconfig: None,
        })
    }
}
