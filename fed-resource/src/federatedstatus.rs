use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::{ApiResource, DynamicObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rolled-up status of a federated resource, stored as the top-level fields of
/// the status object that shares the federated resource's name.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
    #[serde(default)]
    pub clusters: Vec<ClusterStatus>,
}

/// Status observed on one member cluster. `status` is absent when the target
/// object is missing there or carries no readable status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ClusterStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Map<String, Value>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    pub r#type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<Time>,
}

impl ClusterStatus {
    pub fn new(name: impl Into<String>, status: Option<Map<String, Value>>) -> ClusterStatus {
        ClusterStatus {
            name: name.into(),
            status,
        }
    }
}

impl AggregatedStatus {
    /// Cluster entries are kept sorted by cluster name.
    pub fn new(observed_generation: i64, mut clusters: Vec<ClusterStatus>) -> AggregatedStatus {
        sort_cluster_statuses(&mut clusters);
        AggregatedStatus {
            observed_generation,
            conditions: vec![],
            clusters,
        }
    }

    /// Builds a fresh status object named and placed like its federated
    /// owner.
    pub fn to_object(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: &str,
        owner: OwnerReference,
    ) -> Result<DynamicObject> {
        let metadata = ObjectMeta {
            name: Some(name.to_owned()),
            namespace,
            owner_references: Some(vec![owner]),
            ..Default::default()
        };
        let mut object = DynamicObject::new(name, ar).data(Value::Null);
        object.metadata = metadata;
        self.write_into(&mut object)?;
        Ok(object)
    }

    /// Replaces only the `clusters` field of an existing status object,
    /// leaving everything else as it was persisted.
    pub fn write_clusters_into(&self, object: &mut DynamicObject) -> Result<()> {
        let clusters =
            serde_json::to_value(&self.clusters).context("Failed to serialize cluster statuses")?;
        match object.data.as_object_mut() {
            Some(data) => {
                data.insert("clusters".into(), clusters);
            }
            None => {
                let mut data = Map::new();
                data.insert("clusters".into(), clusters);
                object.data = Value::Object(data);
            }
        }
        Ok(())
    }

    fn write_into(&self, object: &mut DynamicObject) -> Result<()> {
        object.data =
            serde_json::to_value(self).context("Failed to serialize aggregated status")?;
        Ok(())
    }
}

fn sort_cluster_statuses(clusters: &mut [ClusterStatus]) {
    clusters.sort_by(|a, b| a.name.cmp(&b.name));
}
