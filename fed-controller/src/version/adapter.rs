use anyhow::{Context, Result};
use fedkube::kube::types::QualifiedName;
use fedresource::propagatedversion::{
    ClusterPropagatedVersion, ClusterPropagatedVersionSpec, PropagatedVersion,
    PropagatedVersionSpec, PropagatedVersionStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{ApiResource, DynamicObject};
use serde::Serialize;
use serde_json::Value;

/// Converts between propagated version records and the generic objects
/// stored through `ObjectStore`. Namespaced federated types are tracked with
/// `PropagatedVersion`, cluster-scoped ones with `ClusterPropagatedVersion`.
#[derive(Clone, Copy, Debug)]
pub struct VersionAdapter {
    namespaced: bool,
}

impl VersionAdapter {
    pub fn new(namespaced: bool) -> VersionAdapter {
        VersionAdapter { namespaced }
    }

    pub fn type_name(&self) -> &'static str {
        if self.namespaced {
            "PropagatedVersion"
        } else {
            "ClusterPropagatedVersion"
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        if self.namespaced {
            ApiResource::erase::<PropagatedVersion>(&())
        } else {
            ApiResource::erase::<ClusterPropagatedVersion>(&())
        }
    }

    pub fn new_version(
        &self,
        name: &QualifiedName,
        owner: OwnerReference,
        status: &PropagatedVersionStatus,
    ) -> Result<DynamicObject> {
        let metadata = ObjectMeta {
            name: Some(name.name.to_owned()),
            namespace: if self.namespaced {
                name.namespace().map(str::to_owned)
            } else {
                None
            },
            owner_references: Some(vec![owner]),
            ..Default::default()
        };
        if self.namespaced {
            let record = PropagatedVersion {
                metadata,
                spec: PropagatedVersionSpec {},
                status: Some(status.clone()),
            };
            to_object(&record)
        } else {
            let record = ClusterPropagatedVersion {
                metadata,
                spec: ClusterPropagatedVersionSpec {},
                status: Some(status.clone()),
            };
            to_object(&record)
        }
    }

    /// Status of a record, empty when the record carries none.
    pub fn get_status(&self, object: &DynamicObject) -> Result<PropagatedVersionStatus> {
        match object.data.get("status") {
            None | Some(Value::Null) => Ok(PropagatedVersionStatus::default()),
            Some(status) => serde_json::from_value(status.clone())
                .with_context(|| format!("Malformed {} status", self.type_name())),
        }
    }

    pub fn set_status(
        &self,
        object: &mut DynamicObject,
        status: &PropagatedVersionStatus,
    ) -> Result<()> {
        let status = serde_json::to_value(status)?;
        match object.data.as_object_mut() {
            Some(data) => {
                data.insert("status".into(), status);
            }
            None => object.data = serde_json::json!({ "status": status }),
        }
        Ok(())
    }
}

fn to_object<R: Serialize>(record: &R) -> Result<DynamicObject> {
    let value = serde_json::to_value(record).context("Failed to serialize version record")?;
    let object: DynamicObject = serde_json::from_value(value)?;
    Ok(object)
}
