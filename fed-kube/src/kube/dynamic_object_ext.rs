use anyhow::{Result, anyhow, bail};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{Map, Value};

use super::types::QualifiedName;

pub trait DynamicObjectExt {
    fn get_gvk(&self) -> Result<GroupVersionKind>;
    fn get_qualified_name(&self) -> QualifiedName;
    fn get_nested_map(&self, path: &[&str]) -> Result<Option<&Map<String, Value>>>;
    fn get_status_map(&self) -> Result<Option<Map<String, Value>>>;
    fn get_resource_version(&self) -> Option<String>;
    fn set_resource_version(&mut self, version: Option<String>);
    fn get_owner_reference(&self) -> Result<OwnerReference>;
    fn is_being_deleted(&self) -> bool;
}

impl DynamicObjectExt for DynamicObject {
    fn get_qualified_name(&self) -> QualifiedName {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        QualifiedName::new(ns, name)
    }

    fn get_gvk(&self) -> Result<GroupVersionKind> {
        let types = self
            .types
            .as_ref()
            .ok_or_else(|| anyhow!("Missing TypeMeta in DynamicObject"))?;
        let api_version = &types.api_version;
        let kind = &types.kind;

        // Split apiVersion into group and version
        let (group, version) = if let Some((g, v)) = api_version.split_once('/') {
            (g.to_string(), v.to_string())
        } else {
            ("".to_string(), api_version.clone())
        };

        Ok(GroupVersionKind {
            group,
            version,
            kind: kind.clone(),
        })
    }

    /// Walks `path` through the object's data.
    ///
    /// `Ok(None)` when any segment is missing, an error when a segment exists
    /// but is not an object.
    fn get_nested_map(&self, path: &[&str]) -> Result<Option<&Map<String, Value>>> {
        let mut current = &self.data;
        for (depth, field) in path.iter().enumerate() {
            let object = current.as_object().ok_or_else(|| {
                anyhow!(
                    "{} accessor error: {} is not a map",
                    path.join("."),
                    path[..depth].join(".")
                )
            })?;
            match object.get(*field) {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        match current {
            Value::Object(map) => Ok(Some(map)),
            Value::Null => Ok(None),
            other => bail!(
                "{} accessor error: expected map, found {}",
                path.join("."),
                json_type_name(other)
            ),
        }
    }

    fn get_status_map(&self) -> Result<Option<Map<String, Value>>> {
        self.get_nested_map(&["status"]).map(|status| status.cloned())
    }

    fn get_resource_version(&self) -> Option<String> {
        self.metadata
            .resource_version
            .as_ref()
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn set_resource_version(&mut self, version: Option<String>) {
        self.metadata.resource_version = version;
    }

    fn get_owner_reference(&self) -> Result<OwnerReference> {
        let gvk = self.get_gvk()?;
        Ok(OwnerReference {
            api_version: gvk.api_version(),
            kind: gvk.kind,
            name: self.name_any(),
            uid: self.uid().unwrap_or_default(),
            ..Default::default()
        })
    }

    fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid dynamic object")
    }

    fn deployment(status: Value) -> DynamicObject {
        object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod", "uid": "42", "resourceVersion": "7" },
            "status": status,
        }))
    }

    #[test]
    fn status_map_is_found() {
        let obj = deployment(json!({ "replicas": 3, "phase": "Running" }));
        let status = obj.get_status_map().unwrap().unwrap();
        assert_eq!(status.get("phase"), Some(&json!("Running")));
    }

    #[test]
    fn missing_path_is_not_found() {
        let obj = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "prod" },
        }));
        assert_eq!(obj.get_status_map().unwrap(), None);
        assert_eq!(obj.get_nested_map(&["spec", "template"]).unwrap(), None);
    }

    #[test]
    fn non_map_status_is_an_error() {
        let obj = deployment(json!("Running"));
        assert!(obj.get_status_map().is_err());
    }

    #[test]
    fn nested_lookup_through_scalar_is_an_error() {
        let obj = deployment(json!({ "phase": "Running" }));
        assert!(obj.get_nested_map(&["status", "phase", "detail"]).is_err());
    }

    #[test]
    fn qualified_name_and_owner_reference() {
        let obj = deployment(json!({}));
        assert_eq!(obj.get_qualified_name(), QualifiedName::new("prod", "web"));

        let owner = obj.get_owner_reference().unwrap();
        assert_eq!(owner.api_version, "apps/v1");
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web");
        assert_eq!(owner.uid, "42");
    }

    #[test]
    fn resource_version_round_trip() {
        let mut obj = deployment(json!({}));
        assert_eq!(obj.get_resource_version(), Some("7".to_string()));
        obj.set_resource_version(Some(String::new()));
        assert_eq!(obj.get_resource_version(), None);
        obj.set_resource_version(Some("8".into()));
        assert_eq!(obj.get_resource_version(), Some("8".to_string()));
    }
}
