use anyhow::{Context, Result, anyhow};
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::types::QualifiedName;
use kube::api::DynamicObject;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A federated resource whose propagation to member clusters is tracked by
/// the version manager.
pub trait VersionedResource: Send + Sync {
    fn federated_name(&self) -> QualifiedName;
    fn object(&self) -> &DynamicObject;
    fn template_version(&self) -> Result<String>;
    fn override_version(&self) -> Result<String>;
}

/// Federated object as read from the host cluster. The template and override
/// versions are digests of `spec.template` and `spec.overrides`.
#[derive(Clone, Debug)]
pub struct FederatedObject {
    object: DynamicObject,
}

impl FederatedObject {
    pub fn new(object: DynamicObject) -> FederatedObject {
        FederatedObject { object }
    }
}

impl VersionedResource for FederatedObject {
    fn federated_name(&self) -> QualifiedName {
        self.object.get_qualified_name()
    }

    fn object(&self) -> &DynamicObject {
        &self.object
    }

    fn template_version(&self) -> Result<String> {
        let template = self
            .object
            .data
            .pointer("/spec/template")
            .filter(|value| !value.is_null())
            .ok_or_else(|| anyhow!("{} has no spec.template", self.federated_name()))?;
        digest(template)
    }

    fn override_version(&self) -> Result<String> {
        match self.object.data.pointer("/spec/overrides") {
            None | Some(Value::Null) => Ok(String::new()),
            Some(overrides) => digest(overrides),
        }
    }
}

fn digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).context("Failed to serialize for hashing")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn federated(data: Value) -> FederatedObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "types.kubefed.io",
            "v1beta1",
            "FederatedDeployment",
        ));
        FederatedObject::new(DynamicObject::new("web", &ar).within("apps").data(data))
    }

    #[test]
    fn template_version_follows_template_content() {
        let a = federated(json!({"spec": {"template": {"replicas": 1}}}));
        let b = federated(json!({"spec": {"template": {"replicas": 1}, "placement": {}}}));
        let c = federated(json!({"spec": {"template": {"replicas": 2}}}));

        let version = a.template_version().unwrap();
        assert_eq!(version.len(), 64);
        assert_eq!(version, b.template_version().unwrap());
        assert_ne!(version, c.template_version().unwrap());
    }

    #[test]
    fn missing_template_is_an_error() {
        let object = federated(json!({"spec": {}}));
        assert!(object.template_version().is_err());
    }

    #[test]
    fn absent_overrides_have_empty_version() {
        let plain = federated(json!({"spec": {"template": {}}}));
        assert_eq!(plain.override_version().unwrap(), "");

        let overridden = federated(json!({
            "spec": {"template": {}, "overrides": [{"clusterName": "c1"}]}
        }));
        assert_eq!(overridden.override_version().unwrap().len(), 64);
        assert_eq!(overridden.federated_name(), QualifiedName::new("apps", "web"));
    }
}
