use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{Value, json};

pub fn federated_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "types.kubefed.io",
        "v1beta1",
        "FederatedDeployment",
    ))
}

pub fn status_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "types.kubefed.io",
        "v1beta1",
        "FederatedDeploymentStatus",
    ))
}

pub fn target_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"))
}

pub fn federated(namespace: &str, name: &str, generation: i64) -> DynamicObject {
    let mut object = DynamicObject::new(name, &federated_resource())
        .within(namespace)
        .data(json!({ "spec": { "template": { "spec": { "replicas": 1 } } } }));
    object.metadata.uid = Some(format!("{name}-uid"));
    object.metadata.generation = Some(generation);
    object
}

pub fn target(namespace: &str, name: &str, status: Option<Value>) -> DynamicObject {
    let data = match status {
        Some(status) => json!({ "spec": {}, "status": status }),
        None => json!({ "spec": {} }),
    };
    DynamicObject::new(name, &target_resource())
        .within(namespace)
        .data(data)
}
