use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use fedkube::kube::cache::CacheReader;
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::types::QualifiedName;
use kube::api::DynamicObject;

/// Informer cache whose content and sync state are set directly by tests.
#[derive(Default)]
pub struct FakeCache {
    objects: DashMap<QualifiedName, Arc<DynamicObject>>,
    synced: AtomicBool,
}

impl FakeCache {
    pub fn synced() -> FakeCache {
        let cache = FakeCache::default();
        cache.set_synced(true);
        cache
    }

    pub fn put(&self, object: DynamicObject) {
        self.objects
            .insert(object.get_qualified_name(), Arc::new(object));
    }

    pub fn remove(&self, name: &QualifiedName) {
        self.objects.remove(name);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }
}

impl CacheReader for FakeCache {
    fn get(&self, name: &QualifiedName) -> Option<Arc<DynamicObject>> {
        self.objects.get(name).map(|entry| entry.value().clone())
    }

    fn keys(&self) -> Vec<QualifiedName> {
        let mut keys: Vec<QualifiedName> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
