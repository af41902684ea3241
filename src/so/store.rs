// src/so/store.rs - Shared object persistence seam

use crate::so::shared_object::SharedObject;
use dashmap::DashMap;
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;

/// Saved state of a persistent shared object.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub name: String,
    pub path: String,
    pub version: u32,
    pub attributes: HashMap<String, Amf0Value>,
}

/// Where persistent shared objects are kept between sessions.
pub trait PersistenceStore: Send + Sync {
    fn load(&self, path: &str) -> Option<StoredObject>;

    fn save(&self, object: &SharedObject) -> bool;

    fn remove(&self, object: &SharedObject) -> bool;
}

/// Process memory store, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self, path: &str) -> Option<StoredObject> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    fn save(&self, object: &SharedObject) -> bool {
        let stored = StoredObject {
            name: object.name().to_string(),
            path: object.path().to_string(),
            version: object.version(),
            attributes: object.data(),
        };
        self.objects.insert(stored.path.clone(), stored);
        true
    }

    fn remove(&self, object: &SharedObject) -> bool {
        self.objects.remove(object.path()).is_some()
    }
}
