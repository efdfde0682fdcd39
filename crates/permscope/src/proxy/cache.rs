use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use permscope_jdwp::wire::{FieldInfo, MethodInfo, ReferenceTypeId};

/// Read-mostly map shared between the event loop and every worker.
///
/// Concurrent fills of the same key keep whichever value landed first.
#[derive(Debug)]
pub struct SharedCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SharedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> SharedCache<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert_if_absent(&self, key: K, value: V) -> V {
        self.entries.write().entry(key).or_insert(value).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-session knowledge about remote classes.
#[derive(Debug, Default)]
pub(crate) struct TypeCache {
    pub(crate) classes_by_name: SharedCache<String, ReferenceTypeId>,
    pub(crate) signatures: SharedCache<ReferenceTypeId, String>,
    /// `0` for `java.lang.Object` and interfaces.
    pub(crate) superclasses: SharedCache<ReferenceTypeId, ReferenceTypeId>,
    pub(crate) interfaces: SharedCache<ReferenceTypeId, Arc<[ReferenceTypeId]>>,
    pub(crate) fields: SharedCache<ReferenceTypeId, Arc<[FieldInfo]>>,
    pub(crate) methods: SharedCache<ReferenceTypeId, Arc<[MethodInfo]>>,
    pub(crate) source_files: SharedCache<ReferenceTypeId, Option<String>>,
    /// `(class, target binary name)` -> assignable.
    pub(crate) assignable: SharedCache<(ReferenceTypeId, String), bool>,
}
