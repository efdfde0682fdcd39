use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::{Component, PermissionSet};

/// Session-local record of the permissions each component is considered to hold.
///
/// Grants recorded here are bookkeeping only; they do not change what the
/// target itself enforces. Entries only ever grow.
#[derive(Debug, Default)]
pub struct PermissionLedger {
    entries: RwLock<HashMap<Component, HashSet<String>>>,
}

impl PermissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, component: &Component, permission: &str) -> bool {
        if component.is_root() {
            return true;
        }
        self.entries
            .read()
            .get(component)
            .is_some_and(|held| held.contains(permission))
    }

    /// True when every string of `permissions` is held.
    pub fn holds_all(&self, component: &Component, permissions: &PermissionSet) -> bool {
        if component.is_root() {
            return true;
        }
        let entries = self.entries.read();
        let Some(held) = entries.get(component) else {
            return permissions.is_empty();
        };
        permissions.iter().all(|p| held.contains(p))
    }

    /// Records a grant. Returns `false` when the component already held it.
    pub fn grant(&self, component: &Component, permission: &str) -> bool {
        if self.holds(component, permission) {
            return false;
        }
        self.entries
            .write()
            .entry(component.clone())
            .or_default()
            .insert(permission.to_owned())
    }

    /// Records every string of `permissions`; returns how many were new.
    pub fn grant_all(&self, component: &Component, permissions: &PermissionSet) -> usize {
        if component.is_root() || self.holds_all(component, permissions) {
            return 0;
        }
        let mut entries = self.entries.write();
        let held = entries.entry(component.clone()).or_default();
        permissions
            .iter()
            .filter(|p| held.insert((*p).to_owned()))
            .count()
    }

    pub fn granted(&self, component: &Component) -> PermissionSet {
        self.entries
            .read()
            .get(component)
            .map(|held| held.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn component_count(&self) -> usize {
        self.entries.read().len()
    }
}
