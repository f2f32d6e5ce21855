//! Cluster id ↔ name cache
//!
//! Answers existence and name-resolution questions without a storage round
//! trip. Both directions live behind one lock so a reader never observes an
//! id whose name mapping is missing (or the reverse).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct Maps {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
}

/// Bidirectional id ↔ name mapping
///
/// The mapping is kept bijective: inserting a pair drops any previous entry
/// that shared either the id or the name.
#[derive(Default)]
pub struct IdentityCache {
    maps: RwLock<Maps>,
}

impl IdentityCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` is named `name`
    pub fn insert(&self, id: &str, name: &str) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(old_name) = maps.id_to_name.remove(id) {
            maps.name_to_id.remove(&old_name);
        }
        if let Some(old_id) = maps.name_to_id.remove(name) {
            maps.id_to_name.remove(&old_id);
        }

        maps.id_to_name.insert(id.to_string(), name.to_string());
        maps.name_to_id.insert(name.to_string(), id.to_string());
    }

    /// Drop the pair for `id`, returning the name it had
    pub fn remove(&self, id: &str) -> Option<String> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let name = maps.id_to_name.remove(id)?;
        maps.name_to_id.remove(&name);
        Some(name)
    }

    /// Name of the cluster with `id`
    pub fn name_for(&self, id: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.id_to_name.get(id).cloned()
    }

    /// Id of the cluster named `name`
    pub fn id_for(&self, name: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.name_to_id.get(name).cloned()
    }

    /// Whether a cluster with `id` is known
    pub fn contains_id(&self, id: &str) -> bool {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.id_to_name.contains_key(id)
    }

    /// Number of known clusters
    pub fn len(&self) -> usize {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.id_to_name.len()
    }

    /// Whether no clusters are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
