//! Identity map: at most one managed instance per (entity, key).
//!
//! Keys are compared with SQL semantics, so a key read back as `BigInt(7)`
//! finds the instance registered under `Int(7)`. Subtypes of an inheritance
//! hierarchy share the root entity's key space.

use entkit_core::{
    EntityDescriptor, EntityObject, Error, IdentityConflictError, ObjectId, Result, Value,
    hash_values,
};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a persistent row: the entity name plus its key.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    pub entity: &'static str,
    pub key: Value,
    key_hash: u64,
}

impl IdentityKey {
    pub fn new(descriptor: &'static EntityDescriptor, key: Value) -> Self {
        let key_hash = hash_values(std::slice::from_ref(&key));
        Self {
            entity: descriptor.name,
            key,
            key_hash,
        }
    }

    /// The identity of `object`, once it has a key.
    pub fn of(object: &Arc<dyn EntityObject>) -> Option<Self> {
        object
            .entity_id()
            .filter(|key| !key.is_null())
            .map(|key| Self::new(object.descriptor(), key))
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.key_hash == other.key_hash
            && self.key.sort_cmp(&other.key).is_eq()
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key_hash.hash(state);
    }
}

/// The per-context table of managed instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, Arc<dyn EntityObject>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` under `key`.
    ///
    /// Registering the same instance twice is a no-op; a different instance
    /// under an occupied key is an [`Error::IdentityConflict`].
    pub fn register(&mut self, key: IdentityKey, object: &Arc<dyn EntityObject>) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if ObjectId::of(existing) == ObjectId::of(object) {
                return Ok(());
            }
            tracing::debug!(entity = key.entity, key = %key.key, "Identity conflict");
            return Err(Error::IdentityConflict(IdentityConflictError {
                entity: key.entity,
                key: key.key,
            }));
        }
        tracing::trace!(entity = key.entity, key = %key.key, "Registered identity");
        self.entries.insert(key, Arc::clone(object));
        Ok(())
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<Arc<dyn EntityObject>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Forget `key`, but only if it still maps to `object`.
    pub fn evict(&mut self, key: &IdentityKey, object: &Arc<dyn EntityObject>) -> bool {
        let owned = self
            .entries
            .get(key)
            .is_some_and(|existing| ObjectId::of(existing) == ObjectId::of(object));
        if owned {
            self.entries.remove(key);
        }
        owned
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_entities::Team;
    use entkit_core::{Entity, Managed};

    fn team(id: i64) -> Arc<dyn EntityObject> {
        Managed::new(Team::with_id(id, "t")).erase()
    }

    #[test]
    fn test_integer_widths_share_identity() {
        let a = IdentityKey::new(Team::descriptor(), Value::Int(7));
        let b = IdentityKey::new(Team::descriptor(), Value::BigInt(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_register_detects_conflict() {
        let mut map = IdentityMap::new();
        let first = team(1);
        let key = IdentityKey::of(&first).unwrap();
        map.register(key.clone(), &first).unwrap();
        map.register(key.clone(), &first).unwrap();
        assert_eq!(map.len(), 1);

        let second = team(1);
        assert!(matches!(
            map.register(key, &second),
            Err(Error::IdentityConflict(_))
        ));
    }

    #[test]
    fn test_evict_only_removes_owner() {
        let mut map = IdentityMap::new();
        let first = team(1);
        let key = IdentityKey::of(&first).unwrap();
        map.register(key.clone(), &first).unwrap();

        assert!(!map.evict(&key, &team(1)));
        assert!(map.contains(&key));
        assert!(map.evict(&key, &first));
        assert!(map.is_empty());
    }
}
