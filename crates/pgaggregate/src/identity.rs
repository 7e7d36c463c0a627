//! Session-scoped identity map.
//!
//! Entities are bucketed by `(entity_type, parental_key)` so that siblings
//! under different parents never collide even when their primary keys do
//! (composite surrogate keys reused across aggregates). Tracking here is
//! pure bookkeeping — "has this row been seen, so a save is an UPDATE not an
//! INSERT" and "what children did it have last time" — not object aliasing;
//! entities themselves are owned by the caller and flow through the engine
//! by value.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};

use crate::mapping::KeyValue;

#[derive(Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    entity_type: TypeId,
    parental_key: KeyValue,
}

/// Identifies one tracked row: its type, the key of its enclosing aggregate
/// (empty for a root entity), and its own primary key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct EntityIdentity {
    pub entity_type: TypeId,
    pub parental_key: KeyValue,
    pub primary_key: KeyValue,
}

#[derive(Default)]
struct Bucket {
    primary_keys: HashSet<KeyValue>,
}

/// Tracks which entities are known to a session and their previously-attached
/// children, so saves and deletes can diff against prior state.
#[derive(Default)]
pub struct IdentityMap {
    buckets: HashMap<BucketKey, Bucket>,
    children: HashMap<EntityIdentity, HashSet<KeyValue>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_key(entity_type: TypeId, parental_key: &KeyValue) -> BucketKey {
        BucketKey {
            entity_type,
            parental_key: parental_key.clone(),
        }
    }

    pub fn contains(&self, entity_type: TypeId, parental_key: &KeyValue, primary_key: &KeyValue) -> bool {
        self.buckets
            .get(&Self::bucket_key(entity_type, parental_key))
            .is_some_and(|b| b.primary_keys.contains(primary_key))
    }

    pub fn track(&mut self, entity_type: TypeId, parental_key: KeyValue, primary_key: KeyValue) {
        self.buckets
            .entry(Self::bucket_key(entity_type, &parental_key))
            .or_default()
            .primary_keys
            .insert(primary_key);
    }

    pub fn untrack(&mut self, entity_type: TypeId, parental_key: &KeyValue, primary_key: &KeyValue) {
        if let Some(bucket) = self.buckets.get_mut(&Self::bucket_key(entity_type, parental_key)) {
            bucket.primary_keys.remove(primary_key);
        }
        self.children.remove(&EntityIdentity {
            entity_type,
            parental_key: parental_key.clone(),
            primary_key: primary_key.clone(),
        });
    }

    /// Children currently known to be attached to `parent`, as previously recorded.
    pub fn known_children(&self, parent: &EntityIdentity) -> HashSet<KeyValue> {
        self.children.get(parent).cloned().unwrap_or_default()
    }

    /// Replace the recorded set of attached children for `parent`.
    pub fn set_known_children(&mut self, parent: EntityIdentity, children: HashSet<KeyValue>) {
        self.children.insert(parent, children);
    }

    /// Snapshot the whole map by value, for transaction rollback.
    pub fn snapshot(&self) -> IdentityMapSnapshot {
        IdentityMapSnapshot {
            tracked: self
                .buckets
                .iter()
                .flat_map(|(bk, bucket)| {
                    bucket.primary_keys.iter().map(move |pk| EntityIdentity {
                        entity_type: bk.entity_type,
                        parental_key: bk.parental_key.clone(),
                        primary_key: pk.clone(),
                    })
                })
                .collect(),
            children: self.children.clone(),
        }
    }

    /// Restore tracking state to a prior snapshot, dropping any identity that
    /// was tracked after the snapshot was taken (an insert inside the rolled
    /// back transaction).
    pub fn restore(&mut self, snapshot: IdentityMapSnapshot) {
        let keep: HashSet<EntityIdentity> = snapshot.tracked.into_iter().collect();
        for (bk, bucket) in self.buckets.iter_mut() {
            bucket.primary_keys.retain(|pk| {
                keep.contains(&EntityIdentity {
                    entity_type: bk.entity_type,
                    parental_key: bk.parental_key.clone(),
                    primary_key: pk.clone(),
                })
            });
        }
        self.children = snapshot.children;
    }
}

pub struct IdentityMapSnapshot {
    tracked: Vec<EntityIdentity>,
    children: HashMap<EntityIdentity, HashSet<KeyValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Scalar;

    fn tid() -> TypeId {
        TypeId::of::<u8>()
    }

    #[test]
    fn track_then_contains() {
        let mut map = IdentityMap::new();
        let pk = vec![Scalar::I64(1)];
        map.track(tid(), vec![], pk.clone());
        assert!(map.contains(tid(), &vec![], &pk));
    }

    #[test]
    fn untrack_removes_entity_and_children_state() {
        let mut map = IdentityMap::new();
        let pk = vec![Scalar::I64(1)];
        map.track(tid(), vec![], pk.clone());
        let id = EntityIdentity {
            entity_type: tid(),
            parental_key: vec![],
            primary_key: pk.clone(),
        };
        map.set_known_children(id.clone(), HashSet::new());
        map.untrack(tid(), &vec![], &pk);
        assert!(!map.contains(tid(), &vec![], &pk));
        assert!(map.known_children(&id).is_empty());
    }

    #[test]
    fn snapshot_restore_drops_later_inserts() {
        let mut map = IdentityMap::new();
        let pk1 = vec![Scalar::I64(1)];
        map.track(tid(), vec![], pk1.clone());
        let snap = map.snapshot();
        let pk2 = vec![Scalar::I64(2)];
        map.track(tid(), vec![], pk2.clone());
        assert!(map.contains(tid(), &vec![], &pk2));
        map.restore(snap);
        assert!(map.contains(tid(), &vec![], &pk1));
        assert!(!map.contains(tid(), &vec![], &pk2));
    }
}
