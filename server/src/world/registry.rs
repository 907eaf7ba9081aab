use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::protocol::MAX_OBJECT_ID;
use crate::world::entity::SyncEntity;

/// Owns the canonical entity set.
///
/// Two views: a dense list of strong references for iteration and a sparse
/// array of weak references for O(1) lookup by object id, each behind its
/// own lock so readers of one never contend with mutators of the other.
pub struct EntityRegistry {
    list: RwLock<Vec<Arc<SyncEntity>>>,
    by_id: Mutex<Vec<Weak<SyncEntity>>>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            by_id: Mutex::new(vec![Weak::<SyncEntity>::new(); MAX_OBJECT_ID]),
        }
    }

    pub fn get_by_object_id(&self, object_id: u16) -> Option<Arc<SyncEntity>> {
        if object_id as usize >= MAX_OBJECT_ID {
            return None;
        }

        self.by_id.lock()[object_id as usize].upgrade()
    }

    pub fn insert(&self, entity: Arc<SyncEntity>) {
        let object_id = entity.object_id() as usize;

        self.list.write().push(entity.clone());
        self.by_id.lock()[object_id] = Arc::downgrade(&entity);
    }

    pub fn erase(&self, object_id: u16) {
        {
            let mut list = self.list.write();
            if let Some(pos) = list.iter().position(|e| e.object_id() == object_id) {
                list.remove(pos);
            }
        }

        self.by_id.lock()[object_id as usize] = Weak::new();
    }

    /// Iterate the dense list under the shared lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<SyncEntity>)) {
        for entity in self.list.read().iter() {
            f(entity);
        }
    }

    /// Strong snapshot of the dense list for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<SyncEntity>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }
}
