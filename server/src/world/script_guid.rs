use crate::protocol::SCRIPT_HANDLE_BASE;

/// Default pool capacity.
pub const SCRIPT_GUID_CAPACITY: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidKind {
    Entity,
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptGuid {
    pub kind: GuidKind,
    pub entity_handle: u32,
}

/// Fixed-capacity pool of script GUIDs. Script handles are the pool index
/// shifted above the handle base so they never collide with net handles.
pub struct ScriptGuidPool {
    slots: Vec<Option<ScriptGuid>>,
    free: Vec<u32>,
}

impl Default for ScriptGuidPool {
    fn default() -> Self {
        Self::with_capacity(SCRIPT_GUID_CAPACITY)
    }
}

impl ScriptGuidPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Reuse the handle already referencing this entity, else allocate.
    /// `None` when the pool is exhausted.
    pub fn get_or_allocate(&mut self, entity_handle: u32) -> Option<u32> {
        if let Some(existing) = self.find_entity(entity_handle) {
            return Some(existing);
        }

        let index = self.free.pop()?;
        self.slots[index as usize] = Some(ScriptGuid {
            kind: GuidKind::Entity,
            entity_handle,
        });

        Some(index + SCRIPT_HANDLE_BASE)
    }

    pub fn find_entity(&self, entity_handle: u32) -> Option<u32> {
        self.slots.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref().and_then(|guid| {
                (guid.kind == GuidKind::Entity && guid.entity_handle == entity_handle)
                    .then_some(i as u32 + SCRIPT_HANDLE_BASE)
            })
        })
    }

    /// Entity handle behind a script handle, if the slot is live.
    pub fn entity_handle(&self, script_handle: u32) -> Option<u32> {
        let index = script_handle.checked_sub(SCRIPT_HANDLE_BASE)? as usize;

        self.slots.get(index)?.as_ref().and_then(|guid| match guid.kind {
            GuidKind::Entity => Some(guid.entity_handle),
        })
    }

    pub fn release(&mut self, script_handle: u32) {
        let Some(index) = script_handle.checked_sub(SCRIPT_HANDLE_BASE) else {
            return;
        };

        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.take().is_some() {
                self.free.push(index);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
