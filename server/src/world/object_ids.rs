use std::collections::BTreeSet;

use crate::protocol::MAX_OBJECT_ID;
use crate::world::bits::IdBits;

/// Global object-id allocator.
///
/// `used` tracks ids with a live entity, `sent` ids handed to a client but
/// not yet consumed, and `stolen` ids whose ownership was reassigned; on
/// deletion those return to the global pool rather than to the last owner.
/// The whole pool sits behind one mutex owned by the game state.
#[derive(Default)]
pub struct ObjectIdPool {
    used: IdBits,
    sent: IdBits,
    stolen: IdBits,
}

impl ObjectIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out up to `count` free ids, skipping 0, marking them sent and
    /// recording them in the client's permitted set.
    pub fn allocate(&mut self, count: usize, client_ids: &mut BTreeSet<u16>) -> Vec<u16> {
        let mut ids = Vec::with_capacity(count);
        let mut id = 1usize;

        for _ in 0..count {
            let mut had_id = false;

            while id < MAX_OBJECT_ID {
                if !self.sent.test(id as u16) && !self.used.test(id as u16) {
                    self.sent.set(id as u16);
                    client_ids.insert(id as u16);
                    ids.push(id as u16);
                    had_id = true;
                    break;
                }
                id += 1;
            }

            if !had_id {
                log::warn!("could not assign an object id for client");
                break;
            }
        }

        ids
    }

    /// An id consumed by a create is live; it leaves the sent set so
    /// `sent` and `used` never overlap.
    pub fn mark_used(&mut self, id: u16) {
        self.used.set(id);
        self.sent.reset(id);
    }

    pub fn release_used(&mut self, id: u16) {
        self.used.reset(id);
    }

    pub fn mark_stolen(&mut self, id: u16) {
        self.stolen.set(id);
    }

    /// If the id was stolen, clear its stolen and sent bits and report so;
    /// the caller then detaches it from the last owner.
    pub fn take_stolen(&mut self, id: u16) -> bool {
        if self.stolen.test(id) {
            self.stolen.reset(id);
            self.sent.reset(id);
            return true;
        }
        false
    }

    pub fn clear_sent(&mut self, id: u16) {
        self.sent.reset(id);
    }

    pub fn is_used(&self, id: u16) -> bool {
        self.used.test(id)
    }

    pub fn is_sent(&self, id: u16) -> bool {
        self.sent.test(id)
    }

    pub fn is_stolen(&self, id: u16) -> bool {
        self.stolen.test(id)
    }

    pub fn used_count(&self) -> usize {
        self.used.count()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.count()
    }
}

/// Run-length pair encoding of a monotonically increasing id list:
/// `gap` skips unissued ids, `run` counts consecutive follow-ons.
pub fn encode_id_runs(ids: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();
    let mut last: i32 = -1;
    let mut i = 0usize;

    while i < ids.len() {
        let gap = ids[i] as i32 - 2 - last;
        let mut run = 0u16;

        while i + 1 < ids.len() && ids[i + 1] == ids[i] + 1 {
            run += 1;
            i += 1;
        }

        last = ids[i] as i32;
        pairs.push((gap as u16, run));
        i += 1;
    }

    pairs
}

pub fn decode_id_runs(pairs: &[(u16, u16)]) -> Vec<u16> {
    let mut ids = Vec::new();
    let mut last: i32 = -1;

    for &(gap, run) in pairs {
        let start = last + gap as i32 + 2;
        for offset in 0..=run as i32 {
            ids.push((start + offset) as u16);
        }
        last = start + run as i32;
    }

    ids
}
