use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use glam::Vec3;
use parking_lot::{Mutex, RwLock};

use crate::client::Client;
use crate::protocol::MAX_SLOTS;
use crate::world::bits::SlotBits;
use crate::world::sync_tree::{make_sync_tree, SyncTree};

/// Networked entity kinds; 4 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Automobile = 0,
    Bike = 1,
    Boat = 2,
    Door = 3,
    Heli = 4,
    Object = 5,
    Ped = 6,
    Pickup = 7,
    PickupPlacement = 8,
    Plane = 9,
    Submarine = 10,
    Player = 11,
    Trailer = 12,
    Train = 13,
}

impl EntityType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Automobile),
            1 => Some(Self::Bike),
            2 => Some(Self::Boat),
            3 => Some(Self::Door),
            4 => Some(Self::Heli),
            5 => Some(Self::Object),
            6 => Some(Self::Ped),
            7 => Some(Self::Pickup),
            8 => Some(Self::PickupPlacement),
            9 => Some(Self::Plane),
            10 => Some(Self::Submarine),
            11 => Some(Self::Player),
            12 => Some(Self::Trailer),
            13 => Some(Self::Train),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn is_vehicle(self) -> bool {
        matches!(
            self,
            Self::Automobile
                | Self::Bike
                | Self::Boat
                | Self::Heli
                | Self::Plane
                | Self::Submarine
                | Self::Trailer
                | Self::Train
        )
    }
}

/// Handles pack the first owner and the 13-bit object id.
pub fn make_entity_handle(player_id: u8, object_id: u16) -> u32 {
    ((player_id as u32 + 1) << 16) | object_id as u32
}

/// A replicated entity.
///
/// Shared across the net thread, the worker pool and the drop handler via
/// `Arc`; the sparse id lookup holds `Weak` so reaping the dense list
/// collapses the lookup without a scan.
pub struct SyncEntity {
    pub handle: u32,
    pub entity_type: EntityType,

    /// Owning client. Guarded by its own lock so ownership swaps don't
    /// contend with the entity list.
    pub client: RwLock<Weak<dyn Client>>,

    pub sync_tree: Mutex<Box<dyn SyncTree>>,

    pub acked_creation: SlotBits,
    pub did_deletion: SlotBits,

    /// Millisecond stamps of the last sync/resend per slot; 0 = never.
    pub last_syncs: [AtomicU64; MAX_SLOTS],
    pub last_resends: [AtomicU64; MAX_SLOTS],

    /// Timestamp echoed from the owner's most recent tag-5 record.
    pub timestamp: AtomicU32,

    pub frame_index: AtomicU64,
    pub deleting: AtomicBool,

    /// Script-GUID pool index, if a script handle was ever produced.
    pub guid: Mutex<Option<u32>>,
}

impl SyncEntity {
    pub fn new(
        entity_type: EntityType,
        handle: u32,
        client: Weak<dyn Client>,
        frame_index: u64,
    ) -> Self {
        Self {
            handle,
            entity_type,
            client: RwLock::new(client),
            sync_tree: Mutex::new(make_sync_tree(entity_type)),
            acked_creation: SlotBits::new(),
            did_deletion: SlotBits::new(),
            last_syncs: std::array::from_fn(|_| AtomicU64::new(0)),
            last_resends: std::array::from_fn(|_| AtomicU64::new(0)),
            timestamp: AtomicU32::new(0),
            frame_index: AtomicU64::new(frame_index),
            deleting: AtomicBool::new(false),
            guid: Mutex::new(None),
        }
    }

    pub fn object_id(&self) -> u16 {
        (self.handle & 0xFFFF) as u16
    }

    pub fn owner(&self) -> Option<Arc<dyn Client>> {
        self.client.read().upgrade()
    }

    pub fn position(&self) -> Vec3 {
        self.sync_tree.lock().position()
    }

    /// Zero every slot's pacing stamps so the entity syncs again
    /// immediately.
    pub fn reset_pacing(&self) {
        for slot in 0..MAX_SLOTS {
            self.last_syncs[slot].store(0, Ordering::Relaxed);
            self.last_resends[slot].store(0, Ordering::Relaxed);
        }
    }
}
