//! Wire-level constants shared by the codec, the scheduler and the ingress
//! parser.

/// Object IDs are 13 bits on the wire; 0 is never issued.
pub const MAX_OBJECT_ID: usize = 1 << 13;

/// Per-slot bitsets are sized once at engine start.
pub const MAX_SLOTS: usize = 64;

/// Flush eagerly once the compression upper bound for the pending payload
/// would exceed this, keeping packets MTU-safe.
pub const FLUSH_THRESHOLD: usize = 1100;

/// Scratch used to decompress inbound frames; oversized frames are dropped.
pub const INGRESS_SCRATCH_SIZE: usize = 16384;

/// Scratch used to unparse a single entity's sync tree.
pub const UNPARSE_SCRATCH_SIZE: usize = 1200;

/// Serialized sync-tree payloads beyond this many bytes are dropped.
pub const MAX_CLONE_PAYLOAD: usize = 4096;

/// Frame buckets of sent object ids are kept for this many ticks.
pub const GAME_STATE_ACK_WINDOW: u64 = 100;

/// IDs handed out per `msgRequestObjectIds`.
pub const OBJECT_ID_GRANT: usize = 32;

/// Script handles start above the script-GUID pool index range.
pub const SCRIPT_HANDLE_BASE: u32 = 0x20000;

const fn fnv1a(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0x811c9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x01000193);
        i += 1;
    }
    hash
}

// Outbound message types.
pub const MSG_PACKED_CLONES: u32 = fnv1a("msgPackedClones");
pub const MSG_PACKED_ACKS: u32 = fnv1a("msgPackedAcks");
pub const MSG_WORLD_GRID: u32 = fnv1a("msgWorldGrid");
pub const MSG_OBJECT_IDS: u32 = fnv1a("msgObjectIds");
pub const MSG_TIME_SYNC: u32 = fnv1a("msgTimeSync");
pub const MSG_NET_GAME_EVENT: u32 = fnv1a("msgNetGameEvent");

// Inbound frame types.
pub const NET_CLONES: u32 = fnv1a("netClones");
pub const NET_ACKS: u32 = fnv1a("netAcks");

/// 3-bit record tags inside clone and ack frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTag {
    Create = 1,
    Sync = 2,
    Remove = 3,
    Takeover = 4,
    Timestamp = 5,
    End = 7,
}

impl RecordTag {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Create),
            2 => Some(Self::Sync),
            3 => Some(Self::Remove),
            4 => Some(Self::Takeover),
            5 => Some(Self::Timestamp),
            7 => Some(Self::End),
            _ => None,
        }
    }
}
