//! # Gamestate Server
//! Authoritative server-side entity replication: the canonical entity set,
//! per-client interest management, world-grid area ownership, and the
//! bit-packed, LZ4-framed clone protocol.
//!
//! The transport, client registry and scripting layers stay outside; they
//! plug in through the [`Client`], [`ClientRegistry`] and [`EventSink`]
//! traits.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod state;
pub mod task;
pub mod time;
pub mod world;

pub use client::{Client, ClientRegistry, PacketFlags, SYNC_CHANNEL};
pub use config::SyncVars;
pub use events::{EventSink, NullEvents};
pub use gamestate_serde::{BufferError, ByteBuffer, MessageBuffer};
pub use protocol::{
    RecordTag, MAX_OBJECT_ID, MAX_SLOTS, MSG_NET_GAME_EVENT, MSG_OBJECT_IDS, MSG_PACKED_ACKS,
    MSG_PACKED_CLONES, MSG_TIME_SYNC, MSG_WORLD_GRID, NET_ACKS, NET_CLONES, SCRIPT_HANDLE_BASE,
};
pub use state::{ClientSyncData, GameStateClientData, ServerGameState};
pub use task::WorkerPool;
pub use world::entity::{make_entity_handle, EntityType, SyncEntity};
pub use world::grid::{WorldGrid, WorldGridEntry, GRID_ENTRIES_PER_SLOT};
pub use world::object_ids::{decode_id_runs, encode_id_runs};
pub use world::registry::EntityRegistry;
pub use world::sync_tree::{
    CameraState, NodeState, PedState, SyncParseState, SyncTree, SyncTreeError, SyncUnparseState,
    VehicleState,
};
