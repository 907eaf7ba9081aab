//! The authoritative game state: canonical entity set, per-client sync
//! state, and the glue between the tick scheduler, the ingress parser and
//! the drop handler.

pub mod drop;
pub mod ingress;
pub mod interest;
pub(crate) mod log;
pub mod tick;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use gamestate_serde::{ByteBuffer, MessageBuffer};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use crate::client::{Client, ClientRegistry, PacketFlags, SYNC_CHANNEL};
use crate::config::SyncVars;
use crate::connection::codec;
use crate::events::EventSink;
use crate::protocol::{MAX_OBJECT_ID, MSG_PACKED_ACKS, MSG_WORLD_GRID, OBJECT_ID_GRANT};
use crate::task::WorkerPool;
use crate::world::bits::ObjectBits;
use crate::world::entity::{EntityType, SyncEntity};
use crate::world::grid::WorldGrid;
use crate::world::object_ids::{encode_id_runs, ObjectIdPool};
use crate::world::registry::EntityRegistry;
use crate::world::script_guid::ScriptGuidPool;

use self::log::{gs_log, SyncLogger};

/// Ack buffer capacity per client.
const ACK_BUFFER_SIZE: usize = 16384;

/// Per-client replication state, guarded by the client's own mutex.
pub struct GameStateClientData {
    pub ack_buffer: MessageBuffer,
    /// Object ids this client is permitted to originate.
    pub object_ids: BTreeSet<u16>,
    pub player_entity: Weak<SyncEntity>,
    pub player_id: Option<u16>,
    /// Gate between a still-running worker and the next tick.
    pub syncing: bool,
    pub view_matrix: Mat4,
    /// Object ids referenced by each outgoing frame, for `gameStateAck`.
    pub ids_for_game_state: BTreeMap<u64, Vec<u16>>,
    pub ack_ts: u32,
    pub sync_ts: u32,
    pub client: Weak<dyn Client>,
}

impl GameStateClientData {
    fn new(client: Weak<dyn Client>) -> Self {
        Self {
            ack_buffer: MessageBuffer::new(ACK_BUFFER_SIZE),
            object_ids: BTreeSet::new(),
            player_entity: Weak::<SyncEntity>::new(),
            player_id: None,
            syncing: false,
            view_matrix: Mat4::IDENTITY,
            ids_for_game_state: BTreeMap::new(),
            ack_ts: 0,
            sync_ts: 0,
            client,
        }
    }
}

/// The lockable client data plus the pending-removals bitset, which is
/// deliberately reachable without the mutex: the trailing removals command
/// reads it lock-free and tolerates duplicates.
pub struct ClientSyncData {
    pub data: Mutex<GameStateClientData>,
    pub pending_removals: ObjectBits,
}

pub struct ServerGameState {
    pub(crate) vars: Arc<SyncVars>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) registry: EntityRegistry,
    pub(crate) object_ids: Mutex<ObjectIdPool>,
    pub(crate) script_guids: Mutex<ScriptGuidPool>,
    pub(crate) world_grid: Mutex<WorldGrid>,
    pub(crate) client_data: Mutex<HashMap<u16, Arc<ClientSyncData>>>,
    pub(crate) frame_index: AtomicU64,
    pub(crate) pool: WorkerPool,
    pub(crate) logger: SyncLogger,
    /// Destructive half of clone removal, drained on the net thread at the
    /// top of the next tick.
    pub(crate) deferred_removals: Mutex<Vec<u16>>,
}

impl ServerGameState {
    pub fn new(vars: Arc<SyncVars>, events: Arc<dyn EventSink>) -> Self {
        Self::with_pool(vars, events, 4, 64)
    }

    pub fn with_pool(
        vars: Arc<SyncVars>,
        events: Arc<dyn EventSink>,
        pool_threads: usize,
        pool_depth: usize,
    ) -> Self {
        let logger = SyncLogger::new(vars.clone());

        Self {
            vars,
            events,
            registry: EntityRegistry::new(),
            object_ids: Mutex::new(ObjectIdPool::new()),
            script_guids: Mutex::new(ScriptGuidPool::default()),
            world_grid: Mutex::new(WorldGrid::new()),
            client_data: Mutex::new(HashMap::new()),
            frame_index: AtomicU64::new(0),
            pool: WorkerPool::new(pool_threads, pool_depth),
            logger,
            deferred_removals: Mutex::new(Vec::new()),
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::SeqCst)
    }

    pub fn get_entity(&self, object_id: u16) -> Option<Arc<SyncEntity>> {
        self.registry.get_by_object_id(object_id)
    }

    pub fn entity_by_script_handle(&self, script_handle: u32) -> Option<Arc<SyncEntity>> {
        let handle = self.script_guids.lock().entity_handle(script_handle)?;
        self.registry.get_by_object_id((handle & 0xFFFF) as u16)
    }

    /// Per-client sync data, created on first use.
    pub fn client_data(&self, client: &Arc<dyn Client>) -> Arc<ClientSyncData> {
        self.client_data
            .lock()
            .entry(client.net_id())
            .or_insert_with(|| {
                Arc::new(ClientSyncData {
                    data: Mutex::new(GameStateClientData::new(Arc::downgrade(client))),
                    pending_removals: ObjectBits::new(),
                })
            })
            .clone()
    }

    pub(crate) fn client_data_snapshot(&self) -> Vec<(u16, Arc<ClientSyncData>)> {
        self.client_data
            .lock()
            .iter()
            .map(|(net_id, data)| (*net_id, data.clone()))
            .collect()
    }

    pub(crate) fn remove_client_data(&self, net_id: u16) {
        self.client_data.lock().remove(&net_id);
    }

    /// Allocate (or reuse) the script handle for an entity.
    pub fn make_script_handle(&self, entity: &Arc<SyncEntity>) -> Option<u32> {
        let mut guid = entity.guid.lock();

        if let Some(handle) = *guid {
            return Some(handle);
        }

        let handle = self.script_guids.lock().get_or_allocate(entity.handle);
        if handle.is_none() {
            ::log::warn!("script guid pool exhausted");
        }

        *guid = handle;
        handle
    }

    pub(crate) fn flush_acks(&self, client: &dyn Client, data: &mut GameStateClientData) {
        codec::flush_buffer(&mut data.ack_buffer, MSG_PACKED_ACKS, 0, client);
    }

    /// Broadcast one world-grid entry, or the full grid to a single client.
    pub(crate) fn send_world_grid(
        &self,
        registry: &dyn ClientRegistry,
        entry_index: Option<usize>,
        only: Option<&Arc<dyn Client>>,
    ) {
        let (base, bytes) = {
            let grid = self.world_grid.lock();
            match entry_index {
                Some(index) => (
                    WorldGrid::entry_base(index),
                    grid.entry(index).to_wire().to_vec(),
                ),
                None => (0, grid.to_wire()),
            }
        };

        let mut msg = ByteBuffer::new();
        msg.write_u32(MSG_WORLD_GRID);
        msg.write_u16(base);
        msg.write_u16(bytes.len() as u16);
        msg.write_bytes(&bytes);

        match only {
            Some(client) => {
                client.send_packet(SYNC_CHANNEL, msg.as_bytes(), PacketFlags::ReliableReplayed);
            }
            None => {
                registry.for_each_client(&mut |client| {
                    client.send_packet(
                        SYNC_CHANNEL,
                        msg.as_bytes(),
                        PacketFlags::ReliableReplayed,
                    );
                });
            }
        }
    }

    /// Tear an entity down: release its vehicle seat, fire the script
    /// event, queue the destructive mutation for the net thread and flag
    /// the removal towards every other client.
    pub fn remove_clone(&self, initiator_net_id: u16, object_id: u16) {
        gs_log!(
            self.logger,
            "remove_clone: deleting object {initiator_net_id} {object_id}"
        );

        let Some(entity) = self.registry.get_by_object_id(object_id) else {
            return;
        };

        if entity.deleting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.release_ped_seat(&entity);

        // stolen ids return to the global pool, not to the last owner
        let was_stolen = self.object_ids.lock().take_stolen(object_id);
        if was_stolen {
            if let Some(owner) = entity.owner() {
                self.client_data(&owner)
                    .data
                    .lock()
                    .object_ids
                    .remove(&object_id);
            }
        }

        let script_handle = self.make_script_handle(&entity).unwrap_or(0);
        self.events.entity_removed(script_handle);

        self.deferred_removals.lock().push(object_id);

        for (net_id, data) in self.client_data_snapshot() {
            if net_id != initiator_net_id {
                data.pending_removals.set(object_id);
            }
        }
    }

    /// Net-thread half of clone removal.
    pub(crate) fn finish_removals(&self) {
        let pending = std::mem::take(&mut *self.deferred_removals.lock());

        for object_id in pending {
            if let Some(entity) = self.registry.get_by_object_id(object_id) {
                if let Some(guid) = entity.guid.lock().take() {
                    self.script_guids.lock().release(guid);
                }
            }

            self.object_ids.lock().release_used(object_id);
            self.registry.erase(object_id);
        }
    }

    /// Clear a removed ped out of whatever vehicle seat it held.
    pub(crate) fn release_ped_seat(&self, entity: &Arc<SyncEntity>) {
        if !matches!(entity.entity_type, EntityType::Ped | EntityType::Player) {
            return;
        }

        let ped_handle = entity.object_id();
        let linkage = entity.sync_tree.lock().ped_state().copied();

        let Some(linkage) = linkage else {
            return;
        };

        let Some(vehicle_id) = linkage.cur_vehicle else {
            return;
        };

        let Some(vehicle) = self.registry.get_by_object_id(vehicle_id) else {
            return;
        };

        let mut tree = vehicle.sync_tree.lock();
        if let Some(vehicle_state) = tree.vehicle_state_mut() {
            let seat = linkage.cur_vehicle_seat as usize;

            if vehicle_state.occupants.get(seat) == Some(&ped_handle) {
                vehicle_state.occupants[seat] = 0;
                vehicle_state.player_occupants.reset(linkage.cur_vehicle_seat);
            }
        }
    }

    /// Focus position of a player entity: the camera when one is reported,
    /// else the entity position.
    pub(crate) fn player_focus_pos(entity: &Arc<SyncEntity>) -> Vec3 {
        let tree = entity.sync_tree.lock();
        let pos = tree.position();

        let Some(cam) = tree.player_camera() else {
            return pos;
        };

        match cam.cam_mode {
            1 => Vec3::from_array(cam.free_cam_pos),
            2 => pos + Vec3::from_array(cam.cam_offset),
            _ => pos,
        }
    }

    /// Issue up to `count` object ids to a client as a gap/run encoded
    /// `msgObjectIds` message.
    pub fn send_object_ids(&self, client: &Arc<dyn Client>, count: usize) {
        let ids = {
            let data_arc = self.client_data(client);
            let mut data = data_arc.data.lock();
            self.object_ids.lock().allocate(count, &mut data.object_ids)
        };

        let pairs = encode_id_runs(&ids);

        let mut msg = ByteBuffer::new();
        msg.write_u32(crate::protocol::MSG_OBJECT_IDS);
        msg.write_u16(pairs.len() as u16);

        for (gap, run) in pairs {
            msg.write_u16(gap);
            msg.write_u16(run);
        }

        client.send_packet(SYNC_CHANNEL, msg.as_bytes(), PacketFlags::ReliableReplayed);
    }

    /// The standard issuance size for `msgRequestObjectIds`.
    pub fn handle_request_object_ids(&self, client: &Arc<dyn Client>) {
        self.send_object_ids(client, OBJECT_ID_GRANT);
    }

    /// Human-readable used/allocated id counts, per client and global.
    pub fn object_id_report(&self, registry: &dyn ClientRegistry) -> String {
        let mut out = String::new();

        {
            let pool = self.object_ids.lock();
            let used = pool.used_count();
            let sent = pool.sent_count();
            let percent = if sent > 0 {
                used as f32 / sent as f32 * 100.0
            } else {
                0.0
            };
            out.push_str(&format!(
                "GLOBAL: {used}/{sent} object IDs used/sent ({percent:.2} percent)\n"
            ));
        }

        registry.for_each_client(&mut |client| {
            let data_arc = self.client_data(client);
            let data = data_arc.data.lock();

            let used = data
                .object_ids
                .iter()
                .filter(|&&id| self.registry.get_by_object_id(id).is_some())
                .count();
            let sent = data.object_ids.len();
            let percent = if sent > 0 {
                used as f32 / sent as f32 * 100.0
            } else {
                0.0
            };

            out.push_str(&format!(
                "{}: {used}/{sent} object IDs used/sent ({percent:.2} percent)\n",
                client.name()
            ));
        });

        out
    }
}

/// Bounds guard shared by every ingress tag.
pub(crate) fn valid_object_id(object_id: u16) -> bool {
    object_id != 0 && (object_id as usize) < MAX_OBJECT_ID
}
