//! The per-tick scheduler: stamps frames, refreshes the world grid and the
//! per-client camera state, selects per-(client, entity) work, and hands
//! each client's command list to the worker pool.

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use gamestate_serde::MessageBuffer;
use glam::{EulerRot, Mat4, Quat, Vec3};

use crate::client::{Client, ClientRegistry};
use crate::connection::codec;
use crate::protocol::{
    GAME_STATE_ACK_WINDOW, MAX_CLONE_PAYLOAD, MSG_PACKED_CLONES, UNPARSE_SCRATCH_SIZE,
};
use crate::state::interest;
use crate::state::log::gs_log;
use crate::state::ServerGameState;
use crate::time;
use crate::world::entity::{EntityType, SyncEntity};
use crate::world::sync_tree::SyncUnparseState;

/// Clone buffer capacity per command list execution.
const CLONE_BUFFER_SIZE: usize = 16384;

pub(crate) struct SyncCommandState {
    pub clone_buffer: MessageBuffer,
    pub frame_index: u64,
    pub client: Arc<dyn Client>,
}

impl SyncCommandState {
    fn flush(&mut self) {
        codec::flush_buffer(
            &mut self.clone_buffer,
            MSG_PACKED_CLONES,
            self.frame_index,
            &*self.client,
        );
    }

    fn maybe_flush(&mut self) {
        codec::maybe_flush_buffer(
            &mut self.clone_buffer,
            MSG_PACKED_CLONES,
            self.frame_index,
            &*self.client,
        );
    }
}

type SyncCommand = Box<dyn FnOnce(&mut SyncCommandState, &ServerGameState) + Send>;

struct SyncCommandList {
    frame_index: u64,
    client: Arc<dyn Client>,
    commands: Vec<SyncCommand>,
}

impl SyncCommandList {
    fn execute(self, game: &ServerGameState) {
        let mut state = SyncCommandState {
            clone_buffer: MessageBuffer::new(CLONE_BUFFER_SIZE),
            frame_index: self.frame_index,
            client: self.client,
        };

        for command in self.commands {
            command(&mut state, game);
        }

        state.flush();
    }
}

/// Snapshot of an entity for one tick's selection pass.
struct RelevantEntity {
    entity: Arc<SyncEntity>,
    pos: Vec3,
    vehicle_occupied: bool,
    owner: Option<Arc<dyn Client>>,
}

impl ServerGameState {
    /// One replication tick. Driven externally on the net thread.
    pub fn tick(self: &Arc<Self>, registry: &dyn ClientRegistry) {
        if !self.vars.enabled() {
            return;
        }

        self.finish_removals();

        let frame_index = self.frame_index.load(Ordering::SeqCst);

        self.registry.for_each(|entity| {
            entity.frame_index.store(frame_index, Ordering::Relaxed);
        });

        self.update_world_grid(registry);

        self.update_entities();

        // cache entities so each client's pass doesn't re-walk the
        // registry under its lock
        let mut relevant = Vec::with_capacity(self.registry.len());

        self.registry.for_each(|entity| {
            let (pos, vehicle_occupied) = {
                let tree = entity.sync_tree.lock();
                let occupied = tree
                    .vehicle_state()
                    .map(|veh| veh.player_occupants.any())
                    .unwrap_or(false);
                (tree.position(), occupied)
            };

            relevant.push(RelevantEntity {
                entity: entity.clone(),
                pos,
                vehicle_occupied,
                owner: entity.owner(),
            });
        });

        let cur_time = time::msec();

        registry.for_each_client(&mut |client| {
            self.tick_client(client, &relevant, cur_time, frame_index);
        });

        self.frame_index.fetch_add(1, Ordering::SeqCst);
    }

    fn tick_client(
        self: &Arc<Self>,
        client: &Arc<dyn Client>,
        relevant: &[RelevantEntity],
        cur_time: u64,
        frame_index: u64,
    ) {
        let Some(slot_id) = client.slot_id() else {
            return;
        };

        let data_arc = self.client_data(client);

        let (player_entity, view_matrix) = {
            let mut data = data_arc.data.lock();

            if data.player_id.is_none() {
                return;
            }

            // any ACKs to send?
            self.flush_acks(&**client, &mut data);

            if data.syncing {
                // the previous tick's worker is still running; drop this one
                return;
            }
            data.syncing = true;

            (data.player_entity.upgrade(), data.view_matrix)
        };

        let player_pos = player_entity.as_ref().map(Self::player_focus_pos);

        let mut list = SyncCommandList {
            frame_index,
            client: client.clone(),
            commands: Vec::new(),
        };

        list.commands.push(Box::new(move |state, _| {
            state.clone_buffer.write(3, 5);
            state.clone_buffer.write(32, (cur_time & 0xFFFF_FFFF) as u32);
            state.clone_buffer.write(32, ((cur_time >> 32) & 0xFFFF_FFFF) as u32);
            state.maybe_flush();
        }));

        let resend_delay =
            interest::resend_delay_ms(client.ping_ms(), client.ping_variance_ms());
        let culling = self.vars.distance_culling();
        let radius_frequency = self.vars.radius_frequency();

        for item in relevant {
            let Some(owner) = &item.owner else {
                continue;
            };

            let entity = &item.entity;
            let has_created = entity.acked_creation.test(slot_id);

            let should_be_created = interest::should_be_created(
                culling,
                client.net_id() == owner.net_id(),
                entity.entity_type,
                item.pos,
                player_pos,
                item.vehicle_occupied,
            );

            if should_be_created {
                let mut sync_type = 2u8;

                if !has_created || entity.did_deletion.test(slot_id) {
                    gs_log!(
                        self.logger,
                        "tick: {}creating object {} for {}",
                        if has_created { "re" } else { "" },
                        entity.object_id(),
                        client.net_id()
                    );
                    sync_type = 1;
                }

                let mut should_send = true;

                let last_resend = entity.last_resends[slot_id as usize].load(Ordering::Relaxed);
                if last_resend != 0 && cur_time.saturating_sub(last_resend) < resend_delay {
                    gs_log!(
                        self.logger,
                        "tick: skipping resend for object {} (resend delay {}ms)",
                        entity.object_id(),
                        resend_delay
                    );
                    should_send = false;
                }

                if sync_type == 2 && should_send {
                    let sync_delay = interest::sync_delay_ms(
                        radius_frequency,
                        entity.entity_type,
                        item.pos,
                        player_pos,
                        &view_matrix,
                    );

                    let last_sync = entity.last_syncs[slot_id as usize].load(Ordering::Relaxed);
                    if cur_time.saturating_sub(last_sync) < sync_delay {
                        gs_log!(
                            self.logger,
                            "tick: skipping sync for object {} (sync delay {}ms)",
                            entity.object_id(),
                            sync_delay
                        );
                        should_send = false;
                    }
                }

                if should_send {
                    let entity = entity.clone();
                    let owner_net_id = owner.net_id();

                    list.commands.push(Box::new(move |state, game| {
                        serialize_entity(state, game, &entity, owner_net_id, sync_type, cur_time);
                    }));
                }
            } else if has_created {
                gs_log!(
                    self.logger,
                    "tick: distance-culling object {} for {}",
                    entity.object_id(),
                    client.net_id()
                );

                data_arc.pending_removals.set(entity.object_id());

                // unacknowledge creation
                entity.acked_creation.reset(slot_id);
                entity.did_deletion.set(slot_id);
            }
        }

        {
            let removals = data_arc.clone();
            list.commands.push(Box::new(move |state, _| {
                // read without the data lock; a duplicate or one-tick-late
                // removal is fine here
                removals.pending_removals.for_each_set(|object_id| {
                    state.clone_buffer.write(3, 3);
                    state.clone_buffer.write(13, object_id as u32);
                    state.maybe_flush();
                });
            }));
        }

        let game = Arc::clone(self);
        let done = data_arc.clone();

        let posted = self.pool.try_post(move || {
            list.execute(&game);
            done.data.lock().syncing = false;
        });

        if !posted {
            // leave `syncing` set so the gate keeps other attempts out
            gs_log!(self.logger, "thread pool full?");
        }

        {
            let mut data = data_arc.data.lock();
            while let Some((&bucket, _)) = data.ids_for_game_state.first_key_value() {
                if bucket + GAME_STATE_ACK_WINDOW < frame_index {
                    data.ids_for_game_state.pop_first();
                } else {
                    break;
                }
            }
        }
    }

    fn update_world_grid(&self, registry: &dyn ClientRegistry) {
        registry.for_each_client(&mut |client| {
            let Some(slot_id) = client.slot_id() else {
                return;
            };

            let player_entity = {
                let data_arc = self.client_data(client);
                let data = data_arc.data.lock();
                data.player_entity.upgrade()
            };

            let Some(player_entity) = player_entity else {
                return;
            };

            let pos = Self::player_focus_pos(&player_entity);
            let changed = self.world_grid.lock().update_client(slot_id, pos.x, pos.y);

            for index in changed {
                self.send_world_grid(registry, Some(index), None);
            }
        });
    }

    /// Refresh each player's stored view matrix from its camera node and
    /// keep vehicle seat occupancy in step with ped linkage changes.
    fn update_entities(&self) {
        for entity in self.registry.snapshot() {
            if entity.entity_type == EntityType::Player {
                self.update_player_camera(&entity);
            }

            if matches!(entity.entity_type, EntityType::Ped | EntityType::Player) {
                self.update_vehicle_seats(&entity);
            }
        }
    }

    fn update_player_camera(&self, entity: &Arc<SyncEntity>) {
        let Some(client) = entity.owner() else {
            return;
        };

        let cam = {
            let tree = entity.sync_tree.lock();
            let pos = tree.position();
            tree.player_camera().map(|cam| (*cam, pos))
        };

        let Some((cam, pos)) = cam else {
            return;
        };

        let cam_translate = match cam.cam_mode {
            1 => Vec3::from_array(cam.free_cam_pos),
            2 => pos + Vec3::from_array(cam.cam_offset),
            _ => pos,
        };

        let rot = Quat::from_euler(EulerRot::XYZ, cam.cam_rot_x, 0.0, cam.cam_rot_z);
        let view =
            (Mat4::from_translation(cam_translate) * Mat4::from_quat(rot)).inverse();

        let data_arc = self.client_data(&client);
        data_arc.data.lock().view_matrix = view;
    }

    fn update_vehicle_seats(&self, entity: &Arc<SyncEntity>) {
        let ped_handle = entity.object_id();

        let linkage = entity.sync_tree.lock().ped_state().copied();
        let Some(linkage) = linkage else {
            return;
        };

        if linkage.last_vehicle == linkage.cur_vehicle
            && linkage.last_vehicle_seat == linkage.cur_vehicle_seat
        {
            return;
        }

        if let Some(last_vehicle) = linkage
            .last_vehicle
            .and_then(|id| self.registry.get_by_object_id(id))
        {
            let mut tree = last_vehicle.sync_tree.lock();
            if let Some(veh) = tree.vehicle_state_mut() {
                let seat = linkage.last_vehicle_seat as usize;
                if veh.occupants.get(seat) == Some(&ped_handle) {
                    veh.occupants[seat] = 0;
                    veh.player_occupants.reset(linkage.last_vehicle_seat);
                }
            }
        }

        if let Some(cur_vehicle) = linkage
            .cur_vehicle
            .and_then(|id| self.registry.get_by_object_id(id))
        {
            let mut tree = cur_vehicle.sync_tree.lock();
            if let Some(veh) = tree.vehicle_state_mut() {
                let seat = linkage.cur_vehicle_seat as usize;
                if veh.occupants.get(seat) == Some(&0) {
                    veh.occupants[seat] = ped_handle;

                    if entity.entity_type == EntityType::Player {
                        veh.player_occupants.set(linkage.cur_vehicle_seat);
                    }
                }
            }
        }

        let mut tree = entity.sync_tree.lock();
        if let Some(ped) = tree.ped_state_mut() {
            ped.last_vehicle = ped.cur_vehicle;
            ped.last_vehicle_seat = ped.cur_vehicle_seat;
        }
    }
}

/// Worker-side serialization of one create/sync record.
fn serialize_entity(
    cmd_state: &mut SyncCommandState,
    game: &ServerGameState,
    entity: &Arc<SyncEntity>,
    owner_net_id: u16,
    sync_type: u8,
    cur_time: u64,
) {
    let Some(slot_id) = cmd_state.client.slot_id() else {
        return;
    };

    thread_local! {
        static UNPARSE: RefCell<MessageBuffer> =
            RefCell::new(MessageBuffer::new(UNPARSE_SCRATCH_SIZE));
    }

    UNPARSE.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        scratch.set_current_bit(0);

        let wrote = {
            let mut tree = entity.sync_tree.lock();
            let mut state = SyncUnparseState {
                buffer: &mut scratch,
                sync_type,
                target_slot: slot_id,
            };
            tree.unparse(&mut state)
        };

        if !wrote {
            return;
        }

        let len = (scratch.current_bit() / 8 + 1).min(scratch.bytes().len());
        if len > MAX_CLONE_PAYLOAD {
            return;
        }

        let start_bit = cmd_state.clone_buffer.current_bit();

        {
            let data_arc = game.client_data(&cmd_state.client);
            let mut data = data_arc.data.lock();
            data.ids_for_game_state
                .entry(cmd_state.frame_index)
                .or_default()
                .push(entity.object_id());
        }

        let buffer = &mut cmd_state.clone_buffer;
        buffer.write(3, sync_type as u32);
        buffer.write(13, entity.object_id() as u32);
        buffer.write(16, owner_net_id as u32);

        if sync_type == 1 {
            buffer.write(4, entity.entity_type.to_wire() as u32);
        }

        buffer.write(32, entity.timestamp.load(Ordering::Relaxed));
        buffer.write(12, len as u32);

        if !buffer.write_bits(&scratch.bytes()[..len], len * 8) {
            cmd_state.clone_buffer.set_current_bit(start_bit);

            // force a buffer flush, we're oversize
            cmd_state.flush();
        } else if cmd_state.client.slot_id() == Some(slot_id) {
            entity.last_syncs[slot_id as usize].store(cur_time, Ordering::Relaxed);
            entity.last_resends[slot_id as usize].store(cur_time, Ordering::Relaxed);
        }

        cmd_state.maybe_flush();
    });
}
