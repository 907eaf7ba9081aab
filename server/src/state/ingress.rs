//! Inbound packet parsing: clone frames, ack frames, and the byte-aligned
//! service messages. Every clone record mirrors a reciprocal ack onto the
//! sender's ack buffer.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use gamestate_serde::{ByteBuffer, MessageBuffer};

use crate::client::{Client, ClientRegistry, PacketFlags, SYNC_CHANNEL};
use crate::connection::codec;
use crate::protocol::{
    MSG_NET_GAME_EVENT, MSG_PACKED_ACKS, MSG_TIME_SYNC, NET_ACKS, NET_CLONES, RecordTag,
};
use crate::state::log::gs_log;
use crate::state::{valid_object_id, ServerGameState};
use crate::time;
use crate::world::entity::{make_entity_handle, EntityType, SyncEntity};
use crate::world::sync_tree::SyncParseState;

/// The sender's ack buffer, taken out of the client data for the duration
/// of one frame's parsing so record handlers never hold the data lock.
struct AckPacketWrapper<'a> {
    buffer: &'a mut MessageBuffer,
    client: &'a dyn Client,
}

impl AckPacketWrapper<'_> {
    fn write(&mut self, width: u8, value: u32) {
        self.buffer.write(width, value);
    }

    fn flush(&mut self) {
        codec::maybe_flush_buffer(self.buffer, MSG_PACKED_ACKS, 0, self.client);
    }
}

impl ServerGameState {
    /// Entry point for `netClones` / `netAcks` frames.
    pub fn parse_game_state_packet(
        self: &Arc<Self>,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        packet: &[u8],
    ) {
        if !self.vars.enabled() {
            return;
        }

        let (payload, frame_type) = codec::decode_ingress_frame(packet);

        let Some(payload) = payload else {
            return;
        };

        match frame_type {
            NET_CLONES => self.parse_clone_packet(registry, client, &payload),
            NET_ACKS => self.parse_ack_packet(client, &payload),
            _ => {}
        }
    }

    fn parse_clone_packet(
        self: &Arc<Self>,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        payload: &[u8],
    ) {
        let data_arc = self.client_data(client);

        let mut ack_buffer = {
            let mut data = data_arc.data.lock();
            std::mem::replace(&mut data.ack_buffer, MessageBuffer::new(0))
        };

        {
            let mut ack = AckPacketWrapper {
                buffer: &mut ack_buffer,
                client: &**client,
            };

            let mut msg = MessageBuffer::from_bytes(payload);

            while !msg.is_at_end() {
                let Some(tag) = msg.read(3) else {
                    break;
                };

                match RecordTag::from_wire(tag) {
                    Some(RecordTag::Create) => {
                        self.process_clone_create(registry, client, &mut msg, &mut ack);
                    }
                    Some(RecordTag::Sync) => {
                        self.process_clone_sync(registry, client, &mut msg, &mut ack);
                    }
                    Some(RecordTag::Remove) => {
                        self.process_clone_remove(client, &mut msg, &mut ack);
                    }
                    Some(RecordTag::Takeover) => {
                        self.process_clone_takeover(registry, client, &mut msg);
                    }
                    Some(RecordTag::Timestamp) => {
                        let Some(new_ts) = msg.read(32) else {
                            break;
                        };

                        // the client will stamp following acks with this
                        ack.write(3, 5);
                        ack.write(32, new_ts);
                        ack.flush();

                        let mut data = data_arc.data.lock();
                        if data.ack_ts < new_ts {
                            data.ack_ts = new_ts;
                            data.sync_ts = new_ts;
                        }
                    }
                    Some(RecordTag::End) | None => break,
                }
            }
        }

        data_arc.data.lock().ack_buffer = ack_buffer;
    }

    fn process_clone_create(
        self: &Arc<Self>,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        msg: &mut MessageBuffer,
        ack: &mut AckPacketWrapper,
    ) {
        let object_id = self.process_clone_packet(registry, client, msg, 1);

        if let Some(object_id) = object_id {
            self.object_ids.lock().mark_used(object_id);
        }

        ack.write(3, 1);
        ack.write(13, object_id.unwrap_or(0) as u32);
        ack.flush();

        gs_log!(
            self.logger,
            "clone create: cl {}, id {:?}",
            client.net_id(),
            object_id
        );
    }

    fn process_clone_sync(
        self: &Arc<Self>,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        msg: &mut MessageBuffer,
        ack: &mut AckPacketWrapper,
    ) {
        let object_id = self.process_clone_packet(registry, client, msg, 2);

        ack.write(3, 2);
        ack.write(13, object_id.unwrap_or(0) as u32);
        ack.flush();
    }

    fn process_clone_remove(
        &self,
        client: &Arc<dyn Client>,
        msg: &mut MessageBuffer,
        ack: &mut AckPacketWrapper,
    ) {
        let Some(object_id) = msg.read(13) else {
            return;
        };
        let object_id = object_id as u16;

        // ack the remove no matter if we accept it
        ack.write(3, 3);
        ack.write(13, object_id as u32);
        ack.flush();

        if !valid_object_id(object_id) {
            return;
        }

        if let Some(entity) = self.registry.get_by_object_id(object_id) {
            if let Some(owner) = entity.owner() {
                if owner.net_id() != client.net_id() {
                    gs_log!(
                        self.logger,
                        "clone remove: wrong owner ({object_id}) from {}",
                        client.net_id()
                    );
                    return;
                }
            }
        }

        self.remove_clone(client.net_id(), object_id);
    }

    fn process_clone_takeover(
        &self,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        msg: &mut MessageBuffer,
    ) {
        let Some(client_id) = msg.read(16) else {
            return;
        };
        let Some(object_id) = msg.read(13) else {
            return;
        };
        let object_id = object_id as u16;

        if !valid_object_id(object_id) {
            return;
        }

        let Some(entity) = self.registry.get_by_object_id(object_id) else {
            return;
        };

        let target = if client_id != 0 {
            registry.client_by_net_id(client_id as u16)
        } else {
            Some(client.clone())
        };

        let Some(target) = target else {
            return;
        };

        {
            let owner = entity.client.read().upgrade();

            if let Some(owner) = &owner {
                // don't do duplicate migrations
                if owner.net_id() == target.net_id() {
                    return;
                }

                if owner.net_id() != client.net_id() {
                    gs_log!(
                        self.logger,
                        "takeover: {} tried to hand object {object_id} to {}, but the owner is {}; rejecting",
                        client.net_id(),
                        target.net_id(),
                        owner.net_id()
                    );
                    return;
                }
            }

            gs_log!(
                self.logger,
                "takeover: migrating object {object_id} to {}",
                target.net_id()
            );
        }

        self.reassign_entity(entity.handle, &target);
    }

    /// Shared create/sync record body. Returns the object id only when the
    /// record fully validated and mutated an entity, which is also what
    /// the mirrored ack reports.
    fn process_clone_packet(
        self: &Arc<Self>,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        msg: &mut MessageBuffer,
        parsing_type: u8,
    ) -> Option<u16> {
        let object_id = msg.read(13)? as u16;

        let wire_type = if parsing_type == 1 {
            Some(msg.read(4)? as u8)
        } else {
            None
        };

        let length = msg.read(12)? as usize;

        let mut payload = vec![0u8; length];
        if length > 0 && !msg.read_bits(&mut payload, length * 8) {
            return None;
        }

        let slot_id = client.slot_id()?;

        if !valid_object_id(object_id) {
            return None;
        }

        let data_arc = self.client_data(client);

        let timestamp = {
            let mut data = data_arc.data.lock();
            // the sender's identity in the packet namespace
            data.player_id = Some(client.net_id());
            data.sync_ts
        };

        let object_type = match wire_type {
            Some(raw) => match EntityType::from_wire(raw) {
                Some(ty) => Some(ty),
                None => {
                    gs_log!(
                        self.logger,
                        "clone create: cl {} sent unknown entity type {raw}",
                        client.net_id()
                    );
                    return None;
                }
            },
            None => None,
        };

        let mut entity = self.registry.get_by_object_id(object_id);
        let valid_entity = entity
            .as_ref()
            .map(|e| e.owner().is_some())
            .unwrap_or(false);

        let mut created_here = false;

        if parsing_type == 1 {
            let object_type = object_type.expect("create records carry a type");

            if !valid_entity {
                let frame_index = self.frame_index.load(Ordering::SeqCst);
                let new_entity = Arc::new(SyncEntity::new(
                    object_type,
                    make_entity_handle(0, object_id),
                    Arc::downgrade(client),
                    frame_index,
                ));

                self.registry.insert(new_entity.clone());
                created_here = true;
                entity = Some(new_entity);
            } else {
                let existing = entity.as_ref().expect("valid entity present");

                // duplicate create; that's not supposed to happen
                if object_type != existing.entity_type {
                    gs_log!(
                        self.logger,
                        "clone create: cl {} tried to create entity {object_id} (type {:?}), but it exists as {:?}; bad!",
                        client.net_id(),
                        object_type,
                        existing.entity_type
                    );
                    return None;
                }
            }
        } else if !valid_entity {
            gs_log!(
                self.logger,
                "clone sync: wrong entity ({object_id}) from {}",
                client.net_id()
            );
            return None;
        }

        let entity = entity.expect("entity exists past validation");

        entity.did_deletion.reset(slot_id);
        entity.acked_creation.set(slot_id);

        let owner = entity.owner()?;

        if owner.net_id() != client.net_id() {
            gs_log!(
                self.logger,
                "clone packet: wrong owner ({object_id}) from {}",
                client.net_id()
            );
            return None;
        }

        entity.timestamp.store(timestamp, Ordering::Relaxed);

        {
            let mut tree = entity.sync_tree.lock();
            let mut buffer = MessageBuffer::from_bytes(&payload);
            let mut state = SyncParseState {
                buffer: &mut buffer,
                sync_type: parsing_type,
                frame_index: self.frame_index.load(Ordering::SeqCst),
            };

            if let Err(err) = tree.parse(&mut state) {
                gs_log!(
                    self.logger,
                    "clone packet: dropping malformed payload for {object_id}: {err}"
                );
                return None;
            }

            // reset resends so the new state goes out immediately
            for resend in &entity.last_resends {
                resend.store(0, Ordering::Relaxed);
            }

            if parsing_type == 1 {
                tree.visit(&mut |node| {
                    node.acked_players.clear();
                    true
                });
            }
        }

        if entity.entity_type == EntityType::Player {
            let first_player = {
                let mut data = data_arc.data.lock();
                let first = data.player_entity.upgrade().is_none();
                data.player_entity = Arc::downgrade(&entity);
                first
            };

            if first_player {
                self.send_world_grid(registry, None, Some(client));
            }
        }

        if created_here {
            let script_handle = self.make_script_handle(&entity).unwrap_or(0);
            self.events.entity_created(script_handle);

            // this id is live again everywhere; nobody should still be
            // trying to delete it
            for (_, data) in self.client_data_snapshot() {
                data.pending_removals.reset(object_id);
            }
        }

        Some(object_id)
    }

    fn parse_ack_packet(&self, client: &Arc<dyn Client>, payload: &[u8]) {
        let Some(slot_id) = client.slot_id() else {
            return;
        };

        let data_arc = self.client_data(client);
        let mut msg = MessageBuffer::from_bytes(payload);

        while !msg.is_at_end() {
            let Some(tag) = msg.read(3) else {
                break;
            };

            match RecordTag::from_wire(tag) {
                Some(RecordTag::Create) => {
                    let Some(object_id) = msg.read(13) else {
                        break;
                    };

                    if let Some(entity) = self.registry.get_by_object_id(object_id as u16) {
                        entity.sync_tree.lock().visit(&mut |node| {
                            node.acked_players.set(slot_id);
                            true
                        });

                        entity.did_deletion.reset(slot_id);
                        entity.acked_creation.set(slot_id);
                    }
                }
                Some(RecordTag::Remove) => {
                    let Some(object_id) = msg.read(13) else {
                        break;
                    };

                    data_arc.pending_removals.reset(object_id as u16);
                }
                _ => break,
            }
        }
    }

    /// `gameStateAck{frame_index, ignore list}`: promote every node the
    /// client has now provably seen.
    pub fn handle_game_state_ack(&self, client: &Arc<dyn Client>, payload: &[u8]) {
        if !self.vars.enabled() {
            return;
        }

        let Some(slot_id) = client.slot_id() else {
            return;
        };

        let mut buffer = ByteBuffer::from_bytes(payload);

        let Ok(frame_index) = buffer.read_u64() else {
            return;
        };

        let mut ignore_handles = HashSet::new();
        let Ok(ignore_count) = buffer.read_u8() else {
            return;
        };

        for _ in 0..ignore_count {
            let Ok(ignore_id) = buffer.read_u16() else {
                return;
            };
            ignore_handles.insert(make_entity_handle(0, ignore_id));
        }

        let data_arc = self.client_data(client);
        let bucket = data_arc
            .data
            .lock()
            .ids_for_game_state
            .remove(&frame_index)
            .unwrap_or_default();

        for object_id in bucket {
            let Some(entity) = self.registry.get_by_object_id(object_id) else {
                continue;
            };

            let has_created = entity.acked_creation.test(slot_id);
            let has_deleted = entity.did_deletion.test(slot_id);

            if !has_created || has_deleted {
                continue;
            }

            if ignore_handles.contains(&entity.handle) {
                continue;
            }

            entity.sync_tree.lock().visit(&mut |node| {
                if node.frame_index <= frame_index {
                    node.acked_players.set(slot_id);
                }
                true
            });
        }
    }

    /// `msgTimeSyncReq{req_time, req_seq}` -> `msgTimeSync` echo with the
    /// server millisecond clock.
    pub fn handle_time_sync_req(&self, client: &Arc<dyn Client>, payload: &[u8]) {
        let mut buffer = ByteBuffer::from_bytes(payload);

        let (Ok(req_time), Ok(req_seq)) = (buffer.read_u32(), buffer.read_u32()) else {
            return;
        };

        let mut reply = ByteBuffer::new();
        reply.write_u32(MSG_TIME_SYNC);
        reply.write_u32(req_time);
        reply.write_u32(req_seq);
        reply.write_u32((time::msec() & 0xFFFF_FFFF) as u32);

        client.send_packet(SYNC_CHANNEL, reply.as_bytes(), PacketFlags::ReliableReplayed);
    }

    /// `msgNetGameEvent`: pure relay, prefixed with the sender's net id.
    pub fn handle_net_game_event(
        &self,
        registry: &dyn ClientRegistry,
        client: &Arc<dyn Client>,
        payload: &[u8],
    ) {
        let mut buffer = ByteBuffer::from_bytes(payload);

        let Ok(target_count) = buffer.read_u8() else {
            return;
        };

        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            let Ok(target) = buffer.read_u16() else {
                return;
            };
            targets.push(target);
        }

        let mut relay = ByteBuffer::new();
        relay.write_u32(MSG_NET_GAME_EVENT);
        relay.write_u16(client.net_id());
        relay.write_bytes(buffer.remaining_bytes());

        for target in targets {
            if let Some(target_client) = registry.client_by_net_id(target) {
                target_client.send_packet(SYNC_CHANNEL, relay.as_bytes(), PacketFlags::Reliable);
            }
        }
    }
}
