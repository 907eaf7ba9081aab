//! Client-drop handling: world-grid release, orphan reassignment with
//! candidate ranking, and server-initiated ownership migration.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::client::{Client, ClientRegistry};
use crate::state::interest::REASSIGN_RANGE_SQ;
use crate::state::log::gs_log;
use crate::state::ServerGameState;
use crate::world::entity::EntityType;

impl ServerGameState {
    /// Move an entity to a new owner, marking its id stolen and resetting
    /// all per-slot pacing and node acknowledgement state so the ownership
    /// change syncs out immediately.
    pub fn reassign_entity(&self, entity_handle: u32, target: &Arc<dyn Client>) {
        let object_id = (entity_handle & 0xFFFF) as u16;

        let Some(entity) = self.registry.get_by_object_id(object_id) else {
            return;
        };

        let old_client = {
            let mut client = entity.client.write();
            std::mem::replace(&mut *client, Arc::downgrade(target))
        };

        let old_client = old_client.upgrade();

        gs_log!(
            self.logger,
            "reassign: obj id {object_id}, old client {}, new client {}",
            old_client.as_ref().map(|c| c.net_id() as i32).unwrap_or(-1),
            target.net_id()
        );

        if let Some(old_client) = old_client {
            self.client_data(&old_client)
                .data
                .lock()
                .object_ids
                .remove(&object_id);
        }

        self.client_data(target)
            .data
            .lock()
            .object_ids
            .insert(object_id);

        // on deletion this id returns to the global pool, not to whoever
        // owned it last
        self.object_ids.lock().mark_stolen(object_id);

        // let the new owner sync instantly so everyone learns about the
        // ownership change as soon as possible
        entity.reset_pacing();

        let next_frame = self.frame_index.load(Ordering::SeqCst) + 1;

        entity.sync_tree.lock().visit(&mut |node| {
            node.frame_index = next_frame;
            node.acked_players.clear();
            true
        });
    }

    /// A client left: give back its grid sectors, then rehome or delete
    /// every entity it owned.
    pub fn handle_client_drop(&self, registry: &dyn ClientRegistry, client: &Arc<dyn Client>) {
        if !self.vars.enabled() {
            return;
        }

        gs_log!(self.logger, "client drop - reassigning");

        if let Some(slot_id) = client.slot_id() {
            let changed = self.world_grid.lock().release_slot(slot_id);

            for index in changed {
                self.send_world_grid(registry, Some(index), None);
            }
        }

        let mut to_erase = BTreeSet::new();

        for entity in self.registry.snapshot() {
            let has_other_owner = entity
                .owner()
                .map(|owner| owner.net_id() != client.net_id())
                .unwrap_or(false);

            if has_other_owner {
                continue;
            }

            let pos = entity.position();

            let mut candidates: Vec<(f32, Arc<dyn Client>)> = Vec::new();

            registry.for_each_client(&mut |target| {
                if target.net_id() == client.net_id() || target.slot_id().is_none() {
                    return;
                }

                let mut distance = f32::MAX;

                let player_entity = {
                    let data_arc = self.client_data(target);
                    let data = data_arc.data.lock();
                    data.player_entity.upgrade()
                };

                if let Some(player_entity) = player_entity {
                    let focus = Self::player_focus_pos(&player_entity);

                    // an unknown orphan position ranks every candidate at
                    // infinity, forcing a delete below
                    if pos.x != 0.0 {
                        distance = (focus - pos).length_squared();
                    }
                }

                candidates.push((distance, target.clone()));
            });

            candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(CmpOrdering::Equal));

            // players die with their client
            if entity.entity_type == EntityType::Player {
                candidates.clear();
            }

            let closest = candidates.first();

            if closest.map(|(d, _)| *d >= REASSIGN_RANGE_SQ).unwrap_or(true) {
                gs_log!(
                    self.logger,
                    "drop: no candidates for entity {}, deleting",
                    entity.handle
                );
                to_erase.insert(entity.object_id());
            } else {
                let (_, target) = closest.expect("non-empty candidates");
                gs_log!(
                    self.logger,
                    "drop: reassigning entity {} from {} to {}",
                    entity.handle,
                    client.name(),
                    target.name()
                );
                self.reassign_entity(entity.handle, target);
            }
        }

        for object_id in to_erase {
            self.remove_clone(client.net_id(), object_id);
        }

        // the ids this client never consumed go back to the pool
        {
            let data_arc = self.client_data(client);
            let data = data_arc.data.lock();
            let mut pool = self.object_ids.lock();

            for &object_id in &data.object_ids {
                pool.clear_sent(object_id);
            }
        }

        // free the slot's bits on every remaining entity
        if let Some(slot_id) = client.slot_id() {
            self.registry.for_each(|entity| {
                entity.acked_creation.reset(slot_id);

                entity.sync_tree.lock().visit(&mut |node| {
                    node.acked_players.reset(slot_id);
                    true
                });
            });
        }

        self.remove_client_data(client.net_id());
    }
}
