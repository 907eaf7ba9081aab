//! Per-entity sync trees.
//!
//! The engine treats a tree as an opaque set of nodes, each carrying a
//! `frame_index` and a per-slot `acked_players` mask; it only ever parses,
//! unparses and visits. The concrete node set per entity type lives here.

use gamestate_serde::MessageBuffer;
use glam::Vec3;
use thiserror::Error;

use crate::world::bits::SlotMask;
use crate::world::entity::EntityType;

pub const MAX_SEATS: usize = 16;

/// Errors produced while parsing a clone payload into a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncTreeError {
    /// The payload ended before every announced node was read.
    #[error("clone payload truncated while reading {node} node")]
    Truncated { node: &'static str },
}

/// Book-keeping every node carries for the acknowledgement machine.
#[derive(Debug, Default)]
pub struct NodeState {
    pub frame_index: u64,
    pub acked_players: SlotMask,
}

pub struct SyncParseState<'a> {
    pub buffer: &'a mut MessageBuffer,
    pub sync_type: u8,
    pub frame_index: u64,
}

pub struct SyncUnparseState<'a> {
    pub buffer: &'a mut MessageBuffer,
    pub sync_type: u8,
    pub target_slot: u8,
}

/// Player camera as last reported by the owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct CameraState {
    /// 0 = follow, 1 = free cam, 2 = offset from player.
    pub cam_mode: u8,
    pub free_cam_pos: [f32; 3],
    pub cam_offset: [f32; 3],
    pub cam_rot_x: f32,
    pub cam_rot_z: f32,
}

/// Seat occupancy for vehicular entities.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    /// Ped handles by seat; 0 = empty.
    pub occupants: [u16; MAX_SEATS],
    /// Seats occupied by player entities.
    pub player_occupants: SlotMask,
}

/// Vehicle linkage for peds and players.
#[derive(Debug, Clone, Copy, Default)]
pub struct PedState {
    pub cur_vehicle: Option<u16>,
    pub cur_vehicle_seat: u8,
    pub last_vehicle: Option<u16>,
    pub last_vehicle_seat: u8,
}

/// The surface the engine consumes: serialize, deserialize, visit, and a
/// few typed accessors the scheduler needs for interest decisions.
pub trait SyncTree: Send {
    /// Read a clone payload into the tree. Touched nodes take the parse
    /// frame index.
    fn parse(&mut self, state: &mut SyncParseState) -> Result<(), SyncTreeError>;

    /// Write the tree for one target client. Returns false when no node
    /// qualified for inclusion.
    fn unparse(&mut self, state: &mut SyncUnparseState) -> bool;

    /// Visit every node; the visitor returns false to stop early.
    fn visit(&mut self, visitor: &mut dyn FnMut(&mut NodeState) -> bool);

    fn position(&self) -> Vec3;

    fn player_camera(&self) -> Option<&CameraState>;

    fn vehicle_state(&self) -> Option<&VehicleState>;

    fn vehicle_state_mut(&mut self) -> Option<&mut VehicleState>;

    fn ped_state(&self) -> Option<&PedState>;

    fn ped_state_mut(&mut self) -> Option<&mut PedState>;
}

/// Build the tree for a freshly created entity.
pub fn make_sync_tree(entity_type: EntityType) -> Box<dyn SyncTree> {
    let payloads = match entity_type {
        EntityType::Player => vec![
            NodePayload::Position(Default::default()),
            NodePayload::Camera(Default::default()),
            NodePayload::Ped(Default::default()),
            NodePayload::Appearance(Default::default()),
        ],
        EntityType::Ped => vec![
            NodePayload::Position(Default::default()),
            NodePayload::Ped(Default::default()),
            NodePayload::Appearance(Default::default()),
        ],
        ty if ty.is_vehicle() => vec![
            NodePayload::Position(Default::default()),
            NodePayload::Vehicle(Default::default()),
            NodePayload::Appearance(Default::default()),
        ],
        _ => vec![
            NodePayload::Position(Default::default()),
            NodePayload::Appearance(Default::default()),
        ],
    };

    Box::new(StateTree {
        nodes: payloads
            .into_iter()
            .map(|payload| TreeNode {
                state: NodeState::default(),
                payload,
            })
            .collect(),
    })
}

struct TreeNode {
    state: NodeState,
    payload: NodePayload,
}

enum NodePayload {
    Position([f32; 3]),
    Camera(CameraState),
    Vehicle(VehicleState),
    Ped(PedState),
    Appearance(Vec<u8>),
}

impl Default for NodePayload {
    fn default() -> Self {
        Self::Position([0.0; 3])
    }
}

impl NodePayload {
    fn name(&self) -> &'static str {
        match self {
            Self::Position(_) => "position",
            Self::Camera(_) => "camera",
            Self::Vehicle(_) => "vehicle",
            Self::Ped(_) => "ped",
            Self::Appearance(_) => "appearance",
        }
    }

    fn parse(&mut self, buffer: &mut MessageBuffer) -> Option<()> {
        match self {
            Self::Position(pos) => {
                for v in pos.iter_mut() {
                    *v = f32::from_bits(buffer.read(32)?);
                }
            }
            Self::Camera(cam) => {
                cam.cam_mode = buffer.read(2)? as u8;
                for v in cam.free_cam_pos.iter_mut() {
                    *v = f32::from_bits(buffer.read(32)?);
                }
                for v in cam.cam_offset.iter_mut() {
                    *v = f32::from_bits(buffer.read(32)?);
                }
                cam.cam_rot_x = f32::from_bits(buffer.read(32)?);
                cam.cam_rot_z = f32::from_bits(buffer.read(32)?);
            }
            Self::Vehicle(veh) => {
                for occupant in veh.occupants.iter_mut() {
                    *occupant = if buffer.read(1)? == 1 {
                        buffer.read(13)? as u16
                    } else {
                        0
                    };
                }
                let mut mask = SlotMask::default();
                for seat in 0..MAX_SEATS as u8 {
                    if buffer.read(1)? == 1 {
                        mask.set(seat);
                    }
                }
                veh.player_occupants = mask;
            }
            Self::Ped(ped) => {
                if buffer.read(1)? == 1 {
                    ped.cur_vehicle = Some(buffer.read(13)? as u16);
                    ped.cur_vehicle_seat = buffer.read(5)? as u8;
                } else {
                    ped.cur_vehicle = None;
                    ped.cur_vehicle_seat = 0;
                }
            }
            Self::Appearance(data) => {
                let len = buffer.read(8)? as usize;
                let mut bytes = vec![0u8; len];
                if len > 0 && !buffer.read_bits(&mut bytes, len * 8) {
                    return None;
                }
                *data = bytes;
            }
        }
        Some(())
    }

    fn unparse(&self, buffer: &mut MessageBuffer) -> bool {
        match self {
            Self::Position(pos) => {
                for v in pos {
                    if !buffer.write(32, v.to_bits()) {
                        return false;
                    }
                }
            }
            Self::Camera(cam) => {
                if !buffer.write(2, cam.cam_mode as u32) {
                    return false;
                }
                for v in cam.free_cam_pos.iter().chain(cam.cam_offset.iter()) {
                    if !buffer.write(32, v.to_bits()) {
                        return false;
                    }
                }
                if !buffer.write(32, cam.cam_rot_x.to_bits())
                    || !buffer.write(32, cam.cam_rot_z.to_bits())
                {
                    return false;
                }
            }
            Self::Vehicle(veh) => {
                for &occupant in &veh.occupants {
                    if occupant != 0 {
                        if !buffer.write(1, 1) || !buffer.write(13, occupant as u32) {
                            return false;
                        }
                    } else if !buffer.write(1, 0) {
                        return false;
                    }
                }
                for seat in 0..MAX_SEATS as u8 {
                    let bit = veh.player_occupants.test(seat) as u32;
                    if !buffer.write(1, bit) {
                        return false;
                    }
                }
            }
            Self::Ped(ped) => {
                if let Some(vehicle) = ped.cur_vehicle {
                    if !buffer.write(1, 1)
                        || !buffer.write(13, vehicle as u32)
                        || !buffer.write(5, ped.cur_vehicle_seat as u32)
                    {
                        return false;
                    }
                } else if !buffer.write(1, 0) {
                    return false;
                }
            }
            Self::Appearance(data) => {
                if !buffer.write(8, data.len() as u32) {
                    return false;
                }
                if !data.is_empty() && !buffer.write_bits(data, data.len() * 8) {
                    return false;
                }
            }
        }
        true
    }
}

struct StateTree {
    nodes: Vec<TreeNode>,
}

impl SyncTree for StateTree {
    fn parse(&mut self, state: &mut SyncParseState) -> Result<(), SyncTreeError> {
        for node in &mut self.nodes {
            let present = state.buffer.read(1).ok_or(SyncTreeError::Truncated {
                node: node.payload.name(),
            })?;

            if present == 1 {
                node.payload
                    .parse(state.buffer)
                    .ok_or(SyncTreeError::Truncated {
                        node: node.payload.name(),
                    })?;
                node.state.frame_index = state.frame_index;
            }
        }
        Ok(())
    }

    fn unparse(&mut self, state: &mut SyncUnparseState) -> bool {
        let mut wrote = false;

        for node in &mut self.nodes {
            let include =
                state.sync_type == 1 || !node.state.acked_players.test(state.target_slot);

            if !state.buffer.write(1, include as u32) {
                return wrote;
            }

            if include {
                if !node.payload.unparse(state.buffer) {
                    return wrote;
                }
                wrote = true;
            }
        }

        wrote
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&mut NodeState) -> bool) {
        for node in &mut self.nodes {
            if !visitor(&mut node.state) {
                break;
            }
        }
    }

    fn position(&self) -> Vec3 {
        for node in &self.nodes {
            if let NodePayload::Position(pos) = &node.payload {
                return Vec3::from_array(*pos);
            }
        }
        Vec3::ZERO
    }

    fn player_camera(&self) -> Option<&CameraState> {
        self.nodes.iter().find_map(|node| match &node.payload {
            NodePayload::Camera(cam) => Some(cam),
            _ => None,
        })
    }

    fn vehicle_state(&self) -> Option<&VehicleState> {
        self.nodes.iter().find_map(|node| match &node.payload {
            NodePayload::Vehicle(veh) => Some(veh),
            _ => None,
        })
    }

    fn vehicle_state_mut(&mut self) -> Option<&mut VehicleState> {
        self.nodes.iter_mut().find_map(|node| match &mut node.payload {
            NodePayload::Vehicle(veh) => Some(veh),
            _ => None,
        })
    }

    fn ped_state(&self) -> Option<&PedState> {
        self.nodes.iter().find_map(|node| match &node.payload {
            NodePayload::Ped(ped) => Some(ped),
            _ => None,
        })
    }

    fn ped_state_mut(&mut self) -> Option<&mut PedState> {
        self.nodes.iter_mut().find_map(|node| match &mut node.payload {
            NodePayload::Ped(ped) => Some(ped),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_unparse(tree: &mut dyn SyncTree, buffer: &mut MessageBuffer) -> bool {
        let mut state = SyncUnparseState {
            buffer,
            sync_type: 1,
            target_slot: 0,
        };
        tree.unparse(&mut state)
    }

    #[test]
    fn create_payload_round_trips_position() {
        let mut source = make_sync_tree(EntityType::Automobile);

        if let Some(veh) = source.vehicle_state_mut() {
            veh.occupants[2] = 17;
            veh.player_occupants.set(2);
        }

        let mut wire = MessageBuffer::new(1200);
        assert!(full_unparse(source.as_mut(), &mut wire));
        wire.set_current_bit(0);

        let mut target = make_sync_tree(EntityType::Automobile);
        let mut state = SyncParseState {
            buffer: &mut wire,
            sync_type: 1,
            frame_index: 7,
        };
        target.parse(&mut state).unwrap();

        assert_eq!(target.position(), source.position());

        let veh = target.vehicle_state().unwrap();
        assert_eq!(veh.occupants[2], 17);
        assert!(veh.player_occupants.test(2));

        let mut frames = Vec::new();
        target.visit(&mut |node| {
            frames.push(node.frame_index);
            true
        });
        assert!(frames.iter().all(|&f| f == 7));
    }

    #[test]
    fn delta_unparse_skips_acked_nodes() {
        let mut tree = make_sync_tree(EntityType::Object);

        // ack every node for slot 3
        tree.visit(&mut |node| {
            node.acked_players.set(3);
            true
        });

        let mut buffer = MessageBuffer::new(1200);
        let mut state = SyncUnparseState {
            buffer: &mut buffer,
            sync_type: 2,
            target_slot: 3,
        };
        assert!(!tree.unparse(&mut state));

        // an unacked slot still gets everything
        let mut buffer = MessageBuffer::new(1200);
        let mut state = SyncUnparseState {
            buffer: &mut buffer,
            sync_type: 2,
            target_slot: 4,
        };
        assert!(tree.unparse(&mut state));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut tree = make_sync_tree(EntityType::Ped);

        let mut wire = MessageBuffer::from_bytes(&[0x80]); // one present bit, no data
        let mut state = SyncParseState {
            buffer: &mut wire,
            sync_type: 2,
            frame_index: 1,
        };

        assert!(tree.parse(&mut state).is_err());
    }

    #[test]
    fn trees_expose_type_specific_nodes() {
        assert!(make_sync_tree(EntityType::Player).player_camera().is_some());
        assert!(make_sync_tree(EntityType::Player).ped_state().is_some());
        assert!(make_sync_tree(EntityType::Heli).vehicle_state().is_some());
        assert!(make_sync_tree(EntityType::Object).vehicle_state().is_none());
        assert!(make_sync_tree(EntityType::Object).player_camera().is_none());
    }
}
