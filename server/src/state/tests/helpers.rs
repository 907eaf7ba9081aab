//! Shared fixtures: an in-memory client/registry pair, an event recorder,
//! and builders/decoders for the clone wire format.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gamestate_serde::{ByteBuffer, MessageBuffer};
use parking_lot::Mutex;

use crate::client::{Client, ClientRegistry, PacketFlags};
use crate::config::SyncVars;
use crate::connection::codec;
use crate::events::EventSink;
use crate::protocol::{NET_ACKS, NET_CLONES};
use crate::state::ServerGameState;
use crate::world::entity::EntityType;

pub struct SentPacket {
    pub payload: Vec<u8>,
    pub flags: PacketFlags,
}

pub struct TestClient {
    net_id: u16,
    name: String,
    slot: Mutex<Option<u8>>,
    ping_ms: u32,
    ping_variance_ms: u32,
    pub sent: Mutex<Vec<SentPacket>>,
}

impl TestClient {
    pub fn new(net_id: u16, slot: u8) -> Arc<Self> {
        Arc::new(Self {
            net_id,
            name: format!("client-{net_id}"),
            slot: Mutex::new(Some(slot)),
            ping_ms: 0,
            ping_variance_ms: 0,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn drop_slot(&self) {
        *self.slot.lock() = None;
    }

    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drain captured packets, keeping only those with the given leading
    /// message type.
    pub fn take_messages(&self, msg_type: u32) -> Vec<Vec<u8>> {
        self.take_sent()
            .into_iter()
            .filter(|packet| {
                packet.payload.len() >= 4
                    && u32::from_le_bytes(packet.payload[..4].try_into().unwrap()) == msg_type
            })
            .map(|packet| packet.payload)
            .collect()
    }
}

impl Client for TestClient {
    fn net_id(&self) -> u16 {
        self.net_id
    }

    fn slot_id(&self) -> Option<u8> {
        *self.slot.lock()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ping_ms(&self) -> u32 {
        self.ping_ms
    }

    fn ping_variance_ms(&self) -> u32 {
        self.ping_variance_ms
    }

    fn send_packet(&self, _channel: u8, payload: &[u8], flags: PacketFlags) {
        self.sent.lock().push(SentPacket {
            payload: payload.to_vec(),
            flags,
        });
    }
}

#[derive(Default)]
pub struct TestRegistry {
    clients: Mutex<Vec<Arc<TestClient>>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Arc<TestClient>) {
        self.clients.lock().push(client);
    }

    pub fn remove(&self, net_id: u16) {
        self.clients.lock().retain(|c| c.net_id != net_id);
    }

    pub fn clients(&self) -> Vec<Arc<TestClient>> {
        self.clients.lock().clone()
    }
}

impl ClientRegistry for TestRegistry {
    fn for_each_client(&self, f: &mut dyn FnMut(&Arc<dyn Client>)) {
        for client in self.clients.lock().iter() {
            let as_dyn: Arc<dyn Client> = client.clone();
            f(&as_dyn);
        }
    }

    fn client_by_net_id(&self, net_id: u16) -> Option<Arc<dyn Client>> {
        self.clients
            .lock()
            .iter()
            .find(|c| c.net_id == net_id)
            .map(|c| c.clone() as Arc<dyn Client>)
    }
}

#[derive(Default)]
pub struct CaptureEvents {
    pub created: Mutex<Vec<u32>>,
    pub removed: Mutex<Vec<u32>>,
}

impl EventSink for CaptureEvents {
    fn entity_created(&self, script_handle: u32) {
        self.created.lock().push(script_handle);
    }

    fn entity_removed(&self, script_handle: u32) {
        self.removed.lock().push(script_handle);
    }
}

pub fn make_state() -> (Arc<ServerGameState>, Arc<SyncVars>, Arc<CaptureEvents>) {
    let vars = Arc::new(SyncVars::default());
    vars.set_enabled(true);

    let events = Arc::new(CaptureEvents::default());
    let state = Arc::new(ServerGameState::new(vars.clone(), events.clone()));

    (state, vars, events)
}

pub fn as_dyn(client: &Arc<TestClient>) -> Arc<dyn Client> {
    client.clone()
}

/// A minimal tree payload: position present, every other node absent.
pub fn position_payload(pos: [f32; 3]) -> Vec<u8> {
    let mut buffer = MessageBuffer::new(64);

    buffer.write(1, 1);
    for v in pos {
        buffer.write(32, v.to_bits());
    }

    // absent markers cover the deepest tree shape
    for _ in 0..4 {
        buffer.write(1, 0);
    }

    buffer.bytes()[..buffer.data_length()].to_vec()
}

/// A player payload whose ped node reports a vehicle seat: position and
/// linkage present, camera and appearance absent.
pub fn player_payload_with_vehicle(pos: [f32; 3], vehicle: u16, seat: u8) -> Vec<u8> {
    let mut buffer = MessageBuffer::new(64);

    buffer.write(1, 1);
    for v in pos {
        buffer.write(32, v.to_bits());
    }

    buffer.write(1, 0); // camera
    buffer.write(1, 1); // ped linkage
    buffer.write(1, 1);
    buffer.write(13, vehicle as u32);
    buffer.write(5, seat as u32);
    buffer.write(1, 0); // appearance

    buffer.bytes()[..buffer.data_length()].to_vec()
}

/// A player payload whose ped node reports no vehicle.
pub fn player_payload_on_foot(pos: [f32; 3]) -> Vec<u8> {
    let mut buffer = MessageBuffer::new(64);

    buffer.write(1, 1);
    for v in pos {
        buffer.write(32, v.to_bits());
    }

    buffer.write(1, 0); // camera
    buffer.write(1, 1); // ped linkage
    buffer.write(1, 0); // not in a vehicle
    buffer.write(1, 0); // appearance

    buffer.bytes()[..buffer.data_length()].to_vec()
}

/// Builds `netClones` frames record by record.
pub struct CloneFrameBuilder {
    buffer: MessageBuffer,
}

impl Default for CloneFrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CloneFrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: MessageBuffer::new(8192),
        }
    }

    pub fn timestamp(mut self, ts: u32) -> Self {
        self.buffer.write(3, 5);
        self.buffer.write(32, ts);
        self
    }

    pub fn create(mut self, object_id: u16, entity_type: EntityType, payload: &[u8]) -> Self {
        self.buffer.write(3, 1);
        self.buffer.write(13, object_id as u32);
        self.buffer.write(4, entity_type.to_wire() as u32);
        self.buffer.write(12, payload.len() as u32);
        self.buffer.write_bits(payload, payload.len() * 8);
        self
    }

    pub fn sync(mut self, object_id: u16, payload: &[u8]) -> Self {
        self.buffer.write(3, 2);
        self.buffer.write(13, object_id as u32);
        self.buffer.write(12, payload.len() as u32);
        self.buffer.write_bits(payload, payload.len() * 8);
        self
    }

    pub fn remove(mut self, object_id: u16) -> Self {
        self.buffer.write(3, 3);
        self.buffer.write(13, object_id as u32);
        self
    }

    pub fn takeover(mut self, target_net_id: u16, object_id: u16) -> Self {
        self.buffer.write(3, 4);
        self.buffer.write(16, target_net_id as u32);
        self.buffer.write(13, object_id as u32);
        self
    }

    pub fn build(self) -> Vec<u8> {
        build_ingress_frame(NET_CLONES, self.buffer)
    }
}

/// Builds `netAcks` frames.
pub struct AckFrameBuilder {
    buffer: MessageBuffer,
}

impl Default for AckFrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AckFrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: MessageBuffer::new(1024),
        }
    }

    pub fn create_ack(mut self, object_id: u16) -> Self {
        self.buffer.write(3, 1);
        self.buffer.write(13, object_id as u32);
        self
    }

    pub fn remove_ack(mut self, object_id: u16) -> Self {
        self.buffer.write(3, 3);
        self.buffer.write(13, object_id as u32);
        self
    }

    pub fn build(self) -> Vec<u8> {
        build_ingress_frame(NET_ACKS, self.buffer)
    }
}

fn build_ingress_frame(frame_type: u32, mut buffer: MessageBuffer) -> Vec<u8> {
    buffer.write(3, 7);

    let compressed = codec::compress_block(&buffer.bytes()[..buffer.data_length()]);

    let mut frame = ByteBuffer::new();
    frame.write_u32(frame_type);
    frame.write_bytes(&compressed);
    frame.into_bytes()
}

/// Split an outbound frame into (msg_type, frame_index, bit payload).
pub fn decode_outbound_frame(packet: &[u8]) -> (u32, u64, Vec<u8>) {
    let mut reader = ByteBuffer::from_bytes(packet);
    let msg_type = reader.read_u32().unwrap();
    let frame_index = reader.read_u64().unwrap();

    let mut scratch = vec![0u8; crate::protocol::INGRESS_SCRATCH_SIZE];
    let len = codec::decompress_block(reader.remaining_bytes(), &mut scratch).unwrap();
    scratch.truncate(len);

    (msg_type, frame_index, scratch)
}

/// One parsed record from a clone or ack bit stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRecord {
    Time(u64),
    Create {
        object_id: u16,
        entity_type: u8,
        owner_net_id: u16,
        timestamp: u32,
    },
    Sync {
        object_id: u16,
        owner_net_id: u16,
        timestamp: u32,
    },
    Remove(u16),
    CreateAck(u16),
    SyncAck(u16),
    RemoveAck(u16),
    TimeAck(u32),
}

/// Parse an outbound `msgPackedClones` payload.
pub fn parse_clone_records(payload: &[u8]) -> Vec<WireRecord> {
    let mut buffer = MessageBuffer::from_bytes(payload);
    let mut records = Vec::new();

    while let Some(tag) = buffer.read(3) {
        match tag {
            1 | 2 => {
                let object_id = buffer.read(13).unwrap() as u16;
                let owner_net_id = buffer.read(16).unwrap() as u16;
                let entity_type = if tag == 1 {
                    buffer.read(4).unwrap() as u8
                } else {
                    0
                };
                let timestamp = buffer.read(32).unwrap();
                let len = buffer.read(12).unwrap() as usize;
                let mut bits = vec![0u8; len];
                assert!(buffer.read_bits(&mut bits, len * 8));

                records.push(if tag == 1 {
                    WireRecord::Create {
                        object_id,
                        entity_type,
                        owner_net_id,
                        timestamp,
                    }
                } else {
                    WireRecord::Sync {
                        object_id,
                        owner_net_id,
                        timestamp,
                    }
                });
            }
            3 => records.push(WireRecord::Remove(buffer.read(13).unwrap() as u16)),
            5 => {
                let lo = buffer.read(32).unwrap() as u64;
                let hi = buffer.read(32).unwrap() as u64;
                records.push(WireRecord::Time(hi << 32 | lo));
            }
            7 => break,
            other => panic!("unexpected clone tag {other}"),
        }
    }

    records
}

/// Parse an outbound `msgPackedAcks` payload.
pub fn parse_ack_records(payload: &[u8]) -> Vec<WireRecord> {
    let mut buffer = MessageBuffer::from_bytes(payload);
    let mut records = Vec::new();

    while let Some(tag) = buffer.read(3) {
        match tag {
            1 => records.push(WireRecord::CreateAck(buffer.read(13).unwrap() as u16)),
            2 => records.push(WireRecord::SyncAck(buffer.read(13).unwrap() as u16)),
            3 => records.push(WireRecord::RemoveAck(buffer.read(13).unwrap() as u16)),
            5 => records.push(WireRecord::TimeAck(buffer.read(32).unwrap())),
            7 => break,
            other => panic!("unexpected ack tag {other}"),
        }
    }

    records
}

/// Tick and wait for every client's worker to finish.
pub fn run_tick(state: &Arc<ServerGameState>, registry: &TestRegistry) {
    state.tick(registry);

    let deadline = Instant::now() + Duration::from_secs(2);

    loop {
        let busy = registry.clients().iter().any(|client| {
            let as_dyn: Arc<dyn Client> = client.clone();
            state.client_data(&as_dyn).data.lock().syncing
        });

        if !busy {
            break;
        }

        assert!(Instant::now() < deadline, "tick workers did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// `gameStateAck` wire payload.
pub fn game_state_ack_payload(frame_index: u64, ignore: &[u16]) -> Vec<u8> {
    let mut buffer = ByteBuffer::new();
    buffer.write_u64(frame_index);
    buffer.write_u8(ignore.len() as u8);
    for &id in ignore {
        buffer.write_u16(id);
    }
    buffer.into_bytes()
}
