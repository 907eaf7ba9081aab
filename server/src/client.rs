use std::sync::Arc;

/// Delivery mode for an outbound packet. The transport decides what these
/// mean on the wire; the engine only picks one per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFlags {
    Unreliable,
    Reliable,
    /// Reliable, and replayed to clients that connect later.
    ReliableReplayed,
}

/// A connected remote client as seen by the replication engine.
///
/// The transport and session layers own the real connection; the engine
/// only needs identity, slot assignment, RTT measurements and a way to
/// hand packets down.
pub trait Client: Send + Sync {
    /// Stable network id, unique per session.
    fn net_id(&self) -> u16;

    /// Dense slot index, or `None` while the client has no slot.
    /// Slot indices are reused after a drop.
    fn slot_id(&self) -> Option<u8>;

    fn name(&self) -> &str;

    /// Smoothed round-trip time in milliseconds.
    fn ping_ms(&self) -> u32;

    /// RTT variance in milliseconds.
    fn ping_variance_ms(&self) -> u32;

    fn send_packet(&self, channel: u8, payload: &[u8], flags: PacketFlags);
}

/// Enumeration and lookup over connected clients.
pub trait ClientRegistry: Send + Sync {
    fn for_each_client(&self, f: &mut dyn FnMut(&Arc<dyn Client>));

    fn client_by_net_id(&self, net_id: u16) -> Option<Arc<dyn Client>>;
}

/// Channel used for all replication traffic.
pub const SYNC_CHANNEL: u8 = 1;
