/// Hooks surfaced to the scripting layer.
///
/// Implementations are expected to dispatch onto their own script thread;
/// the engine calls these with no locks held.
pub trait EventSink: Send + Sync {
    /// A clone create from a client produced a new entity.
    fn entity_created(&self, script_handle: u32);

    /// An entity is about to be reaped. Fired before the destructive
    /// mutation runs on the net thread.
    fn entity_removed(&self, script_handle: u32);
}

/// Sink that drops every event.
pub struct NullEvents;

impl EventSink for NullEvents {
    fn entity_created(&self, _script_handle: u32) {}

    fn entity_removed(&self, _script_handle: u32) {}
}
