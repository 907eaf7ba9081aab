//! # Gamestate Serde
//! Bit-level and byte-level buffers shared by the replication engine's
//! wire paths.

mod byte_buffer;
mod error;
mod message_buffer;

pub use byte_buffer::ByteBuffer;
pub use error::BufferError;
pub use message_buffer::MessageBuffer;
