//! LZ4 frame codec.
//!
//! Outbound frames are `msg_type: u32 | frame_index: u64 | lz4 payload`;
//! inbound frames carry `msg_type: u32 | lz4 payload` and are only accepted
//! for the two ingress types. Decompression lands in a thread-local scratch
//! and is copied out before returning.

use gamestate_serde::{ByteBuffer, MessageBuffer};

use crate::client::{Client, PacketFlags, SYNC_CHANNEL};
use crate::protocol::{FLUSH_THRESHOLD, INGRESS_SCRATCH_SIZE, NET_ACKS, NET_CLONES};

cfg_if! {
    if #[cfg(feature = "lz4_support")] {
        pub(crate) fn compress_block(input: &[u8]) -> Vec<u8> {
            lz4_flex::block::compress(input)
        }

        pub(crate) fn compress_bound(len: usize) -> usize {
            lz4_flex::block::get_maximum_output_size(len)
        }

        pub(crate) fn decompress_block(input: &[u8], scratch: &mut [u8]) -> Option<usize> {
            lz4_flex::block::decompress_into(input, scratch).ok()
        }
    } else {
        pub(crate) fn compress_block(input: &[u8]) -> Vec<u8> {
            input.to_vec()
        }

        pub(crate) fn compress_bound(len: usize) -> usize {
            len
        }

        pub(crate) fn decompress_block(input: &[u8], scratch: &mut [u8]) -> Option<usize> {
            if input.len() > scratch.len() {
                return None;
            }
            scratch[..input.len()].copy_from_slice(input);
            Some(input.len())
        }
    }
}

/// Terminate, compress and send whatever the bit buffer holds, then rewind
/// it for the next records. A no-op on an empty buffer.
pub fn flush_buffer(
    buffer: &mut MessageBuffer,
    msg_type: u32,
    frame_index: u64,
    client: &dyn Client,
) {
    if buffer.data_length() == 0 {
        return;
    }

    buffer.write(3, 7);

    let payload = compress_block(&buffer.bytes()[..buffer.data_length()]);

    let mut frame = ByteBuffer::new();
    frame.write_u32(msg_type);
    frame.write_u64(frame_index);
    frame.write_bytes(&payload);

    log::debug!(
        "flush_buffer: sending {} bytes to {}",
        frame.as_bytes().len(),
        client.net_id()
    );

    client.send_packet(SYNC_CHANNEL, frame.as_bytes(), PacketFlags::Unreliable);

    buffer.set_current_bit(0);
}

/// Flush eagerly once the compression upper bound for the pending payload
/// would no longer fit an MTU-safe packet.
pub fn maybe_flush_buffer(
    buffer: &mut MessageBuffer,
    msg_type: u32,
    frame_index: u64,
    client: &dyn Client,
) {
    if compress_bound(buffer.data_length()) >= FLUSH_THRESHOLD {
        flush_buffer(buffer, msg_type, frame_index, client);
    }
}

/// Validate and decompress an inbound frame. The frame type comes back
/// either way so callers can log what they dropped.
pub fn decode_ingress_frame(packet: &[u8]) -> (Option<Vec<u8>>, u32) {
    let mut reader = ByteBuffer::from_bytes(packet);

    let Ok(frame_type) = reader.read_u32() else {
        return (None, 0);
    };

    if frame_type != NET_CLONES && frame_type != NET_ACKS {
        return (None, frame_type);
    }

    thread_local! {
        static SCRATCH: std::cell::RefCell<Vec<u8>> =
            std::cell::RefCell::new(vec![0u8; INGRESS_SCRATCH_SIZE]);
    }

    let payload = SCRATCH.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        decompress_block(reader.remaining_bytes(), &mut scratch)
            .map(|len| scratch[..len].to_vec())
    });

    (payload, frame_type)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::MSG_PACKED_CLONES;

    #[derive(Default)]
    struct CaptureClient {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Client for CaptureClient {
        fn net_id(&self) -> u16 {
            1
        }
        fn slot_id(&self) -> Option<u8> {
            Some(0)
        }
        fn name(&self) -> &str {
            "capture"
        }
        fn ping_ms(&self) -> u32 {
            0
        }
        fn ping_variance_ms(&self) -> u32 {
            0
        }
        fn send_packet(&self, _channel: u8, payload: &[u8], _flags: PacketFlags) {
            self.sent.lock().unwrap().push(payload.to_vec());
        }
    }

    #[test]
    fn empty_buffer_does_not_flush() {
        let client = CaptureClient::default();
        let mut buffer = MessageBuffer::new(64);

        flush_buffer(&mut buffer, MSG_PACKED_CLONES, 1, &client);

        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn flushed_frame_round_trips_through_ingress_path() {
        let client = CaptureClient::default();
        let mut buffer = MessageBuffer::new(64);
        buffer.write(3, 5);
        buffer.write(32, 0x1234_5678);

        flush_buffer(&mut buffer, NET_CLONES, 42, &client);
        assert_eq!(buffer.current_bit(), 0);

        let sent = client.sent.lock().unwrap();
        let frame = &sent[0];

        let mut reader = ByteBuffer::from_bytes(frame);
        assert_eq!(reader.read_u32().unwrap(), NET_CLONES);
        assert_eq!(reader.read_u64().unwrap(), 42);

        // strip the frame index to mimic the client-side frame shape
        let mut inbound = ByteBuffer::new();
        inbound.write_u32(NET_CLONES);
        inbound.write_bytes(reader.remaining_bytes());

        let (payload, frame_type) = decode_ingress_frame(inbound.as_bytes());
        assert_eq!(frame_type, NET_CLONES);

        let mut bits = MessageBuffer::from_bytes(&payload.unwrap());
        assert_eq!(bits.read(3), Some(5));
        assert_eq!(bits.read(32), Some(0x1234_5678));
        assert_eq!(bits.read(3), Some(7));
    }

    #[test]
    fn unknown_frame_types_are_rejected() {
        let mut frame = ByteBuffer::new();
        frame.write_u32(0xDEAD_0000);
        frame.write_bytes(&[1, 2, 3]);

        let (payload, frame_type) = decode_ingress_frame(frame.as_bytes());
        assert!(payload.is_none());
        assert_eq!(frame_type, 0xDEAD_0000);
    }

    #[cfg(feature = "lz4_support")]
    #[test]
    fn corrupt_payload_is_dropped() {
        let mut frame = ByteBuffer::new();
        frame.write_u32(NET_ACKS);
        frame.write_bytes(&[0xFF; 32]);

        let (payload, _) = decode_ingress_frame(frame.as_bytes());
        assert!(payload.is_none());
    }

    #[test]
    fn maybe_flush_honors_the_threshold() {
        let client = CaptureClient::default();
        let mut buffer = MessageBuffer::new(4096);

        // stay under the bound: nothing goes out
        for _ in 0..16 {
            buffer.write(32, 0xAAAA_AAAA);
        }
        maybe_flush_buffer(&mut buffer, MSG_PACKED_CLONES, 0, &client);
        assert!(client.sent.lock().unwrap().is_empty());

        // reaching the threshold flushes
        while compress_bound(buffer.data_length()) < FLUSH_THRESHOLD {
            buffer.write(32, 0xAAAA_AAAA);
        }
        maybe_flush_buffer(&mut buffer, MSG_PACKED_CLONES, 0, &client);
        assert_eq!(client.sent.lock().unwrap().len(), 1);
    }
}
