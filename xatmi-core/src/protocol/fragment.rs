//! Fixed-capacity transport fragment for the xatmi protocol.
//!
//! A logical message of arbitrary size travels as one or more fragments,
//! each carrying the message type, the correlation id, the size of the
//! complete payload, and the byte offset its own payload occupies within
//! it. The receiver reassembles fragments in any order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::constants::*;

/// A single transport fragment.
///
/// No fragment-count field travels on the wire: the count is implied by
/// `complete_size` and [`MAX_FRAGMENT_PAYLOAD`], and the receiver treats
/// the message as complete once the received offsets cover the whole
/// payload.
///
/// Wire layout:
/// - 4-byte length field (little-endian, everything after itself)
/// - 4-byte message type
/// - 16-byte correlation id
/// - 4-byte complete payload size
/// - 4-byte payload offset
/// - payload (at most [`MAX_FRAGMENT_PAYLOAD`] bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Message type shared by every fragment of one logical message.
    pub message_type: u32,
    /// Correlation id linking the fragment to its logical message.
    pub correlation: Uuid,
    /// Size of the complete reassembled payload.
    pub complete_size: u32,
    /// Offset of this fragment's payload within the complete payload.
    pub offset: u32,
    /// The payload slice this fragment carries.
    pub payload: Bytes,
}

impl Fragment {
    /// Splits a payload into transport fragments.
    ///
    /// Produces `ceil(len / MAX_FRAGMENT_PAYLOAD)` fragments; an empty
    /// payload still yields a single empty fragment so the receiver can
    /// complete the message.
    pub fn split(message_type: u32, correlation: Uuid, payload: Bytes) -> Vec<Fragment> {
        let complete_size = payload.len() as u32;

        if payload.is_empty() {
            return vec![Fragment {
                message_type,
                correlation,
                complete_size,
                offset: 0,
                payload,
            }];
        }

        payload
            .chunks(MAX_FRAGMENT_PAYLOAD)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                message_type,
                correlation,
                complete_size,
                offset: (index * MAX_FRAGMENT_PAYLOAD) as u32,
                payload: Bytes::copy_from_slice(chunk),
            })
            .collect()
    }

    /// Size of this fragment on the wire, including the length field.
    pub fn wire_size(&self) -> usize {
        SIZE_OF_FRAGMENT_LENGTH_FIELD + FRAGMENT_HEADER_SIZE + self.payload.len()
    }

    /// Writes the fragment to the destination buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u32_le((FRAGMENT_HEADER_SIZE + self.payload.len()) as u32);
        dst.put_u32_le(self.message_type);
        dst.put_slice(self.correlation.as_bytes());
        dst.put_u32_le(self.complete_size);
        dst.put_u32_le(self.offset);
        dst.put_slice(&self.payload);
    }

    /// Reads one fragment from the buffer.
    ///
    /// Returns `None` if the buffer does not yet hold a complete fragment.
    pub fn read_from(src: &mut BytesMut) -> Option<Self> {
        if src.len() < SIZE_OF_FRAGMENT_LENGTH_FIELD {
            return None;
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < FRAGMENT_HEADER_SIZE {
            return None;
        }
        if src.len() < SIZE_OF_FRAGMENT_LENGTH_FIELD + length {
            return None;
        }

        src.advance(SIZE_OF_FRAGMENT_LENGTH_FIELD);
        let message_type = src.get_u32_le();
        let mut correlation_bytes = [0u8; SIZE_OF_CORRELATION_FIELD];
        src.copy_to_slice(&mut correlation_bytes);
        let correlation = Uuid::from_bytes(correlation_bytes);
        let complete_size = src.get_u32_le();
        let offset = src.get_u32_le();
        let payload = src.split_to(length - FRAGMENT_HEADER_SIZE).freeze();

        Some(Self {
            message_type,
            correlation,
            complete_size,
            offset,
            payload,
        })
    }
}
