//! Reassembly of a complete logical message from transport fragments.

use bytes::BytesMut;
use uuid::Uuid;

use crate::error::{Result, XatmiError};

use super::fragment::Fragment;
use super::message::Message;

/// Accumulates the fragments of one logical message.
///
/// Fragments may arrive in any order; the message is complete once the
/// received byte ranges cover `[0, complete_size)` with no gaps. A
/// duplicate or overlapping fragment is a protocol error and is rejected
/// outright rather than silently merged.
#[derive(Debug)]
pub struct Complete {
    message_type: u32,
    correlation: Uuid,
    complete_size: u32,
    payload: BytesMut,
    // (offset, len) per accepted fragment; fragments never overlap.
    received: Vec<(u32, u32)>,
}

impl Complete {
    /// Starts reassembly from the first fragment to arrive.
    pub fn new(fragment: Fragment) -> Result<Self> {
        let mut payload = BytesMut::with_capacity(fragment.complete_size as usize);
        payload.resize(fragment.complete_size as usize, 0);

        let mut complete = Self {
            message_type: fragment.message_type,
            correlation: fragment.correlation,
            complete_size: fragment.complete_size,
            payload,
            received: Vec::new(),
        };
        complete.add(fragment)?;
        Ok(complete)
    }

    /// Returns the message type shared by all fragments.
    pub fn message_type(&self) -> u32 {
        self.message_type
    }

    /// Returns the correlation id of the message under reassembly.
    pub fn correlation(&self) -> Uuid {
        self.correlation
    }

    /// Adds one fragment.
    ///
    /// Rejects fragments whose header disagrees with the first fragment,
    /// whose range falls outside the complete payload, or whose range
    /// intersects an already-received fragment.
    pub fn add(&mut self, fragment: Fragment) -> Result<()> {
        if fragment.correlation != self.correlation {
            return Err(XatmiError::Protocol(format!(
                "fragment correlation {} does not match message {}",
                fragment.correlation, self.correlation
            )));
        }
        if fragment.message_type != self.message_type || fragment.complete_size != self.complete_size
        {
            return Err(XatmiError::Protocol(format!(
                "inconsistent fragment header for correlation {}",
                self.correlation
            )));
        }

        let offset = fragment.offset;
        let len = fragment.payload.len() as u32;

        if offset.checked_add(len).map_or(true, |end| end > self.complete_size) {
            return Err(XatmiError::Protocol(format!(
                "fragment range {}..{} exceeds complete size {}",
                offset,
                offset as u64 + len as u64,
                self.complete_size
            )));
        }

        // Zero-length fragments only occur for empty messages.
        if len > 0 || self.complete_size == 0 {
            for &(seen_offset, seen_len) in &self.received {
                let overlaps = offset < seen_offset + seen_len && seen_offset < offset + len;
                let duplicate_empty = len == 0 && seen_len == 0 && offset == seen_offset;
                if overlaps || duplicate_empty {
                    return Err(XatmiError::Protocol(format!(
                        "duplicate or overlapping fragment at offset {} for correlation {}",
                        offset, self.correlation
                    )));
                }
            }
        }

        self.payload[offset as usize..(offset + len) as usize].copy_from_slice(&fragment.payload);
        self.received.push((offset, len));
        Ok(())
    }

    /// Returns true once every byte of `[0, complete_size)` has arrived.
    pub fn is_complete(&self) -> bool {
        if self.complete_size == 0 {
            return !self.received.is_empty();
        }
        let covered: u64 = self.received.iter().map(|&(_, len)| len as u64).sum();
        covered == self.complete_size as u64
    }

    /// Decodes the fully assembled payload into a typed message.
    pub fn into_message(self) -> Result<Message> {
        if !self.is_complete() {
            return Err(XatmiError::Protocol(format!(
                "message {} is not complete",
                self.correlation
            )));
        }
        Message::decode(self.message_type, &self.payload)
    }

    /// The assembled payload bytes, for callers that decode elsewhere.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
