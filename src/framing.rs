//! Message framing for the device UART stream.
//!
//! The device sends its log files over a notification characteristic in
//! arbitrarily sized chunks. Each message ends with a single sentinel byte
//! that never appears inside a payload.

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

/// ASCII backspace, written by the firmware after every dumped file.
pub const MESSAGE_SENTINEL: u8 = 0x08;

/// A complete message with the sentinel stripped.
pub type RawMessage = Bytes;

/// Buffers incoming chunks and splits them into sentinel-terminated messages.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffer: BytesMut,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every message it completed, in order.
    /// The unterminated remainder stays buffered for the next call.
    pub fn append(&mut self, chunk: &[u8]) -> Vec<RawMessage> {
        let mut messages = Vec::new();
        if chunk.is_empty() {
            return messages;
        }

        // Only the new bytes can hold a sentinel that was not seen before.
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        loop {
            let Some(offset) = self.buffer[search_from..]
                .iter()
                .position(|&b| b == MESSAGE_SENTINEL)
            else {
                break;
            };
            let end = search_from + offset;
            let message = self.buffer.split_to(end).freeze();
            self.buffer.advance(1);
            trace!(target: "Gateway/Framing", "<-- Reassembled message: {} bytes", message.len());
            messages.push(message);
            search_from = 0;
        }

        messages
    }

    pub fn has_pending_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Terminates a payload with the sentinel, as the firmware does.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    if payload.contains(&MESSAGE_SENTINEL) {
        return Err(anyhow::anyhow!(
            "payload of {} bytes contains the message sentinel",
            payload.len()
        ));
    }
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.extend_from_slice(payload);
    data.push(MESSAGE_SENTINEL);
    Ok(data)
}
