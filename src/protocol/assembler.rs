//! Joins notifications into frames
//!
//! Frames longer than one notification (daily data is 55 bytes) arrive in
//! chunks. Chunks are collected while the buffer decodes as incomplete and
//! the declared length has not been exceeded.

use tracing::debug;

use super::{Response, FRAME_START};

/// Bytes after the declared length: start, length and two end markers
const FRAME_OVERHEAD: usize = 4;

#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
}

impl FrameAssembler {
    /// Feeds one notification. Returns `None` while a frame is still being collected.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Response> {
        self.push_at(chunk, None)
    }

    pub fn push_at(&mut self, chunk: &[u8], current_hour: Option<u32>) -> Option<Response> {
        let buffered = !self.pending.is_empty();
        if !buffered && chunk.first() != Some(&FRAME_START) {
            return Some(decode(chunk, current_hour));
        }

        self.pending.extend_from_slice(chunk);
        match decode(&self.pending, current_hour) {
            Response::Incomplete { raw } => {
                if self.can_grow() {
                    debug!("Waiting for more of frame [{}]", hex::encode(&raw));
                    None
                } else {
                    self.pending.clear();
                    Some(Response::Incomplete { raw })
                }
            }
            response => {
                self.pending.clear();
                Some(response)
            }
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    fn can_grow(&self) -> bool {
        match self.pending.get(1) {
            Some(&declared) => self.pending.len() < declared as usize + FRAME_OVERHEAD,
            None => true,
        }
    }
}

fn decode(raw: &[u8], current_hour: Option<u32>) -> Response {
    match current_hour {
        Some(hour) => Response::decode_at(raw, hour),
        None => Response::decode(raw),
    }
}
