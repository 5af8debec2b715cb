//! P3 container used for bundled audio cues.
//!
//! A file is a sequence of packets, each `type:u8, reserved:u8,
//! payload_len:u16 (big-endian), payload`. Every payload is one Opus frame
//! at 16kHz mono, 60ms.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;

/// Sample rate of every P3 payload.
pub const P3_SAMPLE_RATE: u32 = 16000;

const HEADER_LEN: usize = 4;

/// Split a P3 blob into its Opus frames. A truncated trailing packet is
/// dropped.
pub fn parse(data: &Bytes) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + HEADER_LEN <= data.len() {
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let start = offset + HEADER_LEN;
        let end = start + len;
        if end > data.len() {
            log::warn!(
                "Truncated P3 packet at offset {}: need {} bytes, have {}",
                offset,
                len,
                data.len() - start
            );
            break;
        }
        frames.push(data.slice(start..end));
        offset = end;
    }
    frames
}

pub fn load(path: &Path) -> Result<Bytes> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Bytes::from(data))
}
