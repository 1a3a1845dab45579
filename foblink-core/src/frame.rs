//! Framing: 1-byte length prefix + payload + CRC-16/CCITT-FALSE (big-endian).
//! The length byte counts payload plus the two CRC bytes, so a frame is at
//! most `max_payload + 3` bytes on the wire.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::link::{Link, LinkError};

/// Raw acknowledgement byte, sent after an accepted frame and during
/// flow-controlled transfers.
pub const FRAME_ACK: u8 = 0x41;

/// Default payload cap. Deployments with larger handshake material pass a
/// larger cap explicitly.
pub const MAX_PAYLOAD: usize = 80;

const CRC_LEN: usize = 2;

/// Framing failure. Always fatal to the current frame; connection policy is
/// the caller's.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("crc mismatch (expected {expected:#06x}, got {actual:#06x})")]
    CrcMismatch { expected: u16, actual: u16 },
    #[error("frame length {length} exceeds cap {max}")]
    TooLong { length: usize, max: usize },
    #[error("frame length {length} below minimum")]
    TooShort { length: usize },
    #[error("timed out waiting for frame bytes")]
    Timeout,
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("link closed")]
    Closed,
    #[error("flow control violation (got {byte:#04x})")]
    FlowViolation { byte: u8 },
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Optional byte-level flow control: the receiver returns [`FRAME_ACK`] after
/// every `ack_every` frame bytes, and the sender blocks on it before sending
/// more. Disabled by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControl {
    pub ack_every: Option<NonZeroUsize>,
}

impl FlowControl {
    /// Ack after every `n` bytes (the deployed interval is 15).
    pub fn every(n: usize) -> Self {
        Self {
            ack_every: NonZeroUsize::new(n),
        }
    }
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xor-out.
pub fn crc16(payload: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in payload {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Encode one frame: `[len][payload][crc_hi][crc_lo]`.
pub fn encode_frame(payload: &[u8], max_payload: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::TooShort { length: 0 });
    }
    // The length byte also caps the cap itself.
    if payload.len() > max_payload || payload.len() + CRC_LEN > u8::MAX as usize {
        return Err(FrameError::TooLong {
            length: payload.len(),
            max: max_payload.min(u8::MAX as usize - CRC_LEN),
        });
    }
    let mut out = Vec::with_capacity(1 + payload.len() + CRC_LEN);
    out.push((payload.len() + CRC_LEN) as u8);
    out.extend_from_slice(payload);
    let crc = crc16(payload);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

fn map_link_err(e: LinkError, mid_frame: bool) -> FrameError {
    match e {
        LinkError::Timeout(_) => FrameError::Timeout,
        LinkError::Closed if mid_frame => FrameError::Truncated,
        LinkError::Closed => FrameError::Closed,
        LinkError::Io(m) => FrameError::Transport(m),
    }
}

/// Fill `buf`, retrying partial reads until `deadline`. `since_ack` carries
/// the flow-control byte count across the stages of one frame.
fn read_exact_flow(
    link: &mut dyn Link,
    buf: &mut [u8],
    deadline: Instant,
    flow: FlowControl,
    since_ack: &mut usize,
    mid_frame: bool,
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let now = Instant::now();
        if now >= deadline {
            return Err(FrameError::Timeout);
        }
        let want = match flow.ack_every {
            Some(n) => (n.get() - *since_ack).min(buf.len() - filled),
            None => buf.len() - filled,
        };
        let n = link
            .read(&mut buf[filled..filled + want], deadline - now)
            .map_err(|e| map_link_err(e, mid_frame || filled > 0))?;
        filled += n;
        if let Some(interval) = flow.ack_every {
            *since_ack += n;
            if *since_ack == interval.get() {
                link.write_all(&[FRAME_ACK])
                    .map_err(|e| map_link_err(e, true))?;
                *since_ack = 0;
            }
        }
    }
    Ok(())
}

/// Read exactly one frame, verify its CRC and return the payload.
///
/// The length byte is validated before any payload byte is read, so an
/// oversized claim is rejected without draining the stream. Partial arrival
/// is tolerated up to `timeout`.
pub fn read_frame(
    link: &mut dyn Link,
    max_payload: usize,
    flow: FlowControl,
    timeout: Duration,
) -> Result<Vec<u8>, FrameError> {
    let deadline = Instant::now() + timeout;
    let mut since_ack = 0usize;

    let mut len_byte = [0u8; 1];
    read_exact_flow(link, &mut len_byte, deadline, flow, &mut since_ack, false)?;
    let length = len_byte[0] as usize;
    if length < CRC_LEN + 1 {
        return Err(FrameError::TooShort { length });
    }
    if length > max_payload + CRC_LEN {
        return Err(FrameError::TooLong {
            length,
            max: max_payload + CRC_LEN,
        });
    }

    let mut payload = vec![0u8; length - CRC_LEN];
    read_exact_flow(link, &mut payload, deadline, flow, &mut since_ack, true)?;

    let mut crc_bytes = [0u8; CRC_LEN];
    read_exact_flow(link, &mut crc_bytes, deadline, flow, &mut since_ack, true)?;
    let expected = u16::from_be_bytes(crc_bytes);
    let actual = crc16(&payload);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }
    Ok(payload)
}

/// Encode and write one frame. With flow control enabled, blocks on the
/// peer's ack byte after every `ack_every` bytes; any other byte in ack
/// position is a protocol violation.
pub fn write_frame(
    link: &mut dyn Link,
    payload: &[u8],
    max_payload: usize,
    flow: FlowControl,
    timeout: Duration,
) -> Result<(), FrameError> {
    let encoded = encode_frame(payload, max_payload)?;
    let Some(interval) = flow.ack_every else {
        return link
            .write_all(&encoded)
            .map_err(|e| map_link_err(e, false));
    };
    let deadline = Instant::now() + timeout;
    for chunk in encoded.chunks(interval.get()) {
        link.write_all(chunk).map_err(|e| map_link_err(e, false))?;
        // Acks come back only for full intervals; a trailing partial chunk
        // ends the frame without one.
        if chunk.len() == interval.get() {
            expect_ack(link, deadline)?;
        }
    }
    Ok(())
}

/// Block for the single post-frame (or flow-control) ack byte.
pub fn expect_ack(link: &mut dyn Link, deadline: Instant) -> Result<(), FrameError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(FrameError::Timeout);
    }
    let mut byte = [0u8; 1];
    let mut filled = 0;
    while filled < 1 {
        let now = Instant::now();
        if now >= deadline {
            return Err(FrameError::Timeout);
        }
        filled = link
            .read(&mut byte, deadline - now)
            .map_err(|e| map_link_err(e, false))?;
    }
    if byte[0] != FRAME_ACK {
        return Err(FrameError::FlowViolation { byte: byte[0] });
    }
    Ok(())
}

/// Send the single post-frame ack byte.
pub fn send_ack(link: &mut dyn Link) -> Result<(), FrameError> {
    link.write_all(&[FRAME_ACK])
        .map_err(|e| map_link_err(e, false))
}
