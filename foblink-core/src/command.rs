//! Command payloads: `[1-byte code][0..=79 bytes data]`, carried inside a
//! sealed frame.

use crate::frame::MAX_PAYLOAD;

/// Largest command data field under the default payload cap.
pub const MAX_COMMAND_DATA: usize = MAX_PAYLOAD - 1;

/// Command byte values. A closed set; anything else is rejected by the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    /// Host -> unpaired fob: begin a pairing attempt.
    PairRequest = 0x50,
    /// Host -> fob: candidate PIN for the running attempt.
    SubmitPin = 0x4D,
    /// Fob -> paired fob: prove the PIN, request a pairing grant. The grant
    /// comes back in the ack data.
    PairDelegate = 0x47,
    /// Host -> car: signed feature package, chunked as
    /// `[more u8][len u8][bytes]`.
    EnableFeature = 0x45,
    /// Fob -> car: session-bound unlock token.
    Unlock = 0x55,
    /// Host -> car: start with a given feature.
    Start = 0x53,
    /// Positive response; data is handler-defined.
    Ack = 0x41,
    /// Negative response; data is a big-endian status code.
    Nack = 0xAA,
}

impl CommandCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x50 => Some(Self::PairRequest),
            0x4D => Some(Self::SubmitPin),
            0x47 => Some(Self::PairDelegate),
            0x45 => Some(Self::EnableFeature),
            0x55 => Some(Self::Unlock),
            0x53 => Some(Self::Start),
            0x41 => Some(Self::Ack),
            0xAA => Some(Self::Nack),
            _ => None,
        }
    }
}

/// One request or response; lives for a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Raw code byte. Kept raw so unknown codes reach the dispatcher and
    /// come back as a status instead of being dropped silently.
    pub code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty command payload")]
    Empty,
    #[error("command data of {0} bytes exceeds the payload cap")]
    Oversized(usize),
}

impl Command {
    pub fn new(code: CommandCode, data: Vec<u8>) -> Self {
        Self {
            code: code as u8,
            data,
        }
    }

    /// Serialize to a plaintext command payload.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        if self.data.len() > MAX_COMMAND_DATA {
            return Err(CommandError::Oversized(self.data.len()));
        }
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.code);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Parse a decrypted command payload.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let (&code, data) = payload.split_first().ok_or(CommandError::Empty)?;
        Ok(Self {
            code,
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cmd = Command::new(CommandCode::Unlock, vec![1, 2, 3]);
        let bytes = cmd.encode().unwrap();
        assert_eq!(bytes[0], 0x55);
        assert_eq!(Command::parse(&bytes).unwrap(), cmd);
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(Command::parse(&[]), Err(CommandError::Empty)));
    }

    #[test]
    fn oversized_data_rejected() {
        let cmd = Command::new(CommandCode::Start, vec![0; MAX_COMMAND_DATA + 1]);
        assert!(matches!(cmd.encode(), Err(CommandError::Oversized(_))));
    }

    #[test]
    fn code_bytes_are_stable() {
        // Wire contract: these values are fixed.
        assert_eq!(CommandCode::PairRequest as u8, 0x50);
        assert_eq!(CommandCode::SubmitPin as u8, 0x4D);
        assert_eq!(CommandCode::PairDelegate as u8, 0x47);
        assert_eq!(CommandCode::EnableFeature as u8, 0x45);
        assert_eq!(CommandCode::Unlock as u8, 0x55);
        assert_eq!(CommandCode::Start as u8, 0x53);
        assert_eq!(CommandCode::Ack as u8, 0x41);
        assert_eq!(CommandCode::Nack as u8, 0xAA);
        for byte in [0x50, 0x4D, 0x47, 0x45, 0x55, 0x53, 0x41, 0xAA] {
            assert_eq!(CommandCode::from_byte(byte).map(|c| c as u8), Some(byte));
        }
        assert_eq!(CommandCode::from_byte(0x00), None);
    }
}
