//! Transaction framing.
//!
//! Every message on the wire is a frame: a 4-byte big-endian payload
//! length, one control byte, then the payload. `DONE` closes a logical
//! transaction; `MORE` announces a continuation frame, as used by the
//! streaming verbs. The payload is bounded; an oversized announcement is
//! a protocol violation, not an allocation.

use crate::error::{ClientError, ClientResult};
use converge_core::constants::BUF_SIZE;
use std::io::{Read, Write};

/// Maximum payload of one frame
pub const MAX_PAYLOAD: usize = BUF_SIZE;

/// Frame header size: length prefix plus control byte
pub const HEADER_LEN: usize = 5;

/// Frame control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Final frame of this transaction
    Done,
    /// Further frames follow
    More,
}

impl Control {
    fn to_byte(self) -> u8 {
        match self {
            Control::Done => b'd',
            Control::More => b'm',
        }
    }

    fn from_byte(byte: u8) -> ClientResult<Self> {
        match byte {
            b'd' => Ok(Control::Done),
            b'm' => Ok(Control::More),
            other => Err(ClientError::protocol(format!(
                "unknown control byte {:#04x}",
                other
            ))),
        }
    }
}

/// Writes one frame
pub fn send_transaction<W: Write>(
    writer: &mut W,
    payload: &[u8],
    control: Control,
) -> ClientResult<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ClientError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[4] = control.to_byte();
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame
pub fn receive_transaction<R: Read>(reader: &mut R) -> ClientResult<(Vec<u8>, Control)> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(ClientError::FrameTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    let control = Control::from_byte(header[4])?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((payload, control))
}

/// True when a reply begins with the `BAD:` refusal marker
pub fn bad_reply(payload: &[u8]) -> bool {
    payload.starts_with(b"BAD:")
}

/// True when a reply begins with the `OK:` acknowledgement marker
pub fn ok_reply(payload: &[u8]) -> bool {
    payload.starts_with(b"OK:")
}

/// The generic server refusal string
pub const FAILED_REPLY: &[u8] = b"BAD: Unspecified server refusal (see verbose server output)";

/// Marker a server streams when the source changed mid-copy. Kept split
/// so the marker cannot be recognized inside file content.
pub fn changed_marker() -> Vec<u8> {
    let mut marker = b"BAD: File changed ".to_vec();
    marker.extend_from_slice(b"while copying");
    marker
}
