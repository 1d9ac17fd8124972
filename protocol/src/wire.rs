//! Request header framing (spec §4.5, §6.1).
//!
//! ```txt
//! offset  size  field
//! 0       1     version (0x11)
//! 1       1     action ('F'|'D'|'s'|'q')
//! 2       1     table_id
//! 3       1     index_id
//! 4       4     key_length (big-endian)
//! 8       N     key bytes
//! ```

use byteorder::{BigEndian, ByteOrder};
use common::err::{CResult, CacheError};

pub const PROTOCOL_VERSION: u8 = 0x11;
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Fetch,
    DescribeSchema,
    Stats,
    Quit,
}

impl Action {
    pub fn from_byte(b: u8) -> CResult<Self> {
        match b {
            b'F' => Ok(Action::Fetch),
            b'D' => Ok(Action::DescribeSchema),
            b's' => Ok(Action::Stats),
            b'q' => Ok(Action::Quit),
            other => Err(CacheError::Protocol(format!("unknown action byte {other:#x}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub action: Action,
    pub table_id: u8,
    pub index_id: u8,
    pub key_len: u32,
}

/// Parses an 8-byte request header. Rejects any version byte other than
/// `PROTOCOL_VERSION` or an unrecognized action byte as a `CacheError::
/// Protocol`, which the connection engine treats as a close-the-connection
/// condition (spec §7).
pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> CResult<RequestHeader> {
    let version = buf[0];
    if version != PROTOCOL_VERSION {
        return Err(CacheError::Protocol(format!(
            "bad version byte {version:#x}, expected {PROTOCOL_VERSION:#x}"
        )));
    }
    let action = Action::from_byte(buf[1])?;
    let table_id = buf[2];
    let index_id = buf[3];
    let key_len = BigEndian::read_u32(&buf[4..8]);
    Ok(RequestHeader {
        action,
        table_id,
        index_id,
        key_len,
    })
}

/// Encodes the 4-byte big-endian response length prefix.
pub fn encode_length_prefix(len: u32) -> [u8; 4] {
    let mut out = [0u8; 4];
    BigEndian::write_u32(&mut out, len);
    out
}
