//! Binary framing for byte streams: fixed-width little-endian datagrams.
//!
//! Every datagram is a 1-byte tag followed by a 16-byte host id. Refresh adds a 2-byte TTL,
//! a 16-byte address token and a 16-byte setting id; RefreshFull adds a 2-byte count and
//! that many 24-byte records (virtual-host id, priority, weight). Private messages carry the
//! target id, a 4-byte length and the payload.

use crate::identity::{address_token, token_address, HostId, SettingId, VirtualHostId};
use crate::protocol::{
    validate_assignments, Announce, Assignments, InvalidWeight, PresenceMessage,
    VirtualHostWeight,
};

pub const TAG_HELLO: u8 = 1;
pub const TAG_REFRESH: u8 = 2;
pub const TAG_REFRESH_FULL: u8 = 3;
pub const TAG_NEED_REFRESH_FULL: u8 = 4;
pub const TAG_SHUTDOWN: u8 = 5;
pub const TAG_MESSAGE: u8 = 6;

const ID_SIZE: usize = 16;
const HEADER_SIZE: usize = 1 + ID_SIZE;
const REFRESH_SIZE: usize = HEADER_SIZE + 2 + ID_SIZE + ID_SIZE;
const RECORD_SIZE: usize = ID_SIZE + 4 + 4;
const LEN_SIZE: usize = 4;
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// One unit on a byte stream: a presence message or a private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Presence(PresenceMessage),
    Message { target: HostId, payload: Vec<u8> },
}

/// Encode a datagram. Addresses that are already 32-hex tokens are sent as-is,
/// any other address is hashed into a token.
pub fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, BinaryFrameError> {
    let mut out = Vec::with_capacity(REFRESH_SIZE);
    match datagram {
        Datagram::Presence(PresenceMessage::Hello) => {
            out.push(TAG_HELLO);
            out.extend_from_slice(HostId::nil().as_bytes());
        }
        Datagram::Presence(PresenceMessage::NeedRefreshFull(id)) => {
            out.push(TAG_NEED_REFRESH_FULL);
            out.extend_from_slice(id.as_bytes());
        }
        Datagram::Presence(PresenceMessage::Shutdown(id)) => {
            out.push(TAG_SHUTDOWN);
            out.extend_from_slice(id.as_bytes());
        }
        Datagram::Presence(PresenceMessage::Refresh(a)) => {
            out.push(TAG_REFRESH);
            put_announce(&mut out, a);
        }
        Datagram::Presence(PresenceMessage::RefreshFull(a, assignments)) => {
            let count = u16::try_from(assignments.len())
                .map_err(|_| BinaryFrameError::TooManyRecords(assignments.len()))?;
            out.reserve(2 + assignments.len() * RECORD_SIZE);
            out.push(TAG_REFRESH_FULL);
            put_announce(&mut out, a);
            out.extend_from_slice(&count.to_le_bytes());
            for (vhost, w) in assignments {
                out.extend_from_slice(vhost.as_bytes());
                out.extend_from_slice(&w.priority.to_le_bytes());
                out.extend_from_slice(&w.weight.to_le_bytes());
            }
        }
        Datagram::Message { target, payload } => {
            let len = u32::try_from(payload.len())
                .ok()
                .filter(|l| *l <= MAX_PAYLOAD_LEN)
                .ok_or(BinaryFrameError::TooLarge)?;
            out.reserve(LEN_SIZE + payload.len());
            out.push(TAG_MESSAGE);
            out.extend_from_slice(target.as_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(payload);
        }
    }
    Ok(out)
}

fn put_announce(out: &mut Vec<u8>, a: &Announce) {
    out.extend_from_slice(a.host_id.as_bytes());
    out.extend_from_slice(&a.ttl_secs.to_le_bytes());
    out.extend_from_slice(&token_of(&a.address));
    out.extend_from_slice(a.setting_id.as_bytes());
}

fn token_of(address: &str) -> [u8; 16] {
    parse_token(address).unwrap_or_else(|| address_token(address))
}

fn parse_token(address: &str) -> Option<[u8; 16]> {
    if address.len() != 32 || !address.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut token = [0u8; 16];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&address[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(token)
}

/// Decode one datagram from the front of `bytes`. Returns the datagram and the number of
/// bytes consumed, or `NeedMore` when the buffer holds only part of it.
pub fn decode_datagram(bytes: &[u8]) -> Result<(Datagram, usize), BinaryFrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(BinaryFrameError::NeedMore);
    }
    let tag = bytes[0];
    let host = HostId::from_bytes(id_at(bytes, 1));
    match tag {
        TAG_HELLO => Ok((Datagram::Presence(PresenceMessage::Hello), HEADER_SIZE)),
        TAG_NEED_REFRESH_FULL => Ok((
            Datagram::Presence(PresenceMessage::NeedRefreshFull(host)),
            HEADER_SIZE,
        )),
        TAG_SHUTDOWN => Ok((Datagram::Presence(PresenceMessage::Shutdown(host)), HEADER_SIZE)),
        TAG_REFRESH => {
            if bytes.len() < REFRESH_SIZE {
                return Err(BinaryFrameError::NeedMore);
            }
            let a = announce_at(bytes, host);
            Ok((Datagram::Presence(PresenceMessage::Refresh(a)), REFRESH_SIZE))
        }
        TAG_REFRESH_FULL => {
            if bytes.len() < REFRESH_SIZE + 2 {
                return Err(BinaryFrameError::NeedMore);
            }
            let count = u16::from_le_bytes([bytes[REFRESH_SIZE], bytes[REFRESH_SIZE + 1]]) as usize;
            let total = REFRESH_SIZE + 2 + count * RECORD_SIZE;
            if bytes.len() < total {
                return Err(BinaryFrameError::NeedMore);
            }
            let a = announce_at(bytes, host);
            let mut assignments = Assignments::new();
            let mut at = REFRESH_SIZE + 2;
            for _ in 0..count {
                let vhost = VirtualHostId::from_bytes(id_at(bytes, at));
                let priority = i32_at(bytes, at + ID_SIZE);
                let weight = i32_at(bytes, at + ID_SIZE + 4);
                assignments.insert(vhost, VirtualHostWeight { priority, weight });
                at += RECORD_SIZE;
            }
            if let Err(reason) = validate_assignments(&assignments) {
                return Err(BinaryFrameError::Rejected { len: total, reason });
            }
            Ok((
                Datagram::Presence(PresenceMessage::RefreshFull(a, assignments)),
                total,
            ))
        }
        TAG_MESSAGE => {
            if bytes.len() < HEADER_SIZE + LEN_SIZE {
                return Err(BinaryFrameError::NeedMore);
            }
            let len = u32::from_le_bytes([
                bytes[HEADER_SIZE],
                bytes[HEADER_SIZE + 1],
                bytes[HEADER_SIZE + 2],
                bytes[HEADER_SIZE + 3],
            ]);
            if len > MAX_PAYLOAD_LEN {
                return Err(BinaryFrameError::TooLarge);
            }
            let start = HEADER_SIZE + LEN_SIZE;
            let end = start + len as usize;
            if bytes.len() < end {
                return Err(BinaryFrameError::NeedMore);
            }
            Ok((
                Datagram::Message {
                    target: host,
                    payload: bytes[start..end].to_vec(),
                },
                end,
            ))
        }
        other => Err(BinaryFrameError::UnknownTag(other)),
    }
}

fn id_at(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[at..at + ID_SIZE]);
    id
}

fn i32_at(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn announce_at(bytes: &[u8], host_id: HostId) -> Announce {
    let ttl_secs = u16::from_le_bytes([bytes[HEADER_SIZE], bytes[HEADER_SIZE + 1]]);
    let token = id_at(bytes, HEADER_SIZE + 2);
    let setting_id = SettingId::from_bytes(id_at(bytes, HEADER_SIZE + 2 + ID_SIZE));
    Announce {
        host_id,
        ttl_secs,
        address: token_address(&token),
        setting_id,
    }
}

/// Error encoding or decoding a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinaryFrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unknown datagram tag {0}")]
    UnknownTag(u8),
    #[error("payload too large")]
    TooLarge,
    #[error("{0} assignment records do not fit a datagram")]
    TooManyRecords(usize),
    /// Complete but invalid datagram; `len` bytes can be skipped to stay in sync.
    #[error("rejected {len}-byte datagram: {reason}")]
    Rejected { len: usize, reason: InvalidWeight },
}
