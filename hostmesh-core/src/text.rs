//! Text framing for pub/sub media: colon-delimited, version-tagged lines.
//!
//! ```text
//! v1:Refresh:<hostId>:<ttlSeconds>:<address>:<settingId-or-empty>
//! v1:RefreshFull:<hostId>:<ttlSeconds>:<address>:<settingId-or-empty>[:<id>-<priority>-<weight>,...]
//! v1:Hello
//! v1:NeedRefreshFull:<hostId>
//! v1:Shutdown:<hostId>
//! ```

use crate::identity::{HostId, SettingId, VirtualHostId};
use crate::protocol::{
    validate_assignments, Announce, Assignments, InvalidWeight, PresenceMessage,
    VirtualHostWeight, PROTOCOL_VERSION,
};

const SEP: char = ':';
const LIST_SEP: char = ',';
const ITEM_SEP: char = '-';
const UUID_TEXT_LEN: usize = 36;

fn version_tag() -> String {
    format!("v{}", PROTOCOL_VERSION)
}

/// Encode a presence message as one text frame.
pub fn encode_text(msg: &PresenceMessage) -> Result<String, TextFrameError> {
    let v = version_tag();
    let out = match msg {
        PresenceMessage::Hello => format!("{v}:Hello"),
        PresenceMessage::NeedRefreshFull(id) => format!("{v}:NeedRefreshFull:{id}"),
        PresenceMessage::Shutdown(id) => format!("{v}:Shutdown:{id}"),
        PresenceMessage::Refresh(a) => format!("{v}:Refresh:{}", announce_fields(a)?),
        PresenceMessage::RefreshFull(a, assignments) => {
            let mut line = format!("{v}:RefreshFull:{}", announce_fields(a)?);
            if !assignments.is_empty() {
                line.push(SEP);
                let items: Vec<String> = assignments
                    .iter()
                    .map(|(vhost, w)| format!("{vhost}{ITEM_SEP}{}{ITEM_SEP}{}", w.priority, w.weight))
                    .collect();
                line.push_str(&items.join(","));
            }
            line
        }
    };
    Ok(out)
}

fn announce_fields(a: &Announce) -> Result<String, TextFrameError> {
    if a.address.contains(SEP) {
        return Err(TextFrameError::AddressHasSeparator(a.address.clone()));
    }
    Ok(format!(
        "{}:{}:{}:{}",
        a.host_id, a.ttl_secs, a.address, a.setting_id
    ))
}

/// Decode one text frame.
pub fn decode_text(line: &str) -> Result<PresenceMessage, TextFrameError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(SEP).collect();
    if fields[0] != version_tag() {
        return Err(TextFrameError::Version(fields[0].to_string()));
    }
    let kind = fields.get(1).copied().unwrap_or_default();
    let expect = |n: usize| -> Result<(), TextFrameError> {
        if fields.len() == n {
            Ok(())
        } else {
            Err(TextFrameError::FieldCount {
                kind: kind.to_string(),
                got: fields.len(),
            })
        }
    };
    match kind {
        "Hello" => {
            expect(2)?;
            Ok(PresenceMessage::Hello)
        }
        "NeedRefreshFull" => {
            expect(3)?;
            Ok(PresenceMessage::NeedRefreshFull(parse_host(fields[2])?))
        }
        "Shutdown" => {
            expect(3)?;
            Ok(PresenceMessage::Shutdown(parse_host(fields[2])?))
        }
        "Refresh" => {
            expect(6)?;
            Ok(PresenceMessage::Refresh(parse_announce(&fields[2..6])?))
        }
        "RefreshFull" => {
            if fields.len() != 6 && fields.len() != 7 {
                return Err(TextFrameError::FieldCount {
                    kind: kind.to_string(),
                    got: fields.len(),
                });
            }
            let announce = parse_announce(&fields[2..6])?;
            let assignments = match fields.get(6) {
                Some(list) => parse_assignments(list)?,
                None => Assignments::new(),
            };
            Ok(PresenceMessage::RefreshFull(announce, assignments))
        }
        other => Err(TextFrameError::UnknownKind(other.to_string())),
    }
}

fn parse_host(s: &str) -> Result<HostId, TextFrameError> {
    s.parse().map_err(|_| TextFrameError::BadId(s.to_string()))
}

fn parse_announce(f: &[&str]) -> Result<Announce, TextFrameError> {
    let host_id = parse_host(f[0])?;
    let ttl_secs = f[1]
        .parse::<u16>()
        .map_err(|_| TextFrameError::BadNumber(f[1].to_string()))?;
    let setting_id: SettingId = f[3]
        .parse()
        .map_err(|_| TextFrameError::BadId(f[3].to_string()))?;
    Ok(Announce {
        host_id,
        ttl_secs,
        address: f[2].to_string(),
        setting_id,
    })
}

/// `<id>-<priority>-<weight>` items; the id is a hyphenated UUID and priority may be negative.
fn parse_assignments(list: &str) -> Result<Assignments, TextFrameError> {
    let mut out = Assignments::new();
    if list.is_empty() {
        return Ok(out);
    }
    for item in list.split(LIST_SEP) {
        let bad = || TextFrameError::BadAssignment(item.to_string());
        if item.len() <= UUID_TEXT_LEN + 1 || !item.is_char_boundary(UUID_TEXT_LEN) {
            return Err(bad());
        }
        let (id, rest) = item.split_at(UUID_TEXT_LEN);
        let rest = rest.strip_prefix(ITEM_SEP).ok_or_else(bad)?;
        let (priority, weight) = rest.rsplit_once(ITEM_SEP).ok_or_else(bad)?;
        let vhost: VirtualHostId = id.parse().map_err(|_| bad())?;
        let priority: i32 = priority.parse().map_err(|_| bad())?;
        let weight: i32 = weight.parse().map_err(|_| bad())?;
        out.insert(vhost, VirtualHostWeight { priority, weight });
    }
    validate_assignments(&out)?;
    Ok(out)
}

/// Error decoding or encoding a text frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextFrameError {
    #[error("unsupported version tag {0:?}")]
    Version(String),
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("unexpected field count {got} for {kind}")]
    FieldCount { kind: String, got: usize },
    #[error("malformed id {0:?}")]
    BadId(String),
    #[error("malformed number {0:?}")]
    BadNumber(String),
    #[error("malformed assignment {0:?}")]
    BadAssignment(String),
    #[error(transparent)]
    InvalidWeight(#[from] InvalidWeight),
    #[error("address {0:?} contains the field separator")]
    AddressHasSeparator(String),
}
