//! Identifiers: host ids, virtual-host ids, setting ids, address tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Host id: 128-bit identifier of a process that sends or receives private messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct HostId(Uuid);

/// Virtual-host id: a named target resolved to one of several hosts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct VirtualHostId(Uuid);

/// Version token of a host's virtual-host assignment set. Nil means "no virtual hosts".
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
pub struct SettingId(Uuid);

impl HostId {
    pub fn new_random() -> Self {
        HostId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        HostId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub const fn nil() -> Self {
        HostId(Uuid::nil())
    }
}

impl VirtualHostId {
    pub fn new_random() -> Self {
        VirtualHostId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        VirtualHostId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl SettingId {
    /// The empty setting: host advertises no virtual hosts.
    pub const EMPTY: SettingId = SettingId(Uuid::nil());

    pub fn new_random() -> Self {
        SettingId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        SettingId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for HostId {
    fn from(u: Uuid) -> Self {
        HostId(u)
    }
}

impl From<Uuid> for VirtualHostId {
    fn from(u: Uuid) -> Self {
        VirtualHostId(u)
    }
}

impl From<Uuid> for SettingId {
    fn from(u: Uuid) -> Self {
        SettingId(u)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl fmt::Display for VirtualHostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Formats as the hyphenated id, or as the empty string for the empty setting.
impl fmt::Display for SettingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            Ok(())
        } else {
            self.0.hyphenated().fmt(f)
        }
    }
}

impl FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(HostId)
    }
}

impl FromStr for VirtualHostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(VirtualHostId)
    }
}

/// Parses an id, with the empty string meaning the empty setting.
impl FromStr for SettingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(SettingId::EMPTY);
        }
        Uuid::parse_str(s).map(SettingId)
    }
}

/// 16-byte token standing in for a private address on binary transports:
/// first half of the SHA-256 digest of the address text.
pub fn address_token(address: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    let digest = hasher.finalize();
    let mut token = [0u8; 16];
    token.copy_from_slice(&digest[..16]);
    token
}

/// Render an address token the way it is stored as a directory address.
pub fn token_address(token: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for b in token {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
