use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TubeError;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Protocol-level contact handle, resolved to a [`Contact`] by a directory.
pub type HandleId = u32;

/// Connection identifier assigned by the protocol peer.
pub type ConnectionId = u32;

/// Arbitrary offer parameters attached to a tube.
pub type TubeParameters = BTreeMap<String, serde_json::Value>;

/// Address types mapped to the access controls the channel supports for them.
pub type SupportedSocketMap = BTreeMap<SocketAddressType, Vec<SocketAccessControl>>;

// ── Contacts ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Contact {
    pub handle: HandleId,
    pub id: String,
    pub alias: Option<String>,
}

impl Contact {
    pub fn new(handle: HandleId, id: impl Into<String>) -> Self {
        Self {
            handle,
            id: id.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Contacts are owned by the directory; channels only hold shared references.
pub type ContactRef = Arc<Contact>;

// ── Tube state & sockets ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TubeState {
    LocalPending,
    RemotePending,
    Open,
    NotOffered,
}

impl TubeState {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::LocalPending => 0,
            Self::RemotePending => 1,
            Self::Open => 2,
            Self::NotOffered => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::LocalPending),
            1 => Some(Self::RemotePending),
            2 => Some(Self::Open),
            3 => Some(Self::NotOffered),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SocketAddressType {
    Unix,
    AbstractUnix,
    Ipv4,
    Ipv6,
}

impl SocketAddressType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unix => 0,
            Self::AbstractUnix => 1,
            Self::Ipv4 => 2,
            Self::Ipv6 => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Unix),
            1 => Some(Self::AbstractUnix),
            2 => Some(Self::Ipv4),
            3 => Some(Self::Ipv6),
            _ => None,
        }
    }

    pub fn is_ip(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Ipv6)
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Self::Unix | Self::AbstractUnix)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SocketAccessControl {
    Localhost,
    Port,
    Netmask,
    Credentials,
}

impl SocketAccessControl {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Localhost => 0,
            Self::Port => 1,
            Self::Netmask => 2,
            Self::Credentials => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Localhost),
            1 => Some(Self::Port),
            2 => Some(Self::Netmask),
            3 => Some(Self::Credentials),
            _ => None,
        }
    }
}

/// A socket endpoint exchanged with the proxy.
///
/// Abstract Unix sockets are represented as [`SocketAddress::Unix`] with a
/// leading NUL byte.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SocketAddress {
    Ip(SocketAddr),
    Unix(String),
}

impl SocketAddress {
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Unix(path) if path.starts_with('\0'))
    }
}

/// Access-control payload: sent with an accept call, and received with every
/// new remote connection on an outgoing tube.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessControlParam {
    #[default]
    None,
    Address(SocketAddr),
    Credential(u8),
}

/// Properties fetched when a tube channel becomes ready.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TubeProperties {
    pub state: TubeState,
    #[serde(default)]
    pub parameters: TubeParameters,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub supported_socket_types: SupportedSocketMap,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Raw notifications delivered by the channel proxy.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    NewRemoteConnection {
        handle: HandleId,
        parameter: AccessControlParam,
        connection_id: ConnectionId,
    },
    NewLocalConnection {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        error: TubeError,
    },
    StateChanged(TubeState),
    Invalidated(TubeError),
}

/// Notifications published by a tube channel to its subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum TubeEvent {
    StateChanged(TubeState),
    NewConnection {
        connection_id: ConnectionId,
        contact: Option<ContactRef>,
    },
    /// `contact` is the contact the connection was mapped to just before
    /// removal, so subscribers can still see who disconnected.
    ConnectionClosed {
        connection_id: ConnectionId,
        error: TubeError,
        contact: Option<ContactRef>,
    },
    Invalidated(TubeError),
}
