//! Record types persisted by the store.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::identity::DeviceAddr;
use crate::store::Error;

/// A 64-bit overlay network id, rendered as 16 hex digits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub u64);

impl NetworkId {
    pub(crate) fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str_radix(s, 16)?))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }

    pub(crate) fn from_i64(v: i64) -> Result<Self, Error> {
        match v {
            4 => Ok(Self::V4),
            6 => Ok(Self::V6),
            _ => Err(Error::RecordCorrupt(format!("address family {v}"))),
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// Whether an IP assignment is a host address or a routed network
/// reachable via the member.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpAssignmentKind {
    Address,
    Route,
}

impl IpAssignmentKind {
    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            Self::Address => 0,
            Self::Route => 1,
        }
    }

    pub(crate) fn from_i64(v: i64) -> Result<Self, Error> {
        match v {
            0 => Ok(Self::Address),
            1 => Ok(Self::Route),
            _ => Err(Error::RecordCorrupt(format!("assignment kind {v}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: NetworkId,
    pub name: String,
    pub private: bool,
    pub open_enrollment: bool,
    pub revision: u64,
    pub creation_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub network_id: NetworkId,
    pub node: DeviceAddr,
    pub authorized: bool,
    /// Authorization was explicitly revoked; distinguishes a revoked
    /// member from one that was never authorized. Cleared on
    /// re-authorization.
    pub deauthorized: bool,
    pub active_bridge: bool,
    pub revision: u64,
    /// Authorization changed since the last issued config.
    pub config_stale: bool,
    pub creation_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub address: DeviceAddr,
    pub public_key: String,
    pub first_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssignment {
    pub network_id: NetworkId,
    pub node: DeviceAddr,
    pub net: IpNet,
    pub kind: IpAssignmentKind,
}

impl IpAssignment {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.net.addr())
    }
}

/// An administrator-defined address range for dynamic allocation.
/// Pools are scanned in definition (insertion) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub network_id: NetworkId,
    pub pool: IpNet,
    pub family: AddressFamily,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub network_id: NetworkId,
    pub dest: IpNet,
    pub via: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub network_id: NetworkId,
    pub node: DeviceAddr,
    pub endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub network_id: NetworkId,
    pub address: IpAddr,
    pub metric: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Accept,
    Drop,
}

impl RuleAction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(Error::RecordCorrupt(format!("rule action {s:?}"))),
        }
    }
}

/// An ordered packet-filtering rule. Evaluation order is `rule_no`,
/// ties broken by insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub network_id: NetworkId,
    pub rule_no: i64,
    pub ether_type: Option<u16>,
    pub action: RuleAction,
}
