//! Request metadata and the assembled configuration payload.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::identity::DeviceAddr;
use crate::store::records::{
    AddressFamily, GatewayRecord, IpAssignment, NetworkId, RelayRecord, RouteRecord, RuleRecord,
};

/// Free-form metadata carried with a config request by the transport
/// layer.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Protocol version string reported by the requesting device.
    pub protocol_version: Option<String>,
    /// Address families for which the device wants a dynamic
    /// assignment.
    pub address_families: Vec<AddressFamily>,
}

impl RequestMeta {
    pub fn with_families(families: &[AddressFamily]) -> Self {
        Self {
            protocol_version: None,
            address_families: families.to_vec(),
        }
    }
}

/// Outcome of a config request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Request authorized; a configuration is attached.
    Ok,
    /// No such network. Callers may abandon instead of retrying.
    NotFound,
    /// Identity mismatch for the source address.
    AuthFailure,
    /// A member record exists (or was just created) but has not been
    /// authorized yet.
    Pending,
    /// Denied: authorization revoked, or closed network without a
    /// member record.
    Disabled,
    /// Transient storage failure; the caller may retry.
    TemporaryError,
    InternalError,
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::AuthFailure => write!(f, "AUTH_FAILURE"),
            Self::Pending => write!(f, "PENDING"),
            Self::Disabled => write!(f, "DISABLED"),
            Self::TemporaryError => write!(f, "TEMPORARY_ERROR"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigResponse {
    pub code: ResultCode,
    pub config: Option<NetworkConfig>,
}

impl ConfigResponse {
    pub(crate) fn denied(code: ResultCode) -> Self {
        Self { code, config: None }
    }

    pub(crate) fn ok(config: NetworkConfig) -> Self {
        Self {
            code: ResultCode::Ok,
            config: Some(config),
        }
    }
}

/// The complete configuration issued to an authorized member. Signed and
/// delivered by the out-of-scope transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: NetworkId,
    pub name: String,
    pub private: bool,
    /// Issue timestamp, epoch milliseconds.
    pub timestamp: u64,
    /// Network revision at the snapshot the config was assembled from.
    pub revision: u64,
    pub member_revision: u64,
    /// Static and dynamic assignments, host addresses and routed
    /// networks alike.
    pub assignments: Vec<IpAssignment>,
    /// Packet-filtering rules in enforced evaluation order.
    pub rules: Vec<RuleRecord>,
    pub routes: Vec<RouteRecord>,
    pub relays: Vec<RelayRecord>,
    pub gateways: Vec<GatewayRecord>,
    pub active_bridges: Vec<DeviceAddr>,
    /// Families the device requested but whose pools were exhausted.
    /// Allocation exhaustion is partial success, not failure.
    pub exhausted_families: Vec<AddressFamily>,
}
