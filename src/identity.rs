//! Device identity types used by the controller.
//!
//! A device is identified by a 40-bit overlay address plus its public
//! identity material. The binding between the two is recorded in the
//! store on first contact and is immutable afterwards.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of significant bits in a device address.
pub const DEVICE_ADDR_BITS: u32 = 40;

const DEVICE_ADDR_MASK: u64 = (1 << DEVICE_ADDR_BITS) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid device address: {0}")]
    AddrInvalid(String),

    #[error("device address out of range: {0:#x}")]
    AddrOutOfRange(u64),
}

/// A 40-bit overlay device address, rendered as 10 hex digits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    pub fn new(addr: u64) -> Result<Self, IdentityError> {
        if addr & !DEVICE_ADDR_MASK != 0 {
            return Err(IdentityError::AddrOutOfRange(addr));
        }
        Ok(Self(addr))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for DeviceAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for DeviceAddr {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr =
            u64::from_str_radix(s, 16).map_err(|_| IdentityError::AddrInvalid(s.to_string()))?;
        Self::new(addr)
    }
}

/// A device address bound to its public identity material.
///
/// The public key is carried as opaque text; signature verification
/// happens in the transport layer before requests reach the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub address: DeviceAddr,
    pub public_key: String,
}

impl NodeIdentity {
    pub fn new(address: DeviceAddr, public_key: impl Into<String>) -> Self {
        Self {
            address,
            public_key: public_key.into(),
        }
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.public_key)
    }
}
