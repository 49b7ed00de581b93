use std::io;

use thiserror::Error;

use crate::identity::DeviceAddr;
use crate::store::records::NetworkId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("network {0} not found")]
    NetworkNotFound(NetworkId),

    #[error("member {1} of network {0} not found")]
    MemberNotFound(NetworkId, DeviceAddr),

    #[error("device address {0} is already bound to a different identity")]
    IdentityCollision(DeviceAddr),

    #[error("corrupt record: {0}")]
    RecordCorrupt(String),
}

impl Error {
    /// Conflict-class failures worth a single retry at transaction
    /// granularity; everything else is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode::{DatabaseBusy, DatabaseLocked};

        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == DatabaseBusy || e.code == DatabaseLocked
        )
    }
}
