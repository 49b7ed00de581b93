use thiserror::Error;

use crate::store;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),

    #[error("circuit test {0:#x} already outstanding")]
    CircuitTestDuplicate(u64),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_transient())
    }
}
