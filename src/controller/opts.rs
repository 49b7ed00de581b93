use std::path::PathBuf;

use derive_builder::Builder;

use crate::identity::NodeIdentity;

/// Outstanding circuit tests are reclaimed after this long, reported or
/// not, to bound memory use. Milliseconds.
pub const CIRCUIT_TEST_TIMEOUT_DEFAULT: u64 = 5 * 60 * 1_000;

pub const HOUSEKEEPING_INTERVAL_DEFAULT: u64 = 5 * 1_000;

/// Candidates scanned per pool before moving on; keeps huge IPv6 pools
/// from turning allocation into an unbounded walk.
pub const POOL_SCAN_LIMIT_DEFAULT: usize = 1 << 16;

#[derive(Clone, Builder)]
pub struct ControllerOpts {
    /// This controller's own identity; requests signed by anyone else
    /// are refused.
    pub identity: NodeIdentity,
    pub db_path: PathBuf,
    #[builder(default = "CIRCUIT_TEST_TIMEOUT_DEFAULT")]
    pub circuit_test_timeout: u64,
    #[builder(default = "HOUSEKEEPING_INTERVAL_DEFAULT")]
    pub housekeeping_interval: u64,
    #[builder(default = "POOL_SCAN_LIMIT_DEFAULT")]
    pub pool_scan_limit: usize,
}
