//! The network-configuration decision engine and its in-memory state.

mod allocator;
mod assembler;
mod config;
mod error;
mod housekeeping;
mod inner;
mod opts;
mod request_log;

use std::net::SocketAddr;
use std::sync::Arc;

pub use allocator::AllocationOutcome;
pub use circuit_test::{CircuitTestReport, CircuitTestTracker};
pub use config::{ConfigResponse, NetworkConfig, RequestMeta, ResultCode};
pub use error::Error;
pub use inner::ControllerInner;
pub use opts::*;
pub use request_log::{ActivitySnapshot, LogOutcome, REQUEST_LOG_SIZE, RequestLog};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, instrument, trace};

use crate::identity::NodeIdentity;
use crate::store::Store;
use crate::store::records::NetworkId;

/// The controller service instance: one store, one housekeeping task.
/// Request handlers hold it by reference; dropping it cancels
/// housekeeping and flushes the store.
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Drop for Controller {
    fn drop(&mut self) {
        trace!("Drop controller. Cancel token.");
        self.inner.cancellation_token.cancel();
    }
}

impl Controller {
    /// Opens the backing store (preparing the schema if absent) and
    /// starts the housekeeping task.
    #[instrument(skip_all)]
    pub async fn open(opts: ControllerOpts) -> Result<Self, Error> {
        let store = Store::open(&opts.db_path)?;
        info!(
            "Controller {} (instance {}) bound to store {}",
            opts.identity.address,
            store.instance_id()?,
            opts.db_path.display()
        );

        let cancellation_token = CancellationToken::new();
        let inner = Arc::new(ControllerInner::new(opts, store, cancellation_token.clone()));

        tokio::spawn(ControllerInner::housekeeping_runner(
            inner.clone(),
            cancellation_token.child_token(),
        ));

        Ok(Self { inner })
    }

    /// See [`ControllerInner::request_config`]. Blocks on store I/O;
    /// embedders on an async runtime should call it from a blocking
    /// task.
    pub fn request_config(
        &self,
        from_addr: SocketAddr,
        signing_id: &NodeIdentity,
        requester: &NodeIdentity,
        network_id: NetworkId,
        meta: &RequestMeta,
    ) -> ConfigResponse {
        self.inner
            .request_config(from_addr, signing_id, requester, network_id, meta)
    }

    pub fn start_circuit_test(&self, test_id: u64, params: Vec<u8>) -> Result<(), Error> {
        self.inner.start_circuit_test(test_id, params)
    }

    pub fn record_circuit_test_report(&self, test_id: u64, report: &CircuitTestReport) {
        self.inner.record_circuit_test_report(test_id, report);
    }

    pub fn circuit_tests(&self) -> &CircuitTestTracker {
        &self.inner.circuit_tests
    }

    pub fn request_log(&self) -> &RequestLog {
        &self.inner.request_log
    }

    /// The administrative control plane consumes the store directly.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation_token.cancelled()
    }
}
