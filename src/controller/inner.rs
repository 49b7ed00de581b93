use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::controller::allocator::AllocationOutcome;
use crate::controller::circuit_test::{CircuitTestReport, CircuitTestTracker};
use crate::controller::config::{ConfigResponse, RequestMeta, ResultCode};
use crate::controller::error::Error;
use crate::controller::opts::ControllerOpts;
use crate::controller::request_log::{LogOutcome, RequestLog};
use crate::identity::NodeIdentity;
use crate::store;
use crate::store::Store;
use crate::store::records::NetworkId;

pub struct ControllerInner {
    pub(crate) opts: ControllerOpts,
    pub(crate) store: Store,
    pub(crate) request_log: RequestLog,
    pub(crate) circuit_tests: CircuitTestTracker,
    pub(crate) cancellation_token: CancellationToken,
}

impl ControllerInner {
    pub(crate) fn new(
        opts: ControllerOpts,
        store: Store,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            opts,
            store,
            request_log: RequestLog::default(),
            circuit_tests: CircuitTestTracker::default(),
            cancellation_token,
        }
    }

    /// Decides a join/refresh request and, if the member is authorized,
    /// returns the assembled configuration. Storage failures never
    /// escape: conflict-class failures that survived the store's retry
    /// come back as `TemporaryError`, everything else as
    /// `InternalError`.
    #[instrument(skip_all, fields(network = %network_id, node = %requester.address))]
    pub fn request_config(
        &self,
        from_addr: SocketAddr,
        signing_id: &NodeIdentity,
        requester: &NodeIdentity,
        network_id: NetworkId,
        meta: &RequestMeta,
    ) -> ConfigResponse {
        match self.do_request_config(from_addr, signing_id, requester, network_id, meta) {
            Ok(response) => {
                trace!("Request decided: {}", response.code);
                response
            }
            Err(e) if e.is_transient() => {
                warn!("Transient storage failure, request not decided: {e}");
                ConfigResponse::denied(ResultCode::TemporaryError)
            }
            Err(e) => {
                error!("Request failed: {e}");
                ConfigResponse::denied(ResultCode::InternalError)
            }
        }
    }

    fn do_request_config(
        &self,
        from_addr: SocketAddr,
        signing_id: &NodeIdentity,
        requester: &NodeIdentity,
        network_id: NetworkId,
        meta: &RequestMeta,
    ) -> Result<ConfigResponse, Error> {
        let now = Self::clock();

        // this controller cannot answer requests meant to be signed by
        // another identity
        if signing_id != &self.opts.identity {
            debug!("Signing identity {signing_id} is not ours");
            return Ok(ConfigResponse::denied(ResultCode::InternalError));
        }

        // first contact records the identity binding; a different key on
        // a bound address is a collision and must never overwrite
        match self.store.write(|tx| tx.register_node(requester, now)) {
            Ok(()) => {}
            Err(store::Error::IdentityCollision(addr)) => {
                debug!("Identity collision for {addr}");
                self.log_outcome(from_addr, requester, network_id, meta, now, false);
                return Ok(ConfigResponse::denied(ResultCode::AuthFailure));
            }
            Err(e) => return Err(e.into()),
        }

        let Some(network) = self.store.read(|tx| tx.network(network_id))? else {
            return Ok(ConfigResponse::denied(ResultCode::NotFound));
        };

        // member lookup; open enrollment records intent to join as an
        // unauthorized member, closed networks record nothing. The
        // network is checked again inside the write transaction so a
        // concurrent network deletion cannot leave an orphan member row.
        let member = match self.store.write(|tx| {
            match tx.member(network_id, requester.address)? {
                Some(member) => Ok(Some(member)),
                None if network.open_enrollment => {
                    if tx.network(network_id)?.is_none() {
                        return Err(store::Error::NetworkNotFound(network_id));
                    }
                    tx.create_member(network_id, requester.address, false, now)?;
                    tx.member(network_id, requester.address)
                }
                None => Ok(None),
            }
        }) {
            Ok(member) => member,
            Err(store::Error::NetworkNotFound(_)) => {
                return Ok(ConfigResponse::denied(ResultCode::NotFound));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(member) = member else {
            self.log_outcome(from_addr, requester, network_id, meta, now, false);
            return Ok(ConfigResponse::denied(ResultCode::Disabled));
        };

        if !member.authorized {
            self.log_outcome(from_addr, requester, network_id, meta, now, false);
            // revoked members are refused outright; never-authorized
            // ones stay pending
            let code = if member.deauthorized {
                ResultCode::Disabled
            } else {
                ResultCode::Pending
            };
            return Ok(ConfigResponse::denied(code));
        }

        // dynamic assignments for the requested families; exhaustion is
        // partial success and is reported in the payload
        let mut exhausted_families = Vec::new();
        for family in &meta.address_families {
            if let AllocationOutcome::PoolExhausted =
                self.ensure_assignment(network_id, requester.address, *family)?
            {
                exhausted_families.push(*family);
            }
        }

        self.store
            .write(|tx| tx.note_config_issued(network_id, requester.address))?;

        let config = self.assemble(network_id, requester.address, exhausted_families)?;
        self.log_outcome(from_addr, requester, network_id, meta, now, true);

        Ok(ConfigResponse::ok(config))
    }

    fn log_outcome(
        &self,
        from_addr: SocketAddr,
        requester: &NodeIdentity,
        network_id: NetworkId,
        meta: &RequestMeta,
        now: u64,
        authorized: bool,
    ) {
        self.request_log.record(
            requester.address,
            network_id,
            LogOutcome {
                time: now,
                protocol_version: meta.protocol_version.clone(),
                from_addr,
                authorized,
            },
        );
    }

    pub fn start_circuit_test(&self, test_id: u64, params: Vec<u8>) -> Result<(), Error> {
        self.circuit_tests.start(test_id, params, Self::clock())
    }

    pub fn record_circuit_test_report(&self, test_id: u64, report: &CircuitTestReport) {
        self.circuit_tests.record_report(test_id, report);
    }

    pub(crate) fn clock() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }
}
