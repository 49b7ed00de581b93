//! Dynamic IP allocation against the store.

use ipnet::IpNet;
use tracing::debug;

use crate::controller::inner::ControllerInner;
use crate::identity::DeviceAddr;
use crate::store;
use crate::store::records::{AddressFamily, IpAssignment, IpAssignmentKind, NetworkId};

/// Outcome of [`ControllerInner::ensure_assignment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// The member already held an address for this family; a device's
    /// address never changes across refreshes without administrative
    /// action.
    Existing(IpNet),
    Allocated(IpNet),
    /// Every pool for the family is fully assigned. Reported, never
    /// fatal; the decision engine decides what it means for the
    /// request.
    PoolExhausted,
    /// The network defines no pool for this family, so the family needs
    /// no dynamic assignment.
    NoPool,
}

impl ControllerInner {
    /// Finds or creates a non-conflicting host-address assignment for
    /// one address family. The free-address scan and the conditional
    /// insert run inside a single immediate write transaction, so the
    /// exclusivity invariant is checked and committed atomically with
    /// respect to concurrent allocations.
    pub(crate) fn ensure_assignment(
        &self,
        network_id: NetworkId,
        node: DeviceAddr,
        family: AddressFamily,
    ) -> Result<AllocationOutcome, store::Error> {
        let scan_limit = self.opts.pool_scan_limit;

        let outcome = self.store.write(|tx| {
            // the member is checked inside the transaction; a concurrent
            // member or network deletion must not leak an assignment row
            // past its cascade
            if tx.member(network_id, node)?.is_none() {
                return Err(store::Error::MemberNotFound(network_id, node));
            }

            if let Some(existing) = tx
                .ip_assignments(network_id, node)?
                .into_iter()
                .find(|a| a.kind == IpAssignmentKind::Address && a.family() == family)
            {
                return Ok(AllocationOutcome::Existing(existing.net));
            }

            let pools = tx.pools(network_id, family)?;
            if pools.is_empty() {
                return Ok(AllocationOutcome::NoPool);
            }

            let allocated = tx.allocated_addresses(network_id, family)?;
            for pool in &pools {
                for candidate in pool.pool.hosts().take(scan_limit) {
                    if allocated.contains(&candidate) {
                        continue;
                    }
                    let net = IpNet::new(candidate, pool.pool.prefix_len()).map_err(|e| {
                        store::Error::RecordCorrupt(format!("pool {}: {e}", pool.pool))
                    })?;
                    tx.insert_ip_assignment(&IpAssignment {
                        network_id,
                        node,
                        net,
                        kind: IpAssignmentKind::Address,
                    })?;
                    return Ok(AllocationOutcome::Allocated(net));
                }
            }

            Ok(AllocationOutcome::PoolExhausted)
        })?;

        match &outcome {
            AllocationOutcome::Allocated(net) => {
                debug!("Allocated {net} to {node} in network {network_id}");
            }
            AllocationOutcome::PoolExhausted => {
                debug!("Pools for {family} in network {network_id} are exhausted");
            }
            _ => {}
        }

        Ok(outcome)
    }
}
