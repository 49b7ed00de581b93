//! Configuration assembly: the pure read path.

use crate::controller::config::NetworkConfig;
use crate::controller::inner::ControllerInner;
use crate::identity::DeviceAddr;
use crate::store;
use crate::store::records::{AddressFamily, NetworkId};

impl ControllerInner {
    /// Gathers everything an authorized member needs into one payload.
    /// All lookups run inside a single read transaction, so the config
    /// reflects one consistent snapshot of the network; the revision
    /// stamp is taken from that same snapshot.
    pub(crate) fn assemble(
        &self,
        network_id: NetworkId,
        node: DeviceAddr,
        exhausted_families: Vec<AddressFamily>,
    ) -> Result<NetworkConfig, store::Error> {
        let timestamp = Self::clock();

        self.store.read(|tx| {
            let network = tx
                .network(network_id)?
                .ok_or(store::Error::NetworkNotFound(network_id))?;
            let member = tx
                .member(network_id, node)?
                .ok_or(store::Error::MemberNotFound(network_id, node))?;

            Ok(NetworkConfig {
                network_id,
                name: network.name,
                private: network.private,
                timestamp,
                revision: network.revision,
                member_revision: member.revision,
                assignments: tx.ip_assignments(network_id, node)?,
                rules: tx.rules(network_id)?,
                routes: tx.routes(network_id)?,
                relays: tx.relays(network_id)?,
                gateways: tx.gateways(network_id)?,
                active_bridges: tx.active_bridges(network_id)?,
                exhausted_families,
            })
        })
    }
}
