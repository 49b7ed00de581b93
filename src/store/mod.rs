//! Persistent state store backing the controller.
//!
//! SQLite in WAL mode. Every multi-step read-then-write span runs inside
//! one transaction: [`Store::read`] opens a deferred transaction for
//! consistent snapshots, [`Store::write`] opens an immediate transaction
//! and retries once on conflict-class failures. Connections are handed
//! out from a free-list so independent requests do not serialize on a
//! single connection; writer exclusion is left to SQLite itself and only
//! covers the short invariant spans (conditional insert, revision bump).

mod error;
pub mod records;
mod schema;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

pub use error::Error;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, instrument};

use crate::identity::{DeviceAddr, NodeIdentity};
use crate::store::records::{
    AddressFamily, GatewayRecord, IpAssignment, IpAssignmentKind, MemberRecord, NetworkId,
    NetworkRecord, NodeRecord, PoolRecord, RelayRecord, RouteRecord, RuleAction, RuleRecord,
};
use crate::store::schema::{SCHEMA_SQL, SCHEMA_VERSION};

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_500);

pub struct Store {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl Store {
    /// Opens (creating if absent) the controller database and prepares
    /// the schema. An `instance_id` is generated on first open.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            idle: Mutex::new(Vec::new()),
        };

        let conn = store.connect()?;
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO config (k, v) VALUES ('instance_id', lower(hex(randomblob(16))))",
            [],
        )?;
        debug!("Opened store (schema version {SCHEMA_VERSION})");
        store.park(conn);

        Ok(store)
    }

    fn connect(&self) -> Result<Connection, Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = OFF;",
        )?;
        Ok(conn)
    }

    fn park(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conn);
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, Error>) -> Result<T, Error> {
        let mut conn = match self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
        {
            Some(conn) => conn,
            None => self.connect()?,
        };
        let result = f(&mut conn);
        self.park(conn);
        result
    }

    /// Runs `f` inside a read transaction: all lookups observe one
    /// consistent snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = f(&StoreTx::new(&tx))?;
            tx.commit()?;
            Ok(result)
        })
    }

    /// Runs `f` inside an immediate write transaction, retrying once if
    /// the first attempt fails with a conflict-class error.
    pub fn write<T>(&self, f: impl Fn(&StoreTx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        self.with_conn(|conn| match Self::run_write(conn, &f) {
            Err(e) if e.is_transient() => {
                debug!("Write transaction conflicted, retrying once: {e}");
                Self::run_write(conn, &f)
            }
            other => other,
        })
    }

    fn run_write<T>(
        conn: &mut Connection,
        f: &impl Fn(&StoreTx<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&StoreTx::new(&tx))?;
        tx.commit()?;
        Ok(result)
    }

    pub fn instance_id(&self) -> Result<String, Error> {
        self.read(|tx| {
            tx.config_get("instance_id")?
                .ok_or_else(|| Error::RecordCorrupt("missing instance_id".to_string()))
        })
    }
}

/// Repository handle scoped to one transaction. One method per logical
/// operation; administrative mutations bump the owning network's
/// revision inside the same transaction.
pub struct StoreTx<'c> {
    conn: &'c Connection,
}

impl<'c> StoreTx<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // config KV

    pub fn config_get(&self, k: &str) -> Result<Option<String>, Error> {
        Ok(self
            .conn
            .query_row("SELECT v FROM config WHERE k = ?1", params![k], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn config_set(&self, k: &str, v: &str) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO config (k, v) VALUES (?1, ?2) \
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![k, v],
        )?;
        Ok(())
    }

    // networks

    pub fn network(&self, id: NetworkId) -> Result<Option<NetworkRecord>, Error> {
        self.conn
            .query_row(
                "SELECT id, name, private, open_enrollment, revision, creation_time \
                 FROM networks WHERE id = ?1",
                params![id.as_i64()],
                |row| {
                    Ok(NetworkRecord {
                        id: NetworkId::from_i64(row.get(0)?),
                        name: row.get(1)?,
                        private: row.get(2)?,
                        open_enrollment: row.get(3)?,
                        revision: row.get::<_, i64>(4)? as u64,
                        creation_time: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn create_network(
        &self,
        id: NetworkId,
        name: &str,
        private: bool,
        open_enrollment: bool,
        now: u64,
    ) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO networks (id, name, private, open_enrollment, revision, creation_time) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![id.as_i64(), name, private, open_enrollment, now as i64],
        )?;
        Ok(())
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, private, open_enrollment, revision, creation_time \
             FROM networks ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NetworkRecord {
                id: NetworkId::from_i64(row.get(0)?),
                name: row.get(1)?,
                private: row.get(2)?,
                open_enrollment: row.get(3)?,
                revision: row.get::<_, i64>(4)? as u64,
                creation_time: row.get::<_, i64>(5)? as u64,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Error::from)
    }

    pub fn set_network_flags(
        &self,
        id: NetworkId,
        private: bool,
        open_enrollment: bool,
    ) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE networks SET private = ?2, open_enrollment = ?3 WHERE id = ?1",
            params![id.as_i64(), private, open_enrollment],
        )?;
        if n == 0 {
            return Err(Error::NetworkNotFound(id));
        }
        self.bump_network_revision(id)?;
        Ok(())
    }

    /// Deletes a network and all owned children. Referential cleanup is
    /// mandatory; dangling children must never outlive their network.
    pub fn delete_network(&self, id: NetworkId) -> Result<(), Error> {
        let nwid = id.as_i64();
        for table in [
            "gateways",
            "relays",
            "routes",
            "rules",
            "ip_assignment_pools",
            "ip_assignments",
            "members",
        ] {
            self.conn.execute(
                &format!("DELETE FROM {table} WHERE network_id = ?1"),
                params![nwid],
            )?;
        }
        let n = self
            .conn
            .execute("DELETE FROM networks WHERE id = ?1", params![nwid])?;
        if n == 0 {
            return Err(Error::NetworkNotFound(id));
        }
        Ok(())
    }

    pub fn network_revision(&self, id: NetworkId) -> Result<u64, Error> {
        self.conn
            .query_row(
                "SELECT revision FROM networks WHERE id = ?1",
                params![id.as_i64()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64)
            .ok_or(Error::NetworkNotFound(id))
    }

    pub fn bump_network_revision(&self, id: NetworkId) -> Result<u64, Error> {
        let n = self.conn.execute(
            "UPDATE networks SET revision = revision + 1 WHERE id = ?1",
            params![id.as_i64()],
        )?;
        if n == 0 {
            return Err(Error::NetworkNotFound(id));
        }
        self.network_revision(id)
    }

    // node identities

    pub fn node(&self, address: DeviceAddr) -> Result<Option<NodeRecord>, Error> {
        self.conn
            .query_row(
                "SELECT address, public_key, first_seen FROM nodes WHERE address = ?1",
                params![address.as_u64() as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(addr, public_key, first_seen)| {
                Ok(NodeRecord {
                    address: device_addr(addr)?,
                    public_key,
                    first_seen: first_seen as u64,
                })
            })
            .transpose()
    }

    /// Records a device identity on first contact. The binding is
    /// immutable: a different key claiming a bound address is an
    /// identity collision, never an overwrite.
    pub fn register_node(&self, identity: &NodeIdentity, now: u64) -> Result<(), Error> {
        match self.node(identity.address)? {
            Some(existing) if existing.public_key == identity.public_key => Ok(()),
            Some(_) => Err(Error::IdentityCollision(identity.address)),
            None => {
                self.conn.execute(
                    "INSERT INTO nodes (address, public_key, first_seen) VALUES (?1, ?2, ?3)",
                    params![
                        identity.address.as_u64() as i64,
                        identity.public_key,
                        now as i64
                    ],
                )?;
                Ok(())
            }
        }
    }

    // members

    pub fn member(&self, id: NetworkId, node: DeviceAddr) -> Result<Option<MemberRecord>, Error> {
        self.conn
            .query_row(
                "SELECT network_id, node_address, authorized, deauthorized, active_bridge, \
                        revision, config_stale, creation_time \
                 FROM members WHERE network_id = ?1 AND node_address = ?2",
                params![id.as_i64(), node.as_u64() as i64],
                member_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn create_member(
        &self,
        id: NetworkId,
        node: DeviceAddr,
        authorized: bool,
        now: u64,
    ) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO members \
             (network_id, node_address, authorized, deauthorized, active_bridge, revision, \
              config_stale, creation_time) \
             VALUES (?1, ?2, ?3, 0, 0, 1, 1, ?4)",
            params![id.as_i64(), node.as_u64() as i64, authorized, now as i64],
        )?;
        Ok(())
    }

    pub fn list_members(&self, id: NetworkId) -> Result<Vec<MemberRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT network_id, node_address, authorized, deauthorized, active_bridge, \
                    revision, config_stale, creation_time \
             FROM members WHERE network_id = ?1 ORDER BY node_address",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], member_from_row)?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row??);
        }
        Ok(members)
    }

    pub fn set_member_authorized(
        &self,
        id: NetworkId,
        node: DeviceAddr,
        authorized: bool,
    ) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE members SET authorized = ?3, \
                    deauthorized = CASE WHEN ?3 THEN 0 ELSE 1 END, \
                    config_stale = 1 \
             WHERE network_id = ?1 AND node_address = ?2",
            params![id.as_i64(), node.as_u64() as i64, authorized],
        )?;
        if n == 0 {
            return Err(Error::MemberNotFound(id, node));
        }
        self.bump_network_revision(id)?;
        Ok(())
    }

    pub fn set_member_active_bridge(
        &self,
        id: NetworkId,
        node: DeviceAddr,
        active_bridge: bool,
    ) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE members SET active_bridge = ?3 \
             WHERE network_id = ?1 AND node_address = ?2",
            params![id.as_i64(), node.as_u64() as i64, active_bridge],
        )?;
        if n == 0 {
            return Err(Error::MemberNotFound(id, node));
        }
        self.bump_network_revision(id)?;
        Ok(())
    }

    /// Deletes a member and releases all of its IP assignments back to
    /// the pool.
    pub fn delete_member(&self, id: NetworkId, node: DeviceAddr) -> Result<(), Error> {
        self.delete_ip_assignments(id, node)?;
        let n = self.conn.execute(
            "DELETE FROM members WHERE network_id = ?1 AND node_address = ?2",
            params![id.as_i64(), node.as_u64() as i64],
        )?;
        if n == 0 {
            return Err(Error::MemberNotFound(id, node));
        }
        self.bump_network_revision(id)?;
        Ok(())
    }

    /// Marks the member's current authorization state as issued. The
    /// first config issued after an authorization change advances the
    /// member revision; repeat issues leave it untouched.
    pub fn note_config_issued(&self, id: NetworkId, node: DeviceAddr) -> Result<u64, Error> {
        let member = self
            .member(id, node)?
            .ok_or(Error::MemberNotFound(id, node))?;
        if !member.config_stale {
            return Ok(member.revision);
        }
        self.conn.execute(
            "UPDATE members SET revision = revision + 1, config_stale = 0 \
             WHERE network_id = ?1 AND node_address = ?2",
            params![id.as_i64(), node.as_u64() as i64],
        )?;
        Ok(member.revision + 1)
    }

    pub fn active_bridges(&self, id: NetworkId) -> Result<Vec<DeviceAddr>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT node_address FROM members \
             WHERE network_id = ?1 AND active_bridge = 1 AND authorized = 1 \
             ORDER BY node_address",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], |row| row.get::<_, i64>(0))?;
        let mut bridges = Vec::new();
        for row in rows {
            bridges.push(device_addr(row?)?);
        }
        Ok(bridges)
    }

    // IP assignments

    pub fn ip_assignments(
        &self,
        id: NetworkId,
        node: DeviceAddr,
    ) -> Result<Vec<IpAssignment>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT ip, prefix_len, family, kind FROM ip_assignments \
             WHERE network_id = ?1 AND node_address = ?2 ORDER BY family, ip",
        )?;
        let rows = stmt.query_map(params![id.as_i64(), node.as_u64() as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut assignments = Vec::new();
        for row in rows {
            let (ip, prefix_len, kind) = row?;
            assignments.push(IpAssignment {
                network_id: id,
                node,
                net: ip_net(&ip, prefix_len)?,
                kind: IpAssignmentKind::from_i64(kind)?,
            });
        }
        Ok(assignments)
    }

    /// All host addresses currently assigned in a network for one
    /// family, regardless of holder. Consulted by the allocator inside
    /// its write transaction.
    pub fn allocated_addresses(
        &self,
        id: NetworkId,
        family: AddressFamily,
    ) -> Result<HashSet<IpAddr>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT ip FROM ip_assignments \
             WHERE network_id = ?1 AND family = ?2 AND kind = 0",
        )?;
        let rows = stmt.query_map(params![id.as_i64(), family.as_i64()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut addresses = HashSet::new();
        for row in rows {
            let ip = row?;
            addresses.insert(
                IpAddr::from_str(&ip).map_err(|e| Error::RecordCorrupt(format!("ip {ip}: {e}")))?,
            );
        }
        Ok(addresses)
    }

    /// Conditional insert used by the allocator: the partial unique
    /// index on (network, family, ip) rejects a concurrent duplicate.
    pub fn insert_ip_assignment(&self, assignment: &IpAssignment) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO ip_assignments (network_id, node_address, ip, prefix_len, family, kind) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assignment.network_id.as_i64(),
                assignment.node.as_u64() as i64,
                assignment.net.addr().to_string(),
                assignment.net.prefix_len() as i64,
                assignment.family().as_i64(),
                assignment.kind.as_i64(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_ip_assignments(&self, id: NetworkId, node: DeviceAddr) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM ip_assignments WHERE network_id = ?1 AND node_address = ?2",
            params![id.as_i64(), node.as_u64() as i64],
        )?;
        Ok(())
    }

    // assignment pools

    pub fn pools(&self, id: NetworkId, family: AddressFamily) -> Result<Vec<PoolRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT pool FROM ip_assignment_pools \
             WHERE network_id = ?1 AND family = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.as_i64(), family.as_i64()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut pools = Vec::new();
        for row in rows {
            let pool = row?;
            pools.push(PoolRecord {
                network_id: id,
                pool: pool
                    .parse()
                    .map_err(|e| Error::RecordCorrupt(format!("pool {pool}: {e}")))?,
                family,
            });
        }
        Ok(pools)
    }

    pub fn add_pool(&self, id: NetworkId, pool: ipnet::IpNet) -> Result<(), Error> {
        let family = AddressFamily::of(&pool.addr());
        self.conn.execute(
            "INSERT INTO ip_assignment_pools (network_id, pool, family) VALUES (?1, ?2, ?3)",
            params![id.as_i64(), pool.to_string(), family.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }

    pub fn delete_pools(&self, id: NetworkId) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM ip_assignment_pools WHERE network_id = ?1",
            params![id.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }

    // rules

    pub fn rules(&self, id: NetworkId) -> Result<Vec<RuleRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_no, ether_type, action FROM rules \
             WHERE network_id = ?1 ORDER BY rule_no, id",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut rules = Vec::new();
        for row in rows {
            let (rule_no, ether_type, action) = row?;
            rules.push(RuleRecord {
                network_id: id,
                rule_no,
                ether_type: ether_type.map(|v| v as u16),
                action: RuleAction::parse(&action)?,
            });
        }
        Ok(rules)
    }

    pub fn add_rule(&self, rule: &RuleRecord) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO rules (network_id, rule_no, ether_type, action) VALUES (?1, ?2, ?3, ?4)",
            params![
                rule.network_id.as_i64(),
                rule.rule_no,
                rule.ether_type.map(|v| v as i64),
                rule.action.as_str(),
            ],
        )?;
        self.bump_network_revision(rule.network_id)?;
        Ok(())
    }

    pub fn delete_rules(&self, id: NetworkId) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM rules WHERE network_id = ?1",
            params![id.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }

    // local routes

    pub fn routes(&self, id: NetworkId) -> Result<Vec<RouteRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT dest, via FROM routes WHERE network_id = ?1 ORDER BY dest",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut routes = Vec::new();
        for row in rows {
            let (dest, via) = row?;
            routes.push(RouteRecord {
                network_id: id,
                dest: dest
                    .parse()
                    .map_err(|e| Error::RecordCorrupt(format!("route {dest}: {e}")))?,
                via: via
                    .map(|v| {
                        v.parse()
                            .map_err(|e| Error::RecordCorrupt(format!("via {v}: {e}")))
                    })
                    .transpose()?,
            });
        }
        Ok(routes)
    }

    pub fn add_route(&self, route: &RouteRecord) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO routes (network_id, dest, via) VALUES (?1, ?2, ?3)",
            params![
                route.network_id.as_i64(),
                route.dest.to_string(),
                route.via.map(|v| v.to_string()),
            ],
        )?;
        self.bump_network_revision(route.network_id)?;
        Ok(())
    }

    pub fn delete_routes(&self, id: NetworkId) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM routes WHERE network_id = ?1",
            params![id.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }

    // relays

    pub fn relays(&self, id: NetworkId) -> Result<Vec<RelayRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT node_address, endpoint FROM relays \
             WHERE network_id = ?1 ORDER BY node_address",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut relays = Vec::new();
        for row in rows {
            let (node, endpoint) = row?;
            relays.push(RelayRecord {
                network_id: id,
                node: device_addr(node)?,
                endpoint: endpoint
                    .map(|e| {
                        e.parse()
                            .map_err(|err| Error::RecordCorrupt(format!("endpoint {e}: {err}")))
                    })
                    .transpose()?,
            });
        }
        Ok(relays)
    }

    pub fn add_relay(&self, relay: &RelayRecord) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO relays (network_id, node_address, endpoint) VALUES (?1, ?2, ?3)",
            params![
                relay.network_id.as_i64(),
                relay.node.as_u64() as i64,
                relay.endpoint.map(|e| e.to_string()),
            ],
        )?;
        self.bump_network_revision(relay.network_id)?;
        Ok(())
    }

    pub fn delete_relays(&self, id: NetworkId) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM relays WHERE network_id = ?1",
            params![id.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }

    // gateways

    pub fn gateways(&self, id: NetworkId) -> Result<Vec<GatewayRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT address, metric FROM gateways \
             WHERE network_id = ?1 ORDER BY metric, address",
        )?;
        let rows = stmt.query_map(params![id.as_i64()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut gateways = Vec::new();
        for row in rows {
            let (address, metric) = row?;
            gateways.push(GatewayRecord {
                network_id: id,
                address: address
                    .parse()
                    .map_err(|e| Error::RecordCorrupt(format!("gateway {address}: {e}")))?,
                metric: metric as u16,
            });
        }
        Ok(gateways)
    }

    pub fn add_gateway(&self, gateway: &GatewayRecord) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO gateways (network_id, address, metric) VALUES (?1, ?2, ?3)",
            params![
                gateway.network_id.as_i64(),
                gateway.address.to_string(),
                gateway.metric as i64,
            ],
        )?;
        self.bump_network_revision(gateway.network_id)?;
        Ok(())
    }

    pub fn delete_gateways(&self, id: NetworkId) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM gateways WHERE network_id = ?1",
            params![id.as_i64()],
        )?;
        self.bump_network_revision(id)?;
        Ok(())
    }
}

fn device_addr(v: i64) -> Result<DeviceAddr, Error> {
    DeviceAddr::new(v as u64).map_err(|e| Error::RecordCorrupt(e.to_string()))
}

fn ip_net(ip: &str, prefix_len: i64) -> Result<ipnet::IpNet, Error> {
    let addr =
        IpAddr::from_str(ip).map_err(|e| Error::RecordCorrupt(format!("ip {ip}: {e}")))?;
    ipnet::IpNet::new(addr, prefix_len as u8)
        .map_err(|e| Error::RecordCorrupt(format!("prefix {prefix_len}: {e}")))
}

fn member_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MemberRecord, Error>> {
    let network_id = NetworkId::from_i64(row.get(0)?);
    let node: i64 = row.get(1)?;
    let authorized: bool = row.get(2)?;
    let deauthorized: bool = row.get(3)?;
    let active_bridge: bool = row.get(4)?;
    let revision: i64 = row.get(5)?;
    let config_stale: bool = row.get(6)?;
    let creation_time: i64 = row.get(7)?;
    Ok(device_addr(node).map(|node| MemberRecord {
        network_id,
        node,
        authorized,
        deauthorized,
        active_bridge,
        revision: revision as u64,
        config_stale,
        creation_time: creation_time as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{IpAssignmentKind, RuleAction, RuleRecord};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("controller.db")).unwrap();
        (dir, store)
    }

    fn addr(v: u64) -> DeviceAddr {
        DeviceAddr::new(v).unwrap()
    }

    #[test]
    fn test_instance_id_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.db");
        let first = Store::open(&path).unwrap().instance_id().unwrap();
        let second = Store::open(&path).unwrap().instance_id().unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }

    #[test]
    fn test_network_crud() {
        let (_dir, store) = open_store();
        let id = NetworkId(0x64);

        store
            .write(|tx| tx.create_network(id, "lab", true, true, 1_000))
            .unwrap();
        let network = store.read(|tx| tx.network(id)).unwrap().unwrap();
        assert_eq!(network.name, "lab");
        assert!(network.private);
        assert!(network.open_enrollment);
        assert_eq!(network.revision, 1);

        store.write(|tx| tx.set_network_flags(id, false, false)).unwrap();
        let network = store.read(|tx| tx.network(id)).unwrap().unwrap();
        assert!(!network.open_enrollment);
        assert_eq!(network.revision, 2);

        assert_eq!(store.read(|tx| tx.list_networks()).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_network_cascades() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);
        let node = addr(0x0a);

        store
            .write(|tx| {
                tx.create_network(id, "", true, true, 0)?;
                tx.create_member(id, node, true, 0)?;
                tx.add_pool(id, "10.0.0.0/24".parse().unwrap())?;
                tx.add_rule(&RuleRecord {
                    network_id: id,
                    rule_no: 10,
                    ether_type: None,
                    action: RuleAction::Accept,
                })?;
                tx.insert_ip_assignment(&IpAssignment {
                    network_id: id,
                    node,
                    net: "10.0.0.1/24".parse().unwrap(),
                    kind: IpAssignmentKind::Address,
                })
            })
            .unwrap();

        store.write(|tx| tx.delete_network(id)).unwrap();

        store
            .read(|tx| {
                assert!(tx.network(id)?.is_none());
                assert!(tx.member(id, node)?.is_none());
                assert!(tx.pools(id, AddressFamily::V4)?.is_empty());
                assert!(tx.rules(id)?.is_empty());
                assert!(tx.ip_assignments(id, node)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_identity_binding_immutable() {
        let (_dir, store) = open_store();
        let identity = NodeIdentity::new(addr(0x0a), "key-a");

        store.write(|tx| tx.register_node(&identity, 1)).unwrap();
        // same key is idempotent
        store.write(|tx| tx.register_node(&identity, 2)).unwrap();

        let collision = NodeIdentity::new(addr(0x0a), "key-b");
        let err = store
            .write(|tx| tx.register_node(&collision, 3))
            .unwrap_err();
        assert!(matches!(err, Error::IdentityCollision(a) if a == addr(0x0a)));

        // original binding untouched
        let node = store.read(|tx| tx.node(addr(0x0a))).unwrap().unwrap();
        assert_eq!(node.public_key, "key-a");
        assert_eq!(node.first_seen, 1);
    }

    #[test]
    fn test_delete_member_releases_assignments() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);
        let node = addr(0x0a);

        store
            .write(|tx| {
                tx.create_network(id, "", true, true, 0)?;
                tx.create_member(id, node, true, 0)?;
                tx.insert_ip_assignment(&IpAssignment {
                    network_id: id,
                    node,
                    net: "10.0.0.1/24".parse().unwrap(),
                    kind: IpAssignmentKind::Address,
                })
            })
            .unwrap();

        store.write(|tx| tx.delete_member(id, node)).unwrap();

        store
            .read(|tx| {
                assert!(tx.member(id, node)?.is_none());
                assert!(tx.allocated_addresses(id, AddressFamily::V4)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_address_exclusivity_index() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);

        store
            .write(|tx| tx.create_network(id, "", true, true, 0))
            .unwrap();

        let assignment = |node: u64, kind| IpAssignment {
            network_id: id,
            node: addr(node),
            net: "10.0.0.1/24".parse().unwrap(),
            kind,
        };

        store
            .write(|tx| tx.insert_ip_assignment(&assignment(0x0a, IpAssignmentKind::Address)))
            .unwrap();
        // second holder of the same host address is rejected
        assert!(
            store
                .write(|tx| tx.insert_ip_assignment(&assignment(0x0b, IpAssignmentKind::Address)))
                .is_err()
        );
        // routed-network assignments are exempt from exclusivity
        store
            .write(|tx| tx.insert_ip_assignment(&assignment(0x0b, IpAssignmentKind::Route)))
            .unwrap();
    }

    #[test]
    fn test_rule_order_preserved() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);

        store
            .write(|tx| {
                tx.create_network(id, "", true, true, 0)?;
                for (rule_no, ether_type) in [(20, Some(0x0800)), (10, Some(0x0806)), (20, None)] {
                    tx.add_rule(&RuleRecord {
                        network_id: id,
                        rule_no,
                        ether_type,
                        action: RuleAction::Accept,
                    })?;
                }
                Ok(())
            })
            .unwrap();

        let rules = store.read(|tx| tx.rules(id)).unwrap();
        let order: Vec<_> = rules.iter().map(|r| (r.rule_no, r.ether_type)).collect();
        // sequence order, insertion order breaking the tie
        assert_eq!(order, vec![(10, Some(0x0806)), (20, Some(0x0800)), (20, None)]);
    }

    #[test]
    fn test_deauthorized_flag_tracks_revocation() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);
        let node = addr(0x0a);

        store
            .write(|tx| {
                tx.create_network(id, "", true, true, 0)?;
                tx.create_member(id, node, false, 0)
            })
            .unwrap();
        let member = |store: &Store| store.read(|tx| tx.member(id, node)).unwrap().unwrap();
        assert!(!member(&store).deauthorized);

        store
            .write(|tx| tx.set_member_authorized(id, node, true))
            .unwrap();
        assert!(!member(&store).deauthorized);

        store
            .write(|tx| tx.set_member_authorized(id, node, false))
            .unwrap();
        assert!(member(&store).deauthorized);

        // re-authorization clears the mark
        store
            .write(|tx| tx.set_member_authorized(id, node, true))
            .unwrap();
        assert!(!member(&store).deauthorized);
    }

    #[test]
    fn test_note_config_issued_bumps_once() {
        let (_dir, store) = open_store();
        let id = NetworkId(1);
        let node = addr(0x0a);

        store
            .write(|tx| {
                tx.create_network(id, "", true, true, 0)?;
                tx.create_member(id, node, true, 0)
            })
            .unwrap();

        // fresh member is stale; first issue bumps, second does not
        assert_eq!(store.write(|tx| tx.note_config_issued(id, node)).unwrap(), 2);
        assert_eq!(store.write(|tx| tx.note_config_issued(id, node)).unwrap(), 2);

        store
            .write(|tx| tx.set_member_authorized(id, node, false))
            .unwrap();
        assert_eq!(store.write(|tx| tx.note_config_issued(id, node)).unwrap(), 3);
    }
}
