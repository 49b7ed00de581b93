//! SQLite schema for the controller state.
//!
//! Conventions: 64-bit ids are stored as INTEGER (two's complement),
//! addresses and CIDRs as canonical TEXT, timestamps as epoch
//! milliseconds. WAL mode keeps readers concurrent with the single
//! writer. Foreign keys are informational only; all cascades are
//! performed explicitly inside one transaction.

pub(crate) const SCHEMA_VERSION: i32 = 1;

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    k TEXT PRIMARY KEY NOT NULL,
    v TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS networks (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    private INTEGER NOT NULL DEFAULT 1,
    open_enrollment INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 1,
    creation_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    address INTEGER PRIMARY KEY NOT NULL,
    public_key TEXT NOT NULL,
    first_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    network_id INTEGER NOT NULL REFERENCES networks(id),
    node_address INTEGER NOT NULL REFERENCES nodes(address),
    authorized INTEGER NOT NULL DEFAULT 0,
    deauthorized INTEGER NOT NULL DEFAULT 0,
    active_bridge INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 1,
    config_stale INTEGER NOT NULL DEFAULT 1,
    creation_time INTEGER NOT NULL,
    PRIMARY KEY (network_id, node_address)
);

CREATE INDEX IF NOT EXISTS idx_members_bridges
    ON members(network_id, active_bridge);

CREATE TABLE IF NOT EXISTS ip_assignments (
    network_id INTEGER NOT NULL REFERENCES networks(id),
    node_address INTEGER NOT NULL,
    ip TEXT NOT NULL,
    prefix_len INTEGER NOT NULL,
    family INTEGER NOT NULL,
    kind INTEGER NOT NULL DEFAULT 0
);

-- Exclusivity invariant for host-address assignments: one holder per
-- (network, family, address). Routed-network assignments are exempt.
CREATE UNIQUE INDEX IF NOT EXISTS idx_ip_assignments_excl
    ON ip_assignments(network_id, family, ip) WHERE kind = 0;

CREATE INDEX IF NOT EXISTS idx_ip_assignments_node
    ON ip_assignments(network_id, node_address);

CREATE TABLE IF NOT EXISTS ip_assignment_pools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id),
    pool TEXT NOT NULL,
    family INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pools_network
    ON ip_assignment_pools(network_id, family);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id),
    rule_no INTEGER NOT NULL,
    ether_type INTEGER,
    action TEXT NOT NULL DEFAULT 'accept'
);

CREATE INDEX IF NOT EXISTS idx_rules_order
    ON rules(network_id, rule_no);

CREATE TABLE IF NOT EXISTS routes (
    network_id INTEGER NOT NULL REFERENCES networks(id),
    dest TEXT NOT NULL,
    via TEXT,
    PRIMARY KEY (network_id, dest)
);

CREATE TABLE IF NOT EXISTS relays (
    network_id INTEGER NOT NULL REFERENCES networks(id),
    node_address INTEGER NOT NULL,
    endpoint TEXT,
    PRIMARY KEY (network_id, node_address)
);

CREATE TABLE IF NOT EXISTS gateways (
    network_id INTEGER NOT NULL REFERENCES networks(id),
    address TEXT NOT NULL,
    metric INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (network_id, address)
);
"#;
