//! Authoritative membership and configuration controller for the
//! netweft overlay.
//!
//! Every device that wants to participate in a logical network asks
//! this controller for its configuration; the controller decides
//! whether the device is authorized and, if so, what addresses, rules,
//! routes, relays, and gateways it receives. The cryptographic
//! transport that carries requests and signed responses, and the HTTP
//! control plane operators use to administer networks, live outside
//! this crate; the latter consumes [`store::Store`] directly.

pub mod controller;
pub mod identity;
pub mod store;
