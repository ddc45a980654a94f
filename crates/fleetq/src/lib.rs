#![deny(clippy::await_holding_refcell_ref)]

pub mod client;
pub mod common;
pub mod controller;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::FleetError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use common::wrapped::WrappedRcRefCell;

pub const FLEETQ_VERSION: &str = env!("CARGO_PKG_VERSION");
