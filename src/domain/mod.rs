//! Domain layer: ledger records, the two-phase protocol states, and the store
//! ports the coordinator drives.

pub mod account;
pub mod ports;
pub mod transaction;
