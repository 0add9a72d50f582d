//! Application layer containing the two-phase transfer orchestration.
//!
//! `TransferCoordinator` owns the store ports and drives transfers through the
//! protocol. `WorkerPool` runs it as a set of `tokio` tasks signalled over a
//! `watch` channel, and `retry` wraps every store call in bounded backoff.

pub mod coordinator;
pub mod retry;
pub mod worker;
