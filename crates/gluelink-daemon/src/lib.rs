//! gluelink daemon library
//!
//! Keeps the SSH forwarding path between a notebook host and its development
//! endpoint alive:
//! - Tunnel supervisor (check-and-repair of the keeper process)
//! - Connectivity daemon (end-to-end probe, teardown when unreachable)
//! - Tunnel keeper (ssh child with bounded backoff)
//! - One-time bootstrap guarded by a ready marker
//! - Periodic runner and cron schedule rendering

pub mod bootstrap;
pub mod cmd;
pub mod context;
pub mod invocation;
pub mod probe;
pub mod process;
pub mod reconnect;
pub mod runner;
pub mod schedule;
pub mod supervisor;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use context::DaemonContext;
pub use invocation::{Invocation, guarded};
