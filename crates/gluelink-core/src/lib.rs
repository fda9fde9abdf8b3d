//! `gluelink` Core Library
//!
//! Shared functionality for the gluelink daemons:
//! - Configuration resolution (defaults, TOML file, environment)
//! - Persistent state files (host file, ready marker, tunnel record)
//! - Process-lifetime daemon locks
//! - Reconnect backoff policy
//! - Common error types

pub mod backoff;
pub mod config;
pub mod error;
pub mod lock;
pub mod state;
pub mod tracing_init;

pub use backoff::ReconnectPolicy;
pub use config::Config;
pub use error::{Error, Result};
pub use lock::{DaemonLock, DaemonVariant, LockGuard};
pub use state::{FsStateStore, StateStore, TunnelRecord};
