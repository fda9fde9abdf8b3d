//! The forwarding session itself.
//!
//! The supervisor launches a keeper (`gluelink tunnel`) detached in its own
//! process group. The keeper runs `ssh -N -L ...` and restarts it with a
//! bounded backoff; when the backoff is exhausted it exits and the next
//! supervisor cycle starts a fresh keeper.

pub mod keeper;
pub mod launcher;
pub mod ssh;

pub use keeper::{KeeperError, TunnelKeeper};
pub use launcher::{KeeperLauncher, LaunchError, TunnelLauncher};
pub use ssh::SshTunnelSpec;
