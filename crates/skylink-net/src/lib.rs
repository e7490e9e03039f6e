//! Network path control for the Skylink companion computer.
//!
//! Four cooperating services keep the cellular uplink usable while the
//! aircraft is airborne:
//!
//! - [`probe::LatencyMonitor`] — parallel reachability probes with rolling
//!   per-target statistics
//! - [`optimizer::NetworkOptimizer`] — the reversible "flight mode" bundle
//!   of host tuning (MTU, congestion control, DSCP, CAKE, policy routing)
//! - [`pool::ModemPool`] — modem enumeration, scoring, and atomic path
//!   switching guarded by VPN health
//! - [`failover::AutoFailover`] — the hysteresis state machine that decides
//!   when to switch
//!
//! All external I/O goes through the [`command::SystemCommand`] trait so
//! tests can script every shell-out.

pub mod command;
pub mod failover;
pub mod iface;
pub mod modem_ctl;
pub mod optimizer;
pub mod pool;
pub mod probe;
pub mod score;
mod task;
pub mod vpn;

pub use command::{BoxFuture, CommandOutput, MockRunner, ShellRunner, SystemCommand};
