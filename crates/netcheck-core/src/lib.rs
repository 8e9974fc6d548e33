// netcheck-core: connection activation engine between netcheck-nm and the daemon binary.

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod prober;
pub mod registry;
pub mod schedule;
pub mod scheduler;

#[cfg(test)]
mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::DaemonConfig;
pub use engine::ActivationEngine;
pub use error::CoreError;
pub use gateway::{GatewayNotifier, GatewayWatcher};
pub use prober::{DnsTransport, Prober, QueryError, UdpTransport};
pub use registry::{ConnectionRecord, ConnectionState, Registry};
pub use scheduler::Scheduler;
