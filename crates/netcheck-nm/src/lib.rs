// netcheck-nm: NetworkManager adapter (system D-Bus client, retry policy, routing table)

pub mod dbus;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod retry;
pub mod route;
pub mod service;

pub use dbus::NmClient;
pub use error::{Error, TransientKind};
pub use retry::RetryPolicy;
pub use service::{Device, GatewayState, NetworkService};
