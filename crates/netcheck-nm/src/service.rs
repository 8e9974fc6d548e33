//! The seam between the activation engine and NetworkManager.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;

// ── Snapshots ───────────────────────────────────────────────────────

/// A network interface as NetworkManager reports it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub interface: String,
    /// Id of the connection currently applied, if any.
    pub applied_connection: Option<String>,
    /// Ids of the connection profiles this device could host.
    pub available_connections: Vec<String>,
    pub wireless: bool,
}

impl Device {
    /// Whether `connection_id` is among this device's available connections.
    pub fn can_host(&self, connection_id: &str) -> bool {
        self.available_connections.iter().any(|id| id == connection_id)
    }

    pub fn is_applied(&self, connection_id: &str) -> bool {
        self.applied_connection.as_deref() == Some(connection_id)
    }
}

/// The default route and the connection it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayState {
    pub gateway: IpAddr,
    pub interface: String,
    /// `None` when no device with this interface has a connection applied.
    pub connection_id: Option<String>,
}

impl GatewayState {
    /// Map the route's interface back to the connection applied on it.
    pub fn resolve(gateway: IpAddr, interface: String, devices: &[Device]) -> Self {
        let connection_id = devices
            .iter()
            .find(|device| device.interface == interface)
            .and_then(|device| device.applied_connection.clone());
        Self {
            gateway,
            interface,
            connection_id,
        }
    }
}

// ── NetworkService ──────────────────────────────────────────────────

/// Operations the daemon needs from NetworkManager.
///
/// Every call is awaited in sequence by the single control loop. Snapshots
/// returned here are never cached by callers across ticks.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Ids of every connection profile NetworkManager knows.
    async fn list_connection_ids(&self) -> Result<Vec<String>, Error>;

    async fn list_devices(&self) -> Result<Vec<Device>, Error>;

    /// Ask NetworkManager to apply `connection_id` to `interface`. Returns
    /// once the request is accepted, not once the connection is up.
    async fn activate(&self, connection_id: &str, interface: &str) -> Result<(), Error>;

    /// Deactivate `connection_id`. Succeeds when it is not active.
    async fn deactivate(&self, connection_id: &str) -> Result<(), Error>;

    /// Whether `connection_id` has finished activating.
    async fn connection_activated(&self, connection_id: &str) -> Result<bool, Error>;

    /// Interface the active `connection_id` is applied to.
    async fn connection_interface(&self, connection_id: &str) -> Result<Option<String>, Error>;

    /// IPv4 gateway of the active `connection_id`.
    async fn gateway_ip_for(&self, connection_id: &str) -> Result<Option<IpAddr>, Error>;

    /// Current default route, or `None` without one.
    async fn default_gateway_state(&self) -> Result<Option<GatewayState>, Error>;

    /// Ask every wireless device to rescan for networks.
    async fn request_scan(&self) -> Result<(), Error>;
}

#[async_trait]
impl<T: NetworkService + ?Sized> NetworkService for Arc<T> {
    async fn list_connection_ids(&self) -> Result<Vec<String>, Error> {
        (**self).list_connection_ids().await
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        (**self).list_devices().await
    }

    async fn activate(&self, connection_id: &str, interface: &str) -> Result<(), Error> {
        (**self).activate(connection_id, interface).await
    }

    async fn deactivate(&self, connection_id: &str) -> Result<(), Error> {
        (**self).deactivate(connection_id).await
    }

    async fn connection_activated(&self, connection_id: &str) -> Result<bool, Error> {
        (**self).connection_activated(connection_id).await
    }

    async fn connection_interface(&self, connection_id: &str) -> Result<Option<String>, Error> {
        (**self).connection_interface(connection_id).await
    }

    async fn gateway_ip_for(&self, connection_id: &str) -> Result<Option<IpAddr>, Error> {
        (**self).gateway_ip_for(connection_id).await
    }

    async fn default_gateway_state(&self) -> Result<Option<GatewayState>, Error> {
        (**self).default_gateway_state().await
    }

    async fn request_scan(&self) -> Result<(), Error> {
        (**self).request_scan().await
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    fn device(interface: &str, applied: Option<&str>) -> Device {
        Device {
            interface: interface.into(),
            applied_connection: applied.map(Into::into),
            available_connections: vec!["home".into(), "office".into()],
            wireless: true,
        }
    }

    #[test]
    fn device_hosting() {
        let dev = device("wlan0", Some("home"));
        assert!(dev.can_host("office"));
        assert!(!dev.can_host("wired"));
        assert!(dev.is_applied("home"));
        assert!(!dev.is_applied("office"));
    }

    #[test]
    fn gateway_resolves_connection_by_interface() {
        let devices = [device("eth0", None), device("wlan0", Some("home"))];
        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        let state = GatewayState::resolve(gw, "wlan0".into(), &devices);
        assert_eq!(state.connection_id.as_deref(), Some("home"));

        let state = GatewayState::resolve(gw, "eth0".into(), &devices);
        assert_eq!(state.connection_id, None);

        let state = GatewayState::resolve(gw, "tun0".into(), &devices);
        assert_eq!(state.connection_id, None);
    }
}
