//! In-memory NetworkManager for tests.
//!
//! Connections activate instantly unless marked stalled, and every
//! activate/deactivate request is recorded so tests can assert on them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::Error;
use crate::service::{Device, GatewayState, NetworkService};

/// A request the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Activate { connection: String, interface: String },
    Deactivate { connection: String },
    RequestScan,
}

#[derive(Debug, Default)]
struct State {
    connections: Vec<String>,
    devices: Vec<Device>,
    gateways: HashMap<String, IpAddr>,
    default_route: Option<(IpAddr, String)>,
    stalled: HashSet<String>,
    refused: HashSet<String>,
    calls: Vec<Call>,
}

/// Scriptable [`NetworkService`].
#[derive(Debug, Default)]
pub struct MockNetwork {
    state: Mutex<State>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting ───────────────────────────────────────────────────

    /// Register a connection profile and the gateway it gets when active.
    pub fn add_connection(&self, id: &str, gateway: Option<IpAddr>) {
        let mut state = self.lock();
        state.connections.push(id.to_owned());
        if let Some(gateway) = gateway {
            state.gateways.insert(id.to_owned(), gateway);
        }
    }

    pub fn add_device(&self, interface: &str, wireless: bool, available: &[&str]) {
        self.lock().devices.push(Device {
            interface: interface.to_owned(),
            applied_connection: None,
            available_connections: available.iter().map(|id| (*id).to_owned()).collect(),
            wireless,
        });
    }

    pub fn set_available(&self, interface: &str, available: &[&str]) {
        let mut state = self.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.interface == interface) {
            device.available_connections = available.iter().map(|id| (*id).to_owned()).collect();
        }
    }

    /// Apply a connection behind the daemon's back (no call recorded).
    pub fn apply(&self, interface: &str, connection: Option<&str>) {
        let mut state = self.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.interface == interface) {
            device.applied_connection = connection.map(ToOwned::to_owned);
        }
    }

    /// Connections in this set never report activated.
    pub fn stall(&self, connection: &str) {
        self.lock().stalled.insert(connection.to_owned());
    }

    /// Activation requests for this connection fail as if NetworkManager
    /// had dropped off the bus.
    pub fn refuse_activation(&self, connection: &str) {
        self.lock().refused.insert(connection.to_owned());
    }

    pub fn set_default_route(&self, route: Option<(IpAddr, &str)>) {
        self.lock().default_route = route.map(|(gw, iface)| (gw, iface.to_owned()));
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn deactivations_of(&self, connection: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Deactivate { connection: c } if c == connection))
            .count()
    }

    /// Connection applied on `interface`.
    pub fn applied_on(&self, interface: &str) -> Option<String> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.interface == interface)
            .and_then(|d| d.applied_connection.clone())
    }

    fn interface_of(state: &State, connection: &str) -> Option<String> {
        state
            .devices
            .iter()
            .find(|d| d.is_applied(connection))
            .map(|d| d.interface.clone())
    }
}

#[async_trait]
impl NetworkService for MockNetwork {
    async fn list_connection_ids(&self) -> Result<Vec<String>, Error> {
        Ok(self.lock().connections.clone())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        Ok(self.lock().devices.clone())
    }

    async fn activate(&self, connection_id: &str, interface: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.connections.iter().any(|c| c == connection_id) {
            return Err(Error::UnknownConnection {
                id: connection_id.to_owned(),
            });
        }
        if !state.devices.iter().any(|d| d.interface == interface) {
            return Err(Error::UnknownDevice {
                interface: interface.to_owned(),
            });
        }
        if state.refused.contains(connection_id) {
            return Err(Error::ServiceUnavailable {
                message: format!("activation of {connection_id} refused"),
            });
        }
        state.calls.push(Call::Activate {
            connection: connection_id.to_owned(),
            interface: interface.to_owned(),
        });
        // A profile is applied to at most one device.
        for device in &mut state.devices {
            if device.is_applied(connection_id) {
                device.applied_connection = None;
            }
            if device.interface == interface {
                device.applied_connection = Some(connection_id.to_owned());
            }
        }
        Ok(())
    }

    async fn deactivate(&self, connection_id: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.calls.push(Call::Deactivate {
            connection: connection_id.to_owned(),
        });
        for device in &mut state.devices {
            if device.is_applied(connection_id) {
                device.applied_connection = None;
            }
        }
        Ok(())
    }

    async fn connection_activated(&self, connection_id: &str) -> Result<bool, Error> {
        let state = self.lock();
        Ok(!state.stalled.contains(connection_id) && Self::interface_of(&state, connection_id).is_some())
    }

    async fn connection_interface(&self, connection_id: &str) -> Result<Option<String>, Error> {
        Ok(Self::interface_of(&self.lock(), connection_id))
    }

    async fn gateway_ip_for(&self, connection_id: &str) -> Result<Option<IpAddr>, Error> {
        let state = self.lock();
        if Self::interface_of(&state, connection_id).is_none() {
            return Ok(None);
        }
        Ok(state.gateways.get(connection_id).copied())
    }

    async fn default_gateway_state(&self) -> Result<Option<GatewayState>, Error> {
        let state = self.lock();
        Ok(state
            .default_route
            .clone()
            .map(|(gateway, interface)| GatewayState::resolve(gateway, interface, &state.devices)))
    }

    async fn request_scan(&self) -> Result<(), Error> {
        self.lock().calls.push(Call::RequestScan);
        Ok(())
    }
}
