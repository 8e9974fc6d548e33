// NmClient: NetworkService over the system bus.
//
// Public (trait) methods wrap exactly one retry boundary around a private
// `raw_*` method. `raw_*` methods only call each other and never retry.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, info, trace};
use zbus::Connection;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use super::proxies::{
    ACTIVE_STATE_ACTIVATED, ActiveConnectionProxy, DEVICE_TYPE_WIFI, Ip4ConfigProxy,
    NetworkManagerProxy, NmDeviceProxy, SettingsConnectionProxy, SettingsProxy, WirelessProxy,
};
use crate::error::Error;
use crate::retry::RetryPolicy;
use crate::route;
use crate::service::{Device, GatewayState, NetworkService};

/// An active connection as read in one pass.
struct ActiveInfo {
    path: OwnedObjectPath,
    state: u32,
    devices: Vec<OwnedObjectPath>,
    ip4_config: OwnedObjectPath,
}

/// Owned handle to NetworkManager on the system bus.
///
/// Created once at startup by [`NmClient::connect`] and passed to the engine.
#[derive(Debug, Clone)]
pub struct NmClient {
    bus: Connection,
    retry: RetryPolicy,
}

impl NmClient {
    /// Connect to the system bus and check NetworkManager answers.
    ///
    /// `init` bounds this startup step; `retry` is the budget every later
    /// call gets.
    pub async fn connect(init: &RetryPolicy, retry: RetryPolicy) -> Result<Self, Error> {
        let retry = &retry;
        init.run("connect", || async move {
            let client = Self {
                bus: Connection::system().await?,
                retry: retry.clone(),
            };
            let version = client.manager().await?.version().await?;
            info!(version = %version, "connected to NetworkManager");
            Ok(client)
        })
        .await
    }

    // ── Proxies ─────────────────────────────────────────────────────

    async fn manager(&self) -> Result<NetworkManagerProxy<'static>, Error> {
        Ok(NetworkManagerProxy::builder(&self.bus)
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn settings(&self) -> Result<SettingsProxy<'static>, Error> {
        Ok(SettingsProxy::builder(&self.bus)
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn profile_proxy<'p>(
        &self,
        path: &'p OwnedObjectPath,
    ) -> Result<SettingsConnectionProxy<'p>, Error> {
        Ok(SettingsConnectionProxy::builder(&self.bus)
            .path(path.as_str())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn device_proxy<'p>(&self, path: &'p OwnedObjectPath) -> Result<NmDeviceProxy<'p>, Error> {
        Ok(NmDeviceProxy::builder(&self.bus)
            .path(path.as_str())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn active_proxy<'p>(
        &self,
        path: &'p OwnedObjectPath,
    ) -> Result<ActiveConnectionProxy<'p>, Error> {
        Ok(ActiveConnectionProxy::builder(&self.bus)
            .path(path.as_str())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    // ── Raw calls (no retry) ────────────────────────────────────────

    /// Every saved profile as (settings path, id).
    async fn raw_profiles(&self) -> Result<Vec<(OwnedObjectPath, String)>, Error> {
        let paths = self.settings().await?.list_connections().await?;
        let mut profiles = Vec::with_capacity(paths.len());
        for path in paths {
            let settings = self.profile_proxy(&path).await?.get_settings().await?;
            let id = settings
                .get("connection")
                .and_then(|section| section.get("id"))
                .ok_or_else(|| Error::malformed("connection settings", format!("{} has no id", path.as_str())))?;
            let Value::Str(id) = &**id else {
                return Err(Error::malformed("connection id", format!("{} id is not a string", path.as_str())));
            };
            let id = id.as_str().to_owned();
            profiles.push((path, id));
        }
        Ok(profiles)
    }

    async fn raw_profile_path(&self, connection_id: &str) -> Result<OwnedObjectPath, Error> {
        self.raw_profiles()
            .await?
            .into_iter()
            .find_map(|(path, id)| (id == connection_id).then_some(path))
            .ok_or_else(|| Error::UnknownConnection {
                id: connection_id.to_owned(),
            })
    }

    /// The active connection for `connection_id`, if it is active at all.
    async fn raw_active(&self, connection_id: &str) -> Result<Option<ActiveInfo>, Error> {
        for path in self.manager().await?.active_connections().await? {
            let active = self.active_proxy(&path).await?;
            if active.id().await? != connection_id {
                continue;
            }
            let info = ActiveInfo {
                state: active.state().await?,
                devices: active.devices().await?,
                ip4_config: active.ip4_config().await?,
                path: path.clone(),
            };
            return Ok(Some(info));
        }
        Ok(None)
    }

    async fn raw_devices(&self) -> Result<Vec<(OwnedObjectPath, Device)>, Error> {
        let ids_by_path: HashMap<OwnedObjectPath, String> = self.raw_profiles().await?.into_iter().collect();
        let paths = self.manager().await?.get_devices().await?;

        let mut devices = Vec::with_capacity(paths.len());
        for path in paths {
            let proxy = self.device_proxy(&path).await?;
            let active_path = proxy.active_connection().await?;
            let applied_connection = if is_null_path(&active_path) {
                None
            } else {
                Some(self.active_proxy(&active_path).await?.id().await?)
            };
            let available_connections = proxy
                .available_connections()
                .await?
                .iter()
                .filter_map(|profile| ids_by_path.get(profile).cloned())
                .collect();
            let device = Device {
                interface: proxy.interface().await?,
                applied_connection,
                available_connections,
                wireless: proxy.device_type().await? == DEVICE_TYPE_WIFI,
            };
            devices.push((path, device));
        }
        Ok(devices)
    }

    async fn raw_device_path(&self, interface: &str) -> Result<OwnedObjectPath, Error> {
        self.raw_devices()
            .await?
            .into_iter()
            .find_map(|(path, device)| (device.interface == interface).then_some(path))
            .ok_or_else(|| Error::UnknownDevice {
                interface: interface.to_owned(),
            })
    }

    async fn raw_activate(&self, connection_id: &str, interface: &str) -> Result<(), Error> {
        let profile = self.raw_profile_path(connection_id).await?;
        let device = self.raw_device_path(interface).await?;
        let active = self
            .manager()
            .await?
            .activate_connection(&profile, &device, &ObjectPath::try_from("/")?)
            .await?;
        debug!(connection = connection_id, device = interface, active = %active.as_str(), "activation requested");
        Ok(())
    }

    async fn raw_deactivate(&self, connection_id: &str) -> Result<(), Error> {
        let Some(active) = self.raw_active(connection_id).await? else {
            trace!(connection = connection_id, "not active, nothing to deactivate");
            return Ok(());
        };
        self.manager().await?.deactivate_connection(&active.path).await?;
        debug!(connection = connection_id, "deactivation requested");
        Ok(())
    }

    async fn raw_connection_interface(&self, connection_id: &str) -> Result<Option<String>, Error> {
        let Some(active) = self.raw_active(connection_id).await? else {
            return Ok(None);
        };
        let Some(device) = active.devices.first() else {
            return Ok(None);
        };
        Ok(Some(self.device_proxy(device).await?.interface().await?))
    }

    async fn raw_gateway_ip_for(&self, connection_id: &str) -> Result<Option<IpAddr>, Error> {
        let Some(active) = self.raw_active(connection_id).await? else {
            return Ok(None);
        };
        if is_null_path(&active.ip4_config) {
            return Ok(None);
        }
        let gateway = Ip4ConfigProxy::builder(&self.bus)
            .path(active.ip4_config.as_str())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?
            .gateway()
            .await?;
        if gateway.is_empty() {
            return Ok(None);
        }
        gateway
            .parse()
            .map(Some)
            .map_err(|e| Error::malformed("gateway address", format!("{gateway}: {e}")))
    }

    async fn raw_default_gateway_state(&self) -> Result<Option<GatewayState>, Error> {
        let Some(default) = route::read_default_route().await? else {
            return Ok(None);
        };
        let devices: Vec<Device> = self.raw_devices().await?.into_iter().map(|(_, d)| d).collect();
        Ok(Some(GatewayState::resolve(
            IpAddr::V4(default.gateway),
            default.interface,
            &devices,
        )))
    }

    async fn raw_request_scan(&self) -> Result<(), Error> {
        for (path, device) in self.raw_devices().await? {
            if !device.wireless {
                continue;
            }
            let wireless = WirelessProxy::builder(&self.bus)
                .path(path.as_str())?
                .cache_properties(CacheProperties::No)
                .build()
                .await?;
            match wireless.request_scan(HashMap::new()).await.map_err(Error::from) {
                Ok(()) => debug!(device = %device.interface, "wireless scan requested"),
                // NetworkManager rate-limits scans; a refused scan is not a fault.
                Err(Error::Bus(err)) => debug!(device = %device.interface, error = %err, "scan refused"),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn is_null_path(path: &OwnedObjectPath) -> bool {
    path.as_str() == "/"
}

#[async_trait]
impl NetworkService for NmClient {
    async fn list_connection_ids(&self) -> Result<Vec<String>, Error> {
        self.retry
            .run("list_connection_ids", || async move {
                Ok(self.raw_profiles().await?.into_iter().map(|(_, id)| id).collect())
            })
            .await
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        self.retry
            .run("list_devices", || async move {
                Ok(self.raw_devices().await?.into_iter().map(|(_, d)| d).collect())
            })
            .await
    }

    async fn activate(&self, connection_id: &str, interface: &str) -> Result<(), Error> {
        self.retry
            .run("activate", || self.raw_activate(connection_id, interface))
            .await
    }

    async fn deactivate(&self, connection_id: &str) -> Result<(), Error> {
        self.retry
            .run("deactivate", || self.raw_deactivate(connection_id))
            .await
    }

    async fn connection_activated(&self, connection_id: &str) -> Result<bool, Error> {
        self.retry
            .run("connection_activated", || async move {
                Ok(self
                    .raw_active(connection_id)
                    .await?
                    .is_some_and(|active| active.state == ACTIVE_STATE_ACTIVATED))
            })
            .await
    }

    async fn connection_interface(&self, connection_id: &str) -> Result<Option<String>, Error> {
        self.retry
            .run("connection_interface", || self.raw_connection_interface(connection_id))
            .await
    }

    async fn gateway_ip_for(&self, connection_id: &str) -> Result<Option<IpAddr>, Error> {
        self.retry
            .run("gateway_ip_for", || self.raw_gateway_ip_for(connection_id))
            .await
    }

    async fn default_gateway_state(&self) -> Result<Option<GatewayState>, Error> {
        self.retry
            .run("default_gateway_state", || self.raw_default_gateway_state())
            .await
    }

    async fn request_scan(&self) -> Result<(), Error> {
        self.retry.run("request_scan", || self.raw_request_scan()).await
    }
}
