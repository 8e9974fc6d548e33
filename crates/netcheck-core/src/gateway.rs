//! Default-gateway change detection.

use netcheck_nm::{GatewayState, NetworkService};
use tracing::{error, info, warn};

use crate::error::CoreError;
use crate::registry::Registry;

/// Receives "default gateway changed" events. Fire-and-forget: a failure is
/// logged by the watcher and never aborts the tick.
pub trait GatewayNotifier: Send + Sync {
    fn notify(&self, state: &GatewayState) -> Result<(), CoreError>;
}

/// Remembers the last default route and reports when it changes.
#[derive(Debug)]
pub struct GatewayWatcher<N> {
    notifier: N,
    prior: Option<GatewayState>,
}

impl<N: GatewayNotifier> GatewayWatcher<N> {
    pub fn new(notifier: N) -> Self {
        Self { notifier, prior: None }
    }

    pub fn prior(&self) -> Option<&GatewayState> {
        self.prior.as_ref()
    }

    /// Read the current default route and compare it with the prior one.
    /// The route is attributed to a connection only if that connection is in
    /// `registry`.
    pub async fn check<S: NetworkService + ?Sized>(
        &mut self,
        service: &S,
        registry: &Registry,
    ) -> Result<bool, CoreError> {
        let current = service.default_gateway_state().await?.map(|mut state| {
            state.connection_id = state.connection_id.filter(|id| registry.contains(id));
            state
        });
        Ok(self.observe(current))
    }

    /// Returns `true` when a notification was emitted. The prior snapshot is
    /// replaced by `current` in every case.
    pub fn observe(&mut self, current: Option<GatewayState>) -> bool {
        if current == self.prior {
            return false;
        }

        let notified = match &current {
            Some(state) => {
                info!(
                    gateway = %state.gateway,
                    device = %state.interface,
                    connection = state.connection_id.as_deref().unwrap_or("<unknown>"),
                    "default gateway changed"
                );
                if let Err(err) = self.notifier.notify(state) {
                    error!(error = %err, "failed to broadcast gateway change");
                }
                true
            }
            None => {
                warn!("no default gateway");
                false
            }
        };

        self.prior = current;
        notified
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use chrono::Utc;
    use netcheck_nm::mock::MockNetwork;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{RecordingNotifier, config};

    fn state(gw: u8, interface: &str, connection: &str) -> GatewayState {
        GatewayState {
            gateway: IpAddr::V4(Ipv4Addr::new(10, 0, 0, gw)),
            interface: interface.into(),
            connection_id: Some(connection.into()),
        }
    }

    #[test]
    fn route_switch_notifies_once_and_replaces_prior() {
        let notifier = RecordingNotifier::default();
        let mut watcher = GatewayWatcher::new(notifier.clone());
        watcher.observe(Some(state(1, "eth0", "wired")));
        let before = notifier.events().len();

        assert!(watcher.observe(Some(state(2, "wlan0", "wifi"))));
        assert!(!watcher.observe(Some(state(2, "wlan0", "wifi"))));

        assert_eq!(notifier.events().len(), before + 1);
        assert_eq!(watcher.prior(), Some(&state(2, "wlan0", "wifi")));
    }

    #[test]
    fn losing_the_route_updates_prior_without_notifying() {
        let notifier = RecordingNotifier::default();
        let mut watcher = GatewayWatcher::new(notifier.clone());
        watcher.observe(Some(state(1, "eth0", "wired")));

        assert!(!watcher.observe(None));
        assert_eq!(watcher.prior(), None);
        assert_eq!(notifier.events().len(), 1);

        // The same route coming back is a change again.
        assert!(watcher.observe(Some(state(1, "eth0", "wired"))));
        assert_eq!(notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn check_maps_interface_to_connection() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", None);
        nm.add_device("eth0", false, &["wired"]);
        nm.apply("eth0", Some("wired"));
        let gw = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        nm.set_default_route(Some((gw, "eth0")));

        let registry = Registry::new(&config(&["wired"]), Utc::now());
        let notifier = RecordingNotifier::default();
        let mut watcher = GatewayWatcher::new(notifier.clone());
        assert!(watcher.check(nm.as_ref(), &registry).await.expect("mock never fails"));
        assert_eq!(notifier.events(), vec![state(1, "eth0", "wired")]);
    }

    #[tokio::test]
    async fn route_over_unconfigured_profile_has_no_connection() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("guest", None);
        nm.add_device("wlan0", true, &["guest"]);
        nm.apply("wlan0", Some("guest"));
        let gw = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        nm.set_default_route(Some((gw, "wlan0")));

        let registry = Registry::new(&config(&["wired"]), Utc::now());
        let notifier = RecordingNotifier::default();
        let mut watcher = GatewayWatcher::new(notifier.clone());
        assert!(watcher.check(nm.as_ref(), &registry).await.expect("mock never fails"));

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interface, "wlan0");
        assert_eq!(events[0].connection_id, None);
    }
}
