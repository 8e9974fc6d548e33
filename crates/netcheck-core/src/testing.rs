// Test fixtures shared by the unit tests of this crate.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use netcheck_nm::GatewayState;
use netcheck_nm::mock::MockNetwork;

use crate::config::DaemonConfig;
use crate::error::CoreError;
use crate::gateway::GatewayNotifier;
use crate::prober::{DnsTransport, ProbeTarget, QueryError};

pub(crate) fn config(ids: &[&str]) -> DaemonConfig {
    DaemonConfig {
        connection_ids: ids.iter().map(|id| (*id).to_owned()).collect(),
        required_usage_connection_ids: Vec::new(),
        nameservers: vec![
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        ],
        dns_queries: vec!["example.com".into(), "example.org".into()],
        dns_timeout: Duration::from_secs(2),
        connection_activation_timeout: Duration::from_secs(10),
        connection_periodic_check_time: Duration::from_secs(60),
        available_connections_check_delay: Duration::from_secs(30),
        required_usage_max_delay: Duration::from_secs(7 * 86_400),
        required_usage_failed_retry_delay: Duration::from_secs(300),
        main_loop_delay: Duration::from_secs(5),
        periodic_status_delay: Duration::from_secs(600),
    }
}

/// DNS that answers only for connections marked reachable, looked up by
/// whatever the mock network has applied on the queried interface.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDns {
    network: Option<Arc<MockNetwork>>,
    reachable: Arc<Mutex<HashSet<String>>>,
    queries: Arc<AtomicUsize>,
}

impl FakeDns {
    pub(crate) fn reaching(network: &Arc<MockNetwork>, connections: &[&str]) -> Self {
        Self {
            network: Some(Arc::clone(network)),
            reachable: Arc::new(Mutex::new(connections.iter().map(|c| (*c).to_owned()).collect())),
            queries: Arc::default(),
        }
    }

    pub(crate) fn set_reachable(&self, connection: &str, reachable: bool) {
        let mut set = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            set.insert(connection.to_owned());
        } else {
            set.remove(connection);
        }
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsTransport for FakeDns {
    async fn query(&self, target: ProbeTarget<'_>) -> Result<(), QueryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let applied = self.network.as_ref().and_then(|nm| nm.applied_on(target.interface));
        let reachable = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        match applied {
            Some(connection) if reachable.contains(&connection) => Ok(()),
            _ => Err(QueryError::Timeout),
        }
    }
}

/// Notifier that keeps every event.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingNotifier {
    events: Arc<Mutex<Vec<GatewayState>>>,
}

impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<GatewayState> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl GatewayNotifier for RecordingNotifier {
    fn notify(&self, state: &GatewayState) -> Result<(), CoreError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        Ok(())
    }
}
