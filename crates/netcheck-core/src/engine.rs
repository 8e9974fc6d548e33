//! Per-connection state transitions.
//!
//! The engine is the only place a [`ConnectionRecord`](crate::ConnectionRecord)
//! changes state. `Inactive -> Active` happens only through a successful
//! allocator call; every `Active -> Inactive` transition releases the device.

use std::collections::BTreeSet;
use std::time::Duration;

use netcheck_nm::NetworkService;
use tracing::{debug, info, warn};

use crate::allocator::{Allocator, StealOutcome};
use crate::error::CoreError;
use crate::prober::{DnsTransport, Prober};
use crate::registry::{ConnectionState, Registry};

/// Owns the adapter handle and the prober.
#[derive(Debug)]
pub struct ActivationEngine<S, T> {
    service: S,
    prober: Prober<T>,
    activation_timeout: Duration,
}

impl<S: NetworkService, T: DnsTransport> ActivationEngine<S, T> {
    pub fn new(service: S, prober: Prober<T>, activation_timeout: Duration) -> Self {
        Self {
            service,
            prober,
            activation_timeout,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn allocator(&self) -> Allocator<'_, S, T> {
        Allocator::new(&self.service, &self.prober, self.activation_timeout)
    }

    /// Activate `id` on a free device. Marks it Active on success.
    pub async fn activate_free(&self, registry: &mut Registry, id: &str) -> Result<bool, CoreError> {
        let activated = self.allocator().activate_with_free_device(registry, id).await?;
        if activated {
            registry.set_state(id, ConnectionState::Active)?;
        }
        Ok(activated)
    }

    /// Activate `id`, displacing connections outside `excluded` if needed.
    /// A displaced connection is marked Inactive as soon as it is
    /// deactivated, even if the activation that follows fails.
    pub async fn activate_steal(
        &self,
        registry: &mut Registry,
        id: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<bool, CoreError> {
        let outcome = self
            .allocator()
            .activate_and_steal_device(registry, id, excluded)
            .await?;
        Self::apply(registry, id, &outcome)
    }

    /// Like [`activate_steal`](Self::activate_steal) without trying free
    /// devices first.
    pub async fn activate_displacing(
        &self,
        registry: &mut Registry,
        id: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<bool, CoreError> {
        let outcome = self.allocator().steal_device(registry, id, excluded).await?;
        Self::apply(registry, id, &outcome)
    }

    fn apply(registry: &mut Registry, id: &str, outcome: &StealOutcome) -> Result<bool, CoreError> {
        if !outcome.displaced.is_empty() {
            debug!(connection = id, displaced = ?outcome.displaced, "connections displaced");
        }
        if outcome.activated {
            registry.set_state(id, ConnectionState::Active)?;
        }
        Ok(outcome.activated)
    }

    /// Re-check a connection in place. An Active, reachable connection keeps
    /// its device and state.
    pub async fn check_and_validate(&self, registry: &mut Registry, id: &str) -> Result<bool, CoreError> {
        if !self.is_applied(id).await? {
            debug!(connection = id, "not applied to any device");
            self.release(registry, id).await?;
            return Ok(false);
        }

        let record = registry.record_mut(id)?;
        if self.prober.probe(&self.service, record).await? {
            record.state = ConnectionState::Active;
            return Ok(true);
        }

        warn!(connection = id, "connection failed its DNS probe, releasing device");
        self.release(registry, id).await?;
        Ok(false)
    }

    /// Bring the registry in line with NetworkManager: a connection the
    /// registry believes Active but NetworkManager no longer applies is
    /// released.
    pub async fn reconcile(&self, registry: &mut Registry, id: &str) -> Result<(), CoreError> {
        if !registry.record(id)?.is_active() || self.is_applied(id).await? {
            return Ok(());
        }
        info!(connection = id, "NetworkManager deactivated connection");
        self.release(registry, id).await
    }

    async fn is_applied(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self
            .service
            .list_devices()
            .await?
            .iter()
            .any(|device| device.is_applied(id)))
    }

    async fn release(&self, registry: &mut Registry, id: &str) -> Result<(), CoreError> {
        self.service.deactivate(id).await?;
        registry.set_state(id, ConnectionState::Inactive)
    }
}
