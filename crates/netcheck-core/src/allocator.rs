//! Device allocation: which device a connection is activated on, and whom
//! it displaces.
//!
//! Candidate selection is pure and works on a fresh device snapshot. The
//! [`Allocator`] then walks the candidates one by one until a device passes
//! validation (activation, readiness wait, probe).

use std::collections::BTreeSet;
use std::time::Duration;

use netcheck_nm::{Device, NetworkService};
use rand::seq::SliceRandom;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::error::CoreError;
use crate::prober::{DnsTransport, Prober};
use crate::registry::{ConnectionState, Registry};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A device worth trying and the configured connection it would displace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub interface: String,
    pub displaces: Option<String>,
}

/// Devices that can host `id` and host nothing configured right now, shuffled.
pub fn free_candidates(devices: &[Device], id: &str, registry: &Registry) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = devices
        .iter()
        .filter(|device| device.can_host(id))
        .filter(|device| {
            device
                .applied_connection
                .as_deref()
                .is_none_or(|applied| !registry.contains(applied))
        })
        .map(|device| Candidate {
            interface: device.interface.clone(),
            displaces: None,
        })
        .collect();
    candidates.shuffle(&mut rand::rng());
    candidates
}

/// Devices that can host `id` but host another configured connection that is
/// not in `excluded`, shuffled.
pub fn steal_candidates(
    devices: &[Device],
    id: &str,
    registry: &Registry,
    excluded: &BTreeSet<String>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = devices
        .iter()
        .filter(|device| device.can_host(id))
        .filter_map(|device| {
            let applied = device.applied_connection.as_deref()?;
            (applied != id && registry.contains(applied) && !excluded.contains(applied)).then(|| {
                Candidate {
                    interface: device.interface.clone(),
                    displaces: Some(applied.to_owned()),
                }
            })
        })
        .collect();
    candidates.shuffle(&mut rand::rng());
    candidates
}

/// Outcome of [`Allocator::activate_and_steal_device`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StealOutcome {
    pub activated: bool,
    /// Configured connections deactivated to free a device, in order.
    pub displaced: Vec<String>,
}

/// Activates connections on devices. Borrowed per call from the engine.
#[derive(Debug)]
pub struct Allocator<'a, S: ?Sized, T> {
    service: &'a S,
    prober: &'a Prober<T>,
    activation_timeout: Duration,
}

impl<'a, S, T> Allocator<'a, S, T>
where
    S: NetworkService + ?Sized,
    T: DnsTransport,
{
    pub fn new(service: &'a S, prober: &'a Prober<T>, activation_timeout: Duration) -> Self {
        Self {
            service,
            prober,
            activation_timeout,
        }
    }

    /// Activate `id` on a device no configured connection is using.
    pub async fn activate_with_free_device(&self, registry: &mut Registry, id: &str) -> Result<bool, CoreError> {
        let devices = self.service.list_devices().await?;
        if devices.iter().any(|device| device.is_applied(id)) {
            debug!(connection = id, "already applied, validating in place");
            return self.validate(registry, id).await;
        }

        let candidates = free_candidates(&devices, id, registry);
        debug!(connection = id, candidates = candidates.len(), "trying free devices");
        self.try_candidates(registry, id, &candidates, &mut Vec::new()).await
    }

    /// Activate `id` on a free device, or failing that on a device held by a
    /// configured connection outside `excluded`.
    pub async fn activate_and_steal_device(
        &self,
        registry: &mut Registry,
        id: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<StealOutcome, CoreError> {
        let devices = self.service.list_devices().await?;
        if devices.iter().any(|device| device.is_applied(id)) {
            debug!(connection = id, "already applied, validating in place");
            let activated = self.validate(registry, id).await?;
            return Ok(StealOutcome {
                activated,
                displaced: Vec::new(),
            });
        }

        let mut displaced = Vec::new();
        let free = free_candidates(&devices, id, registry);
        if self.try_candidates(registry, id, &free, &mut displaced).await? {
            return Ok(StealOutcome {
                activated: true,
                displaced,
            });
        }

        let mut outcome = self.steal_device(registry, id, excluded).await?;
        displaced.append(&mut outcome.displaced);
        outcome.displaced = displaced;
        Ok(outcome)
    }

    /// Activate `id` only on devices held by configured connections outside
    /// `excluded`. Free devices are not tried.
    pub async fn steal_device(
        &self,
        registry: &mut Registry,
        id: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<StealOutcome, CoreError> {
        let devices = self.service.list_devices().await?;
        let steal = steal_candidates(&devices, id, registry, excluded);
        debug!(connection = id, candidates = steal.len(), "trying to steal a device");
        let mut displaced = Vec::new();
        let activated = self.try_candidates(registry, id, &steal, &mut displaced).await?;
        Ok(StealOutcome { activated, displaced })
    }

    async fn try_candidates(
        &self,
        registry: &mut Registry,
        id: &str,
        candidates: &[Candidate],
        displaced: &mut Vec<String>,
    ) -> Result<bool, CoreError> {
        let mut index = 0;
        while let Some(candidate) = candidates.get(index) {
            index += 1;

            if let Some(victim) = &candidate.displaces {
                info!(connection = id, displaced = %victim, device = %candidate.interface, "displacing connection");
                self.service.deactivate(victim).await?;
                registry.set_state(victim, ConnectionState::Inactive)?;
                displaced.push(victim.clone());
            }

            debug!(connection = id, device = %candidate.interface, "activating");
            self.service.activate(id, &candidate.interface).await?;
            if self.validate(registry, id).await? {
                info!(connection = id, device = %candidate.interface, "connection activated and reachable");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Readiness wait and probe. Deactivates `id` and counts the failure on
    /// the record when either fails.
    async fn validate(&self, registry: &mut Registry, id: &str) -> Result<bool, CoreError> {
        let record = registry.record_mut(id)?;
        let activated = self.wait_until_activated(id).await?;
        if activated && self.prober.probe(self.service, record).await? {
            return Ok(true);
        }

        if activated {
            debug!(connection = id, "probe failed after activation");
        } else {
            debug!(
                connection = id,
                timeout = %humantime::format_duration(self.activation_timeout),
                "connection did not finish activating"
            );
        }
        record.failed_activations = record.failed_activations.saturating_add(1);
        self.service.deactivate(id).await?;
        Ok(false)
    }

    async fn wait_until_activated(&self, id: &str) -> Result<bool, CoreError> {
        let deadline = Instant::now() + self.activation_timeout;
        loop {
            if self.service.connection_activated(id).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(READINESS_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
