//! The main loop.
//!
//! One tick runs these passes in order:
//!
//! 1. required-usage connections that are due are used, stealing if needed;
//! 2. Active connections due for a health check are re-probed;
//! 3. every connection is reconciled with NetworkManager and Inactive ones
//!    try to get a device, first a free one, then one held by a
//!    lower-priority connection;
//! 4. wireless devices rescan now and then;
//! 5. default-gateway changes are broadcast;
//! 6. changes in the Active set are logged.
//!
//! A connection whose activation just failed may not displace another one
//! until `connection_periodic_check_time` plus a random share of it has
//! passed. Connections used by the required-usage pass are never displaced
//! in the same tick.
//!
//! Everything runs sequentially on one task; the loop only observes shutdown
//! while sleeping between ticks.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use netcheck_nm::NetworkService;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::engine::ActivationEngine;
use crate::error::CoreError;
use crate::gateway::{GatewayNotifier, GatewayWatcher};
use crate::prober::{DnsTransport, Prober};
use crate::registry::Registry;
use crate::schedule::{after, randomly_after};

pub struct Scheduler<S, T, N> {
    config: DaemonConfig,
    engine: ActivationEngine<S, T>,
    registry: Registry,
    gateway: GatewayWatcher<N>,
    next_scan: DateTime<Utc>,
    next_status_report: DateTime<Utc>,
    previous_active: BTreeSet<String>,
}

impl<S, T, N> Scheduler<S, T, N>
where
    S: NetworkService,
    T: DnsTransport,
    N: GatewayNotifier,
{
    /// Validate `config` against NetworkManager and build the initial state.
    ///
    /// Fails with [`CoreError::UnknownConnection`] if any configured id is
    /// not a NetworkManager profile.
    pub async fn initialize(config: DaemonConfig, service: S, transport: T, notifier: N) -> Result<Self, CoreError> {
        config.validate()?;

        let known: HashSet<String> = service.list_connection_ids().await?.into_iter().collect();
        if let Some(missing) = config.connection_ids.iter().find(|id| !known.contains(*id)) {
            return Err(CoreError::UnknownConnection { id: missing.clone() });
        }
        debug!(profiles = known.len(), "all configured connections are known");

        let now = Utc::now();
        let prober = Prober::new(transport, config.nameservers.clone(), config.dns_queries.clone());
        Ok(Self {
            engine: ActivationEngine::new(service, prober, config.connection_activation_timeout),
            registry: Registry::new(&config, now),
            gateway: GatewayWatcher::new(notifier),
            next_scan: randomly_after(now, config.available_connections_check_delay),
            next_status_report: now,
            previous_active: BTreeSet::new(),
            config,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gateway(&self) -> &GatewayWatcher<N> {
        &self.gateway
    }

    /// Run ticks until `shutdown` fires. A failed tick is logged and the
    /// loop carries on.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            connections = ?self.config.connection_ids,
            delay = %humantime::format_duration(self.config.main_loop_delay),
            "main loop starting"
        );
        loop {
            if let Err(err) = self.tick().await {
                error!(error = %err, details = ?err, "main loop iteration failed");
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.main_loop_delay) => {}
            }
        }
        info!("main loop stopped");
    }

    pub async fn tick(&mut self) -> Result<(), CoreError> {
        self.tick_at(Utc::now()).await
    }

    /// One iteration with an explicit clock for the schedules.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let used = self.required_usage_pass(now).await?;
        self.health_check_pass(now).await?;
        self.reconcile_pass(now, &used).await?;
        self.scan_pass(now).await?;
        self.gateway.check(self.engine.service(), &self.registry).await?;
        self.log_changes(now);
        Ok(())
    }

    // ── Passes ──────────────────────────────────────────────────────

    /// Returns the required-usage connections used in this tick.
    async fn required_usage_pass(&mut self, now: DateTime<Utc>) -> Result<BTreeSet<String>, CoreError> {
        let mut used_ids = BTreeSet::new();
        for id in self.registry.required_usage_ids() {
            let record = self.registry.record(&id)?;
            if !record.required_usage_due(now) {
                continue;
            }
            let was_active = record.is_active();
            info!(connection = %id, "required-usage connection is due");

            let mut used = was_active && self.engine.check_and_validate(&mut self.registry, &id).await?;
            if !used {
                used = self
                    .engine
                    .activate_steal(&mut self.registry, &id, &BTreeSet::new())
                    .await?;
            }

            let record = self.registry.record_mut(&id)?;
            if used {
                let next = randomly_after(now, self.config.required_usage_max_delay);
                record.required_usage_next = Some(next);
                record.required_usage_failed_retry = None;
                info!(connection = %id, next = %next, "required-usage connection used");
                used_ids.insert(id);
            } else {
                let retry = randomly_after(now, self.config.required_usage_failed_retry_delay);
                record.required_usage_failed_retry = Some(retry);
                error!(connection = %id, retry = %retry, "failed to use required-usage connection");
            }
        }
        Ok(used_ids)
    }

    async fn health_check_pass(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        for id in self.registry.ids() {
            let record = self.registry.record(&id)?;
            if record.next_periodic_check > now {
                continue;
            }
            if record.is_active() {
                debug!(connection = %id, "periodic health check");
                self.engine.check_and_validate(&mut self.registry, &id).await?;
            }
            self.registry.record_mut(&id)?.next_periodic_check =
                randomly_after(now, self.config.connection_periodic_check_time);
        }
        Ok(())
    }

    async fn reconcile_pass(&mut self, now: DateTime<Utc>, used: &BTreeSet<String>) -> Result<(), CoreError> {
        for id in self.registry.ids() {
            self.engine.reconcile(&mut self.registry, &id).await?;
            let record = self.registry.record(&id)?;
            if record.is_active() {
                continue;
            }
            let (priority, failures) = (record.priority, record.failed_activations);

            if self.engine.activate_free(&mut self.registry, &id).await? {
                continue;
            }
            if self.registry.record(&id)?.preemption_due(now) {
                // Only strictly lower-priority connections not just used for
                // required usage may be displaced.
                let mut excluded = self.registry.ids_up_to(priority);
                excluded.extend(used.iter().cloned());
                if self
                    .engine
                    .activate_displacing(&mut self.registry, &id, &excluded)
                    .await?
                {
                    continue;
                }
            }

            let record = self.registry.record_mut(&id)?;
            if record.failed_activations != failures {
                let period = self.config.connection_periodic_check_time;
                let next = randomly_after(after(now, period), period);
                record.next_preemption = Some(next);
                debug!(connection = %id, next = %next, "activation failed, deferring preemption");
            }
        }
        Ok(())
    }

    async fn scan_pass(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if now < self.next_scan {
            return Ok(());
        }
        self.next_scan = randomly_after(now, self.config.available_connections_check_delay);
        debug!("requesting wireless scan");
        self.engine.service().request_scan().await?;
        Ok(())
    }

    fn log_changes(&mut self, now: DateTime<Utc>) {
        let current = self.registry.active_ids();

        if current != self.previous_active {
            for added in current.difference(&self.previous_active) {
                info!(connection = %added, "connection is now active");
            }
            for removed in self.previous_active.difference(&current) {
                warn!(connection = %removed, "connection is no longer active");
            }
            if current.is_empty() {
                error!("no connection is active");
            }
        }

        if now >= self.next_status_report {
            info!(active = ?current, "status");
            self.next_status_report = randomly_after(now, self.config.periodic_status_delay);
        }

        self.previous_active = current;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use chrono::TimeDelta;
    use netcheck_nm::mock::{Call, MockNetwork};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeDns, RecordingNotifier, config};

    type TestScheduler = Scheduler<Arc<MockNetwork>, FakeDns, RecordingNotifier>;

    const GW: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

    async fn scheduler(nm: &Arc<MockNetwork>, dns: FakeDns, cfg: DaemonConfig) -> TestScheduler {
        Scheduler::initialize(cfg, Arc::clone(nm), dns, RecordingNotifier::default())
            .await
            .expect("valid configuration")
    }

    fn active(s: &TestScheduler) -> Vec<String> {
        s.registry().active_ids().into_iter().collect()
    }

    fn activations_of(nm: &MockNetwork, id: &str) -> usize {
        nm.calls()
            .iter()
            .filter(|call| matches!(call, Call::Activate { connection, .. } if connection == id))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_connection_is_rejected_at_startup() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", None);
        let result = Scheduler::initialize(
            config(&["wired", "ghost"]),
            Arc::clone(&nm),
            FakeDns::default(),
            RecordingNotifier::default(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::UnknownConnection { id }) if id == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_connection_loses_to_working_one() {
        let nm = Arc::new(MockNetwork::new());
        for id in ["wired", "wifi-a", "wifi-b"] {
            nm.add_connection(id, Some(GW));
        }
        nm.add_device("wlan0", true, &["wifi-a", "wifi-b"]);
        let dns = FakeDns::reaching(&nm, &["wifi-b"]);
        let mut s = scheduler(&nm, dns.clone(), config(&["wired", "wifi-a", "wifi-b"])).await;

        s.tick_at(Utc::now()).await.expect("tick");

        assert_eq!(active(&s), vec!["wifi-b".to_owned()]);
        assert_eq!(nm.applied_on("wlan0").as_deref(), Some("wifi-b"));
        // wifi-a was tried with both probe queries and released.
        assert!(nm.deactivations_of("wifi-a") >= 1);
        assert!(dns.queries() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn required_usage_success_schedules_within_max_delay() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("lte", Some(GW));
        nm.add_device("wwan0", false, &["lte"]);
        let mut cfg = config(&["lte"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let max = cfg.required_usage_max_delay;
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["lte"]), cfg).await;

        let t = Utc::now();
        s.tick_at(t).await.expect("tick");

        let record = s.registry().get("lte").expect("configured");
        let next = record.required_usage_next.expect("scheduled");
        assert!(next >= t);
        assert!(next <= t + TimeDelta::from_std(max).expect("fits"));
        assert_eq!(record.required_usage_failed_retry, None);
    }

    #[tokio::test(start_paused = true)]
    async fn required_usage_failure_schedules_short_retry() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("lte", Some(GW));
        nm.add_device("wwan0", false, &["lte"]);
        let mut cfg = config(&["lte"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let retry_max = cfg.required_usage_failed_retry_delay;
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &[]), cfg).await;

        let t = Utc::now();
        s.tick_at(t).await.expect("tick");

        let record = s.registry().get("lte").expect("configured");
        let retry = record.required_usage_failed_retry.expect("retry scheduled");
        assert!(retry >= t && retry <= t + TimeDelta::from_std(retry_max).expect("fits"));
        assert_eq!(record.required_usage_next, None);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_steals_shared_device() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("a", Some(GW));
        nm.add_connection("b", Some(GW));
        nm.add_device("wlan0", true, &["b"]);
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["a", "b"]), config(&["a", "b"])).await;

        s.tick_at(Utc::now()).await.expect("tick");
        assert_eq!(active(&s), vec!["b".to_owned()]);

        // "a" comes into range on the same device.
        nm.set_available("wlan0", &["a", "b"]);
        nm.clear_calls();
        s.tick_at(Utc::now()).await.expect("tick");

        assert_eq!(active(&s), vec!["a".to_owned()]);
        assert_eq!(nm.applied_on("wlan0").as_deref(), Some("a"));
        assert_eq!(nm.deactivations_of("b"), 1);
        assert!(!nm.calls().contains(&Call::Deactivate { connection: "a".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn working_connection_survives_failing_higher_priority() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("a", Some(GW));
        nm.add_connection("b", Some(GW));
        nm.add_device("wlan0", true, &["a", "b"]);
        let cfg = config(&["a", "b"]);
        let backoff = TimeDelta::from_std(cfg.connection_periodic_check_time).expect("fits");
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["b"]), cfg).await;

        let t = Utc::now();
        for tick in 0..5 {
            s.tick_at(t + TimeDelta::seconds(5 * tick)).await.expect("tick");
        }

        assert_eq!(active(&s), vec!["b".to_owned()]);
        assert_eq!(nm.deactivations_of("b"), 0);
        assert_eq!(activations_of(&nm, "a"), 1);
        let deferred = s.registry().get("a").and_then(|r| r.next_preemption).expect("deferred");
        assert!(deferred >= t + backoff);

        // Once the backoff has passed, "a" gets one more try and "b" comes back.
        nm.clear_calls();
        s.tick_at(t + backoff * 2 + TimeDelta::seconds(1)).await.expect("tick");

        assert_eq!(activations_of(&nm, "a"), 1);
        assert_eq!(nm.deactivations_of("b"), 1);
        assert_eq!(active(&s), vec!["b".to_owned()]);
        assert_eq!(nm.applied_on("wlan0").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn required_usage_displaces_higher_priority_for_one_tick() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", Some(GW));
        nm.add_connection("lte", Some(GW));
        nm.add_device("usb0", false, &["wired"]);
        let mut cfg = config(&["wired", "lte"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let max = TimeDelta::from_std(cfg.required_usage_max_delay).expect("fits");
        let retry_max = TimeDelta::from_std(cfg.required_usage_failed_retry_delay).expect("fits");
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["wired", "lte"]), cfg).await;

        // "lte" cannot use the device yet, so "wired" takes it.
        let t = Utc::now();
        s.tick_at(t).await.expect("tick");
        assert_eq!(active(&s), vec!["wired".to_owned()]);

        nm.set_available("usb0", &["wired", "lte"]);
        nm.clear_calls();
        let due = t + retry_max + TimeDelta::seconds(1);
        s.tick_at(due).await.expect("tick");

        assert_eq!(active(&s), vec!["lte".to_owned()]);
        assert_eq!(
            s.registry().get("wired").map(|r| r.state),
            Some(crate::registry::ConnectionState::Inactive)
        );
        assert_eq!(nm.deactivations_of("wired"), 1);
        assert_eq!(nm.deactivations_of("lte"), 0);
        let next = s.registry().get("lte").and_then(|r| r.required_usage_next).expect("scheduled");
        assert!(next >= due && next <= due + max);

        // Normal priority order resumes on the next tick.
        nm.clear_calls();
        s.tick_at(due + TimeDelta::seconds(5)).await.expect("tick");

        assert_eq!(active(&s), vec!["wired".to_owned()]);
        assert_eq!(nm.deactivations_of("lte"), 1);
        assert_eq!(nm.applied_on("usb0").as_deref(), Some("wired"));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_never_steals() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("a", Some(GW));
        nm.add_connection("b", Some(GW));
        nm.add_device("wlan0", true, &["a", "b"]);
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["a", "b"]), config(&["a", "b"])).await;

        s.tick_at(Utc::now()).await.expect("tick");
        nm.clear_calls();
        s.tick_at(Utc::now()).await.expect("tick");

        assert_eq!(active(&s), vec!["a".to_owned()]);
        assert_eq!(nm.deactivations_of("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_check_failure_releases_device() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", Some(GW));
        nm.add_device("eth0", false, &["wired"]);
        let dns = FakeDns::reaching(&nm, &["wired"]);
        let mut s = scheduler(&nm, dns.clone(), config(&["wired"])).await;

        let t = Utc::now();
        s.tick_at(t).await.expect("tick");
        assert_eq!(active(&s), vec!["wired".to_owned()]);

        dns.set_reachable("wired", false);
        nm.clear_calls();
        // Past any possible periodic check time.
        s.tick_at(t + TimeDelta::hours(1)).await.expect("tick");

        assert!(active(&s).is_empty());
        assert_eq!(nm.calls().first(), Some(&Call::Deactivate { connection: "wired".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_switch_is_notified_once() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", Some(GW));
        nm.add_connection("wifi", Some(GW));
        nm.add_device("eth0", false, &["wired"]);
        nm.add_device("wlan0", true, &["wifi"]);
        nm.set_default_route(Some((GW, "eth0")));
        let notifier = RecordingNotifier::default();
        let mut s = Scheduler::initialize(
            config(&["wired", "wifi"]),
            Arc::clone(&nm),
            FakeDns::reaching(&nm, &["wired", "wifi"]),
            notifier.clone(),
        )
        .await
        .expect("valid configuration");

        s.tick_at(Utc::now()).await.expect("tick");
        let before = notifier.events().len();

        let gw2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        nm.set_default_route(Some((gw2, "wlan0")));
        s.tick_at(Utc::now()).await.expect("tick");
        s.tick_at(Utc::now()).await.expect("tick");

        assert_eq!(notifier.events().len(), before + 1);
        let prior = s.gateway().prior().expect("route present");
        assert_eq!(prior.gateway, gw2);
        assert_eq!(prior.interface, "wlan0");
        assert_eq!(prior.connection_id.as_deref(), Some("wifi"));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_is_requested_on_schedule() {
        let nm = Arc::new(MockNetwork::new());
        nm.add_connection("wired", Some(GW));
        nm.add_device("eth0", false, &["wired"]);
        let mut s = scheduler(&nm, FakeDns::reaching(&nm, &["wired"]), config(&["wired"])).await;

        s.tick_at(Utc::now() + TimeDelta::minutes(5)).await.expect("tick");

        assert!(nm.calls().contains(&Call::RequestScan));
    }
}
