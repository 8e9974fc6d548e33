//! Per-connection state, kept in priority order.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use strum::Display;

use crate::config::DaemonConfig;
use crate::error::CoreError;
use crate::schedule::randomly_after;

/// Whether a connection is in use.
///
/// `Active` means applied to a device AND the last probe succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Inactive,
    Active,
}

/// One configured connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    /// Position in the configured list; 0 is best.
    pub priority: usize,
    pub required_usage: bool,
    pub state: ConnectionState,
    /// Time of the last successful probe.
    pub last_confirmed: Option<DateTime<Utc>>,
    pub next_periodic_check: DateTime<Utc>,
    /// Next normal required-usage attempt; `None` means due now.
    pub required_usage_next: Option<DateTime<Utc>>,
    /// Short retry after a failed required-usage attempt. Overrides
    /// `required_usage_next` while set.
    pub required_usage_failed_retry: Option<DateTime<Utc>>,
    /// Activation attempts that ended in a failed readiness wait or probe.
    pub failed_activations: u32,
    /// Earliest time this connection may displace another one; `None`
    /// means now.
    pub next_preemption: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Record a successful probe.
    pub fn confirm(&mut self, at: DateTime<Utc>) {
        self.last_confirmed = Some(at);
        self.required_usage_failed_retry = None;
    }

    /// Whether the required-usage schedule says this connection should be
    /// used now. Always `false` for ordinary connections.
    pub fn required_usage_due(&self, now: DateTime<Utc>) -> bool {
        if !self.required_usage {
            return false;
        }
        match self.required_usage_failed_retry.or(self.required_usage_next) {
            Some(due) => due <= now,
            None => true,
        }
    }

    pub fn preemption_due(&self, now: DateTime<Utc>) -> bool {
        self.next_preemption.is_none_or(|due| due <= now)
    }
}

/// All configured connections, iterated in priority order.
#[derive(Debug, Clone)]
pub struct Registry {
    records: IndexMap<String, ConnectionRecord>,
}

impl Registry {
    pub fn new(config: &DaemonConfig, now: DateTime<Utc>) -> Self {
        let records = config
            .connection_ids
            .iter()
            .enumerate()
            .map(|(priority, id)| {
                let record = ConnectionRecord {
                    id: id.clone(),
                    priority,
                    required_usage: config.is_required_usage(id),
                    state: ConnectionState::Inactive,
                    last_confirmed: None,
                    next_periodic_check: randomly_after(now, config.connection_periodic_check_time),
                    required_usage_next: None,
                    required_usage_failed_retry: None,
                    failed_activations: 0,
                    next_preemption: None,
                };
                (id.clone(), record)
            })
            .collect();
        Self { records }
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    pub fn record(&self, id: &str) -> Result<&ConnectionRecord, CoreError> {
        self.records.get(id).ok_or_else(|| CoreError::UnknownConnection { id: id.to_owned() })
    }

    pub fn record_mut(&mut self, id: &str) -> Result<&mut ConnectionRecord, CoreError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownConnection { id: id.to_owned() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    /// Ids in priority order, detached from the registry borrow.
    pub fn ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn required_usage_ids(&self) -> Vec<String> {
        self.iter().filter(|r| r.required_usage).map(|r| r.id.clone()).collect()
    }

    /// Ids of every connection with priority `<= priority`.
    pub fn ids_up_to(&self, priority: usize) -> BTreeSet<String> {
        self.iter()
            .filter(|r| r.priority <= priority)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn active_ids(&self) -> BTreeSet<String> {
        self.iter().filter(|r| r.is_active()).map(|r| r.id.clone()).collect()
    }

    pub fn set_state(&mut self, id: &str, state: ConnectionState) -> Result<(), CoreError> {
        self.record_mut(id)?.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::config;

    #[test]
    fn records_follow_configured_priority() {
        let mut cfg = config(&["wired", "wifi", "lte"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let registry = Registry::new(&cfg, Utc::now());

        let order: Vec<(String, usize)> = registry.iter().map(|r| (r.id.clone(), r.priority)).collect();
        assert_eq!(
            order,
            vec![("wired".into(), 0), ("wifi".into(), 1), ("lte".into(), 2)]
        );
        assert_eq!(registry.required_usage_ids(), vec!["lte".to_owned()]);
        assert!(registry.iter().all(|r| r.state == ConnectionState::Inactive));
    }

    #[test]
    fn ids_up_to_includes_own_priority() {
        let registry = Registry::new(&config(&["a", "b", "c"]), Utc::now());
        let ids: Vec<String> = registry.ids_up_to(1).into_iter().collect();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn failed_retry_overrides_normal_schedule() {
        let now = Utc::now();
        let mut cfg = config(&["lte"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let mut registry = Registry::new(&cfg, now);
        let record = registry.record_mut("lte").expect("lte is configured");

        assert!(record.required_usage_due(now));

        record.required_usage_next = Some(now + TimeDelta::days(7));
        assert!(!record.required_usage_due(now));

        record.required_usage_failed_retry = Some(now - TimeDelta::seconds(1));
        assert!(record.required_usage_due(now));

        record.confirm(now);
        assert_eq!(record.required_usage_failed_retry, None);
        assert!(!record.required_usage_due(now));
    }

    #[test]
    fn preemption_is_due_until_deferred() {
        let now = Utc::now();
        let mut registry = Registry::new(&config(&["wired"]), now);
        let record = registry.record_mut("wired").expect("wired is configured");

        assert!(record.preemption_due(now));
        record.next_preemption = Some(now + TimeDelta::minutes(2));
        assert!(!record.preemption_due(now));
        assert!(record.preemption_due(now + TimeDelta::minutes(2)));
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(ConnectionState::Active.to_string(), "active");
    }
}
