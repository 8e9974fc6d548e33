// ── Runtime daemon configuration ──
//
// Validated settings for the engine and scheduler. Built by the config
// crate from the TOML file and handed in; core never reads config files.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::CoreError;

/// NetworkManager refuses wireless scans more often than this.
pub const MIN_AVAILABLE_CONNECTIONS_CHECK_DELAY: Duration = Duration::from_secs(26);

/// Everything the scheduler needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Connection profile ids, best first.
    pub connection_ids: Vec<String>,
    /// Subset of `connection_ids` that must be used periodically.
    pub required_usage_connection_ids: Vec<String>,
    pub nameservers: Vec<IpAddr>,
    pub dns_queries: Vec<String>,
    pub dns_timeout: Duration,
    pub connection_activation_timeout: Duration,
    pub connection_periodic_check_time: Duration,
    pub available_connections_check_delay: Duration,
    pub required_usage_max_delay: Duration,
    pub required_usage_failed_retry_delay: Duration,
    pub main_loop_delay: Duration,
    pub periodic_status_delay: Duration,
}

impl DaemonConfig {
    /// Check the cross-field invariants the engine relies on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.connection_ids.is_empty() {
            return Err(CoreError::config("connection_ids must not be empty"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.connection_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(CoreError::config(format!("connection_ids lists {dup} twice")));
        }
        if let Some(stray) = self
            .required_usage_connection_ids
            .iter()
            .find(|id| !seen.contains(id.as_str()))
        {
            return Err(CoreError::config(format!(
                "required-usage connection {stray} is not in connection_ids"
            )));
        }
        if self.nameservers.len() < 2 {
            return Err(CoreError::config("at least 2 nameservers are required"));
        }
        if self.dns_queries.len() < 2 {
            return Err(CoreError::config("at least 2 dns_queries are required"));
        }
        if self.dns_timeout.is_zero() {
            return Err(CoreError::config("dns_timeout must be greater than 0"));
        }
        if self.available_connections_check_delay < MIN_AVAILABLE_CONNECTIONS_CHECK_DELAY {
            return Err(CoreError::config(format!(
                "available_connections_check_delay must be at least {}",
                humantime::format_duration(MIN_AVAILABLE_CONNECTIONS_CHECK_DELAY)
            )));
        }
        Ok(())
    }

    pub fn is_required_usage(&self, connection_id: &str) -> bool {
        self.required_usage_connection_ids.iter().any(|id| id == connection_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::config;

    #[test]
    fn sample_config_is_valid() {
        assert!(config(&["wired", "wifi"]).validate().is_ok());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = config(&["wired", "wired"]).validate().err();
        assert!(err.is_some_and(|e| e.to_string().contains("twice")));
    }

    #[test]
    fn required_usage_must_be_configured() {
        let mut cfg = config(&["wired"]);
        cfg.required_usage_connection_ids = vec!["lte".into()];
        let err = cfg.validate().err();
        assert!(err.is_some_and(|e| e.to_string().contains("lte")));
    }

    #[test]
    fn one_nameserver_is_not_enough() {
        let mut cfg = config(&["wired"]);
        cfg.nameservers.truncate(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scan_delay_has_a_floor() {
        let mut cfg = config(&["wired"]);
        cfg.available_connections_check_delay = std::time::Duration::from_secs(10);
        assert!(cfg.validate().is_err());
    }
}
