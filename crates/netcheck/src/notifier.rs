// Gateway-change events as files in a spool directory, one per event.
//
// Consumers watch the directory. Each file is written under a `.partial`
// name and renamed into place, so a visible event is always complete. Only
// the newest events are kept; older ones are pruned after each write.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use netcheck_core::{CoreError, GatewayNotifier};
use netcheck_nm::GatewayState;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::DaemonError;

const RETAINED_EVENTS: usize = 64;
const EVENT_SEPARATOR: &str = "---";

#[derive(Debug, Clone)]
pub struct SpoolNotifier {
    dir: PathBuf,
    retain: usize,
}

impl SpoolNotifier {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: PathBuf) -> Result<Self, DaemonError> {
        fs::create_dir_all(&dir).map_err(|source| DaemonError::Spool {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            retain: RETAINED_EVENTS,
        })
    }

    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Remove all but the newest `retain` events. Files that are not events
    /// are left alone.
    fn prune(&self) -> std::io::Result<usize> {
        let mut events: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.contains(EVENT_SEPARATOR) && !name.ends_with(".partial"))
            })
            .collect();
        if events.len() <= self.retain {
            return Ok(0);
        }
        events.sort();
        let stale = events.len() - self.retain;
        for path in &events[..stale] {
            fs::remove_file(path)?;
        }
        Ok(stale)
    }
}

/// `<RFC 3339 time>---<random>`: sortable by time, unique within a tick.
fn event_name(at: DateTime<Utc>) -> String {
    let nonce: u32 = rand::rng().random();
    format!(
        "{}{EVENT_SEPARATOR}{nonce}",
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

fn event_body(state: &GatewayState) -> String {
    format!(
        "gateway={}\ninterface={}\nconnection={}\n",
        state.gateway,
        state.interface,
        state.connection_id.as_deref().unwrap_or_default()
    )
}

impl GatewayNotifier for SpoolNotifier {
    fn notify(&self, state: &GatewayState) -> Result<(), CoreError> {
        let name = event_name(Utc::now());
        let partial = self.dir.join(format!("{name}.partial"));
        let target = self.dir.join(&name);

        fs::write(&partial, event_body(state))
            .and_then(|()| fs::rename(&partial, &target))
            .map_err(|e| CoreError::Notify {
                message: format!("{}: {e}", target.display()),
            })?;

        debug!(event = %name, "gateway change spooled");

        match self.prune() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned old gateway events"),
            Err(err) => warn!(error = %err, dir = %self.dir.display(), "failed to prune gateway events"),
        }
        Ok(())
    }
}
