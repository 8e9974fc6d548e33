//! Daemon error types with miette diagnostics.
//!
//! Maps config, core and adapter errors into startup failures with
//! actionable help text and sysexits-style exit codes.

use miette::Diagnostic;
use thiserror::Error;

use netcheck_config::ConfigError;
use netcheck_core::CoreError;

/// Process exit codes (see sysexits.h).
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    /// `EX_UNAVAILABLE`
    pub const UNAVAILABLE: i32 = 69;
    /// `EX_CONFIG`
    pub const CONFIG: i32 = 78;
}

#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file {path} not found")]
    #[diagnostic(
        code(netcheck::no_config),
        help(
            "Create it, or point to another file with --config or NETCHECK_CONFIG.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(
        code(netcheck::validation),
        help("Fix the value in the configuration file and run: netcheck check-config")
    )]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(netcheck::config))]
    Config(ConfigError),

    #[error("Connection '{id}' is not known to NetworkManager")]
    #[diagnostic(
        code(netcheck::unknown_connection),
        help("Connection ids must match profile names exactly. List them with: nmcli connection show")
    )]
    UnknownConnection { id: String },

    // ── NetworkManager ───────────────────────────────────────────────

    #[error("NetworkManager is not reachable on the system bus")]
    #[diagnostic(
        code(netcheck::nm_unavailable),
        help("Check that NetworkManager is running: systemctl status NetworkManager")
    )]
    NetworkManagerUnavailable {
        #[source]
        source: netcheck_nm::Error,
    },

    // ── Runtime setup ────────────────────────────────────────────────

    #[error("Cannot set up logging: {message}")]
    #[diagnostic(code(netcheck::logging), help("Check that the log_file directory exists and is writable."))]
    Logging { message: String },

    #[error("Cannot use gateway spool directory {path}")]
    #[diagnostic(code(netcheck::spool), help("Set gateway_spool_dir to a writable directory."))]
    Spool {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(netcheck::core))]
    Core(CoreError),
}

impl From<ConfigError> for DaemonError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { path } => Self::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl From<netcheck_nm::Error> for DaemonError {
    fn from(err: netcheck_nm::Error) -> Self {
        match err {
            err @ netcheck_nm::Error::ServiceUnavailable { .. } => {
                Self::NetworkManagerUnavailable { source: err }
            }
            other => Self::from(CoreError::from(other)),
        }
    }
}

impl From<CoreError> for DaemonError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownConnection { id } => Self::UnknownConnection { id },
            CoreError::Service(source @ netcheck_nm::Error::ServiceUnavailable { .. }) => {
                Self::NetworkManagerUnavailable { source }
            }
            CoreError::Config { message } => Self::Validation {
                field: "configuration".into(),
                reason: message,
            },
            other => Self::Core(other),
        }
    }
}

impl DaemonError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoConfig { .. }
            | Self::Validation { .. }
            | Self::Config(_)
            | Self::UnknownConnection { .. } => exit_code::CONFIG,
            Self::NetworkManagerUnavailable { .. } => exit_code::UNAVAILABLE,
            Self::Logging { .. } | Self::Spool { .. } | Self::Core(_) => exit_code::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn configuration_problems_exit_with_ex_config() {
        let missing = DaemonError::from(ConfigError::Missing {
            path: PathBuf::from("/etc/netcheck/netcheck.toml"),
        });
        assert_eq!(missing.exit_code(), exit_code::CONFIG);

        let unknown = DaemonError::from(CoreError::UnknownConnection { id: "lte".into() });
        assert!(matches!(unknown, DaemonError::UnknownConnection { .. }));
        assert_eq!(unknown.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn unreachable_network_manager_exits_with_ex_unavailable() {
        let err = DaemonError::from(netcheck_nm::Error::ServiceUnavailable {
            message: "org.freedesktop.DBus.Error.ServiceUnknown".into(),
        });
        assert_eq!(err.exit_code(), exit_code::UNAVAILABLE);

        let wrapped = DaemonError::from(CoreError::from(netcheck_nm::Error::ServiceUnavailable {
            message: "gone".into(),
        }));
        assert_eq!(wrapped.exit_code(), exit_code::UNAVAILABLE);
    }

    #[test]
    fn other_adapter_errors_are_general() {
        let err = DaemonError::from(netcheck_nm::Error::UnknownDevice {
            interface: "wlan9".into(),
        });
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }
}
