use thiserror::Error;

/// Top-level error type for the `netcheck-nm` crate.
///
/// Bus-level failures are classified on construction so the retry policy
/// only has to look at the variant. `netcheck-core` wraps this type.
#[derive(Debug, Error)]
pub enum Error {
    // ── Service availability ────────────────────────────────────────
    /// NetworkManager is not on the bus right now (restarting, not started
    /// yet, or the bus connection dropped).
    #[error("NetworkManager unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// An object, method, interface or property vanished between two calls.
    /// Happens while NetworkManager tears down or recreates objects.
    #[error("NetworkManager object missing: {message}")]
    ObjectMissing { message: String },

    // ── Lookup ──────────────────────────────────────────────────────
    /// No connection profile with this id.
    #[error("Unknown connection: {id}")]
    UnknownConnection { id: String },

    /// No device with this interface name.
    #[error("Unknown device: {interface}")]
    UnknownDevice { interface: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Any other D-Bus failure. Never retried.
    #[error("D-Bus error: {0}")]
    Bus(zbus::Error),

    /// The kernel routing table could not be read.
    #[error("Failed to read routing table: {0}")]
    RouteTable(#[from] std::io::Error),

    // ── Data ────────────────────────────────────────────────────────
    /// A value from NetworkManager or the kernel did not have the expected shape.
    #[error("Malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

/// The two retryable fault classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Bounded by a minimum attempt count AND a maximum elapsed time.
    ServiceUnavailable,
    /// Bounded by attempt count only.
    ObjectMissing,
}

impl Error {
    /// Returns the retry class of this error, or `None` if it is permanent.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            Self::ServiceUnavailable { .. } => Some(TransientKind::ServiceUnavailable),
            Self::ObjectMissing { .. } => Some(TransientKind::ObjectMissing),
            _ => None,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        self.transient_kind().is_some()
    }

    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

// ── zbus classification ─────────────────────────────────────────────

fn classify_error_name(name: &str) -> Option<TransientKind> {
    match name {
        "org.freedesktop.DBus.Error.ServiceUnknown"
        | "org.freedesktop.DBus.Error.NameHasNoOwner"
        | "org.freedesktop.DBus.Error.NoReply"
        | "org.freedesktop.DBus.Error.Disconnected" => Some(TransientKind::ServiceUnavailable),
        "org.freedesktop.DBus.Error.UnknownObject"
        | "org.freedesktop.DBus.Error.UnknownMethod"
        | "org.freedesktop.DBus.Error.UnknownInterface"
        | "org.freedesktop.DBus.Error.UnknownProperty" => Some(TransientKind::ObjectMissing),
        _ => None,
    }
}

fn classify_fdo(err: &zbus::fdo::Error) -> Option<TransientKind> {
    use zbus::fdo::Error as Fdo;

    match err {
        Fdo::ServiceUnknown(_) | Fdo::NameHasNoOwner(_) | Fdo::NoReply(_) | Fdo::Disconnected(_) => {
            Some(TransientKind::ServiceUnavailable)
        }
        Fdo::UnknownObject(_)
        | Fdo::UnknownMethod(_)
        | Fdo::UnknownInterface(_)
        | Fdo::UnknownProperty(_) => Some(TransientKind::ObjectMissing),
        Fdo::ZBus(inner) => classify_zbus(inner),
        _ => None,
    }
}

fn classify_zbus(err: &zbus::Error) -> Option<TransientKind> {
    match err {
        zbus::Error::MethodError(name, _, _) => classify_error_name(name.as_str()),
        zbus::Error::FDO(fdo) => classify_fdo(fdo),
        // Socket gone: the bus itself restarted or was never there.
        zbus::Error::InputOutput(_) => Some(TransientKind::ServiceUnavailable),
        _ => None,
    }
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        match classify_zbus(&err) {
            Some(TransientKind::ServiceUnavailable) => Self::ServiceUnavailable {
                message: err.to_string(),
            },
            Some(TransientKind::ObjectMissing) => Self::ObjectMissing {
                message: err.to_string(),
            },
            None => Self::Bus(err),
        }
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(err: zbus::fdo::Error) -> Self {
        Self::from(zbus::Error::FDO(Box::new(err)))
    }
}

impl From<zbus::zvariant::Error> for Error {
    fn from(err: zbus::zvariant::Error) -> Self {
        Self::Bus(zbus::Error::Variant(err))
    }
}
