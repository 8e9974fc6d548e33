// Startup sanity checks that only warn.

use std::fs;

use tracing::warn;

const NM_CONF: &str = "/etc/NetworkManager/NetworkManager.conf";
const NM_DBUS_POLICY: &str = "/etc/dbus-1/system.d/org.freedesktop.NetworkManager.conf";

/// Warn when NetworkManager skips polkit while its D-Bus policy lets every
/// local user talk to it: any user could then reconfigure the network.
pub fn warn_if_polkit_disabled() {
    let (Ok(nm_conf), Ok(policy)) = (fs::read_to_string(NM_CONF), fs::read_to_string(NM_DBUS_POLICY))
    else {
        return;
    };
    if polkit_disabled(&nm_conf) && has_default_policy(&policy) {
        warn!(
            config = NM_CONF,
            policy = NM_DBUS_POLICY,
            "NetworkManager polkit authorization is disabled and the D-Bus policy has a default context; \
             unprivileged users can control NetworkManager"
        );
    }
}

fn polkit_disabled(nm_conf: &str) -> bool {
    nm_conf
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .any(|(key, value)| key.trim() == "auth-polkit" && value.trim().eq_ignore_ascii_case("false"))
}

fn has_default_policy(policy: &str) -> bool {
    policy.contains(r#"<policy context="default">"#)
}
