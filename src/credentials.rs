//! Terminal credentials in the OS credential store.
//!
//! Keychain on macOS, the Windows credential manager, Secret Service on
//! Linux, all through the `keyring` crate. Environment variables take
//! precedence; see `config.rs`.

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "catalyst-sync";

pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_TERMINAL_ID: &str = "terminal_id";

/// Read a credential. Returns `None` when the entry does not exist or the
/// platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> keyring::Result<()> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)
}

/// Store the admin URL and terminal id resolved at start-up when the
/// credential store has none yet, so later runs work without the
/// environment. Best-effort.
pub fn remember_terminal(admin_url: Option<&str>, terminal_id: Option<&str>) {
    for (key, value) in [(KEY_ADMIN_URL, admin_url), (KEY_TERMINAL_ID, terminal_id)] {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        if get_credential(key).is_some() {
            continue;
        }
        match set_credential(key, value) {
            Ok(()) => info!(key, "keyring: stored terminal credential"),
            Err(e) => warn!(key, error = %e, "keyring: failed to store credential"),
        }
    }
}
