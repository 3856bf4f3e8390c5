//! Backend credential storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the kernel keyutils store.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "order-desk";

pub const KEY_ADMIN_URL: &str = "admin_url";
pub const KEY_API_KEY: &str = "api_key";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_API_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
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

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Parsed credentials payload from the settings screen.
#[derive(Debug, PartialEq)]
pub struct CredentialsUpdate {
    pub admin_url: String,
    pub api_key: String,
}

/// Accepts `{adminUrl, apiKey}` (snake_case aliases too) or a connection
/// string in `apiKey` that carries both.
pub fn parse_credentials_payload(payload: &Value) -> Result<CredentialsUpdate, String> {
    let raw_api_key = crate::value_str(payload, &["apiKey", "api_key", "connectionString"])
        .ok_or("Missing required field: apiKey")?;

    let mut api_key = raw_api_key.clone();
    let mut admin_url = crate::value_str(payload, &["adminUrl", "admin_url", "url"]);
    if let Some(decoded_key) = crate::api::extract_api_key_from_connection_string(&raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_url) =
            crate::api::extract_admin_url_from_connection_string(&raw_api_key)
        {
            admin_url = Some(decoded_url);
        }
    }

    let admin_url = admin_url
        .map(|u| crate::api::normalize_admin_url(&u))
        .ok_or("Missing required field: adminUrl")?;
    Ok(CredentialsUpdate { admin_url, api_key })
}

/// Store backend credentials received from the settings screen.
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let update = parse_credentials_payload(payload)?;
    set_credential(KEY_ADMIN_URL, &update.admin_url)?;
    set_credential(KEY_API_KEY, &update.api_key)?;
    info!(admin_url = %update.admin_url, "backend credentials updated");
    Ok(serde_json::json!({ "success": true, "adminUrl": update.admin_url }))
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
