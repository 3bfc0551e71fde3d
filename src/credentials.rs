//! API key resolution for the Gemini Live API.
//!
//! Lookup order:
//! 1. `GEMINI_API_KEY`, then `GOOGLE_API_KEY` (a `.env` file is loaded at startup)
//! 2. The OS's native secret storage via `keyring`:
//!    - Linux: libsecret (GNOME Keyring/KDE Wallet)
//!    - macOS: Keychain
//!    - Windows: Credential Manager
//!
//! `voice-live store-key` saves a key there; `voice-live forget-key` removes it.
//!
//! Security notes:
//! - Never log the key value
//! - Use `masked()` whenever the key has to be shown

use keyring::Entry;

const SERVICE_NAME: &str = "voice-live";
const API_KEY_NAME: &str = "gemini-api-key";

/// Environment variables checked, in order
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Resolve the API key from the environment, then the keyring.
/// Returns None if neither has a non-empty key.
pub fn resolve_api_key() -> Option<String> {
    if let Some(key) = api_key_from_env(|name| std::env::var(name).ok()) {
        log::debug!("ApiKey: using key from environment ({})", masked(&key));
        return Some(key);
    }

    let key = stored_api_key()?;
    log::debug!("ApiKey: using key from keyring ({})", masked(&key));
    Some(key)
}

/// First non-empty key among [`API_KEY_ENV_VARS`], using `lookup` to read variables
pub fn api_key_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}

fn api_key_entry() -> Result<Entry, String> {
    Entry::new(SERVICE_NAME, API_KEY_NAME)
        .map_err(|e| format!("Failed to create keyring entry: {}", e))
}

/// Retrieve the key stored in the system keyring, if any.
/// Errors are logged and treated as "not configured".
pub fn stored_api_key() -> Option<String> {
    match api_key_entry() {
        Ok(entry) => read_key(&entry),
        Err(e) => {
            log::warn!("ApiKey: {}", e);
            None
        }
    }
}

/// Store the API key in the system keyring.
/// Pass None to delete the key.
pub fn store_api_key(key: Option<&str>) -> Result<(), String> {
    write_key(&api_key_entry()?, key)
}

fn read_key(entry: &Entry) -> Option<String> {
    match entry.get_password() {
        Ok(key) if !key.trim().is_empty() => Some(key.trim().to_string()),
        Ok(_) => None,
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("ApiKey: failed to retrieve key: {}", e);
            None
        }
    }
}

fn write_key(entry: &Entry, key: Option<&str>) -> Result<(), String> {
    match key.map(str::trim) {
        Some("") => Err("API key is empty".to_string()),
        Some(k) => {
            entry
                .set_password(k)
                .map_err(|e| format!("Failed to store API key: {}", e))?;
            log::info!("ApiKey: stored API key ({})", masked(k));
            Ok(())
        }
        None => match entry.delete_credential() {
            Ok(()) => {
                log::info!("ApiKey: deleted stored API key");
                Ok(())
            }
            // Already deleted, that's fine
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(format!("Failed to delete API key: {}", e)),
        },
    }
}

/// Returns a masked version of the key for display (e.g., "AIz...c123")
pub fn masked(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
