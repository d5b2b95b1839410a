//! GitHub token storage and lookup
//!
//! The token lives in a single keychain entry as JSON, so new credential
//! kinds can be added without another OS prompt. `GITHUB_TOKEN` and the
//! `--token` flag both take precedence over the keychain.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::warn;

const KEYRING_SERVICE: &str = "unslave-credentials";
const KEYRING_USERNAME: &str = "default";
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
const DISABLE_KEYRING_ENV: &str = "UNSLAVE_DISABLE_KEYRING";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    github_token: Option<String>,
}

type KeyringResult<T> = Result<T, String>;

static CREDENTIALS_CACHE: OnceLock<Mutex<Option<StoredCredentials>>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<Option<StoredCredentials>> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(None))
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var(DISABLE_KEYRING_ENV)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn warn_keychain_error_once(err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    warn!(
        error = %err,
        "couldn't access the system keychain; set {} to bypass it",
        TOKEN_ENV
    );
}

fn read_credentials() -> KeyringResult<StoredCredentials> {
    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(creds) = guard.as_ref() {
        return Ok(creds.clone());
    }
    if keyring_disabled() {
        return Ok(StoredCredentials::default());
    }

    let entry = keyring_entry().map_err(|e| e.to_string())?;
    let creds = match entry.get_password() {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| format!("Failed to parse credentials: {}", e))?,
        Err(keyring::Error::NoEntry) => StoredCredentials::default(),
        Err(err) => return Err(err.to_string()),
    };
    *guard = Some(creds.clone());
    Ok(creds)
}

fn write_credentials(creds: &StoredCredentials) -> Result<(), String> {
    if keyring_disabled() {
        return Err("Keychain access is disabled".to_string());
    }
    let json = serde_json::to_string(creds).map_err(|e| e.to_string())?;
    keyring_entry()
        .and_then(|entry| entry.set_password(&json))
        .map_err(|e| e.to_string())?;

    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(creds.clone());
    Ok(())
}

/// Where the token came from, for the startup log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Flag,
    Environment,
    Keychain,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Flag => write!(f, "--token"),
            TokenSource::Environment => write!(f, "{}", TOKEN_ENV),
            TokenSource::Keychain => write!(f, "keychain"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Pick the first available token: flag, then environment, then keychain.
pub fn select_token(
    flag: Option<String>,
    env: Option<String>,
    keychain: impl FnOnce() -> Option<String>,
) -> Option<(String, TokenSource)> {
    if let Some(token) = non_empty(flag) {
        return Some((token, TokenSource::Flag));
    }
    if let Some(token) = non_empty(env) {
        return Some((token, TokenSource::Environment));
    }
    non_empty(keychain()).map(|token| (token, TokenSource::Keychain))
}

pub fn get_github_token() -> KeyringResult<Option<String>> {
    Ok(read_credentials()?.github_token)
}

pub fn set_github_token(token: &str) -> Result<(), String> {
    let mut creds = read_credentials().unwrap_or_default();
    creds.github_token = Some(token.to_string());
    write_credentials(&creds)
}

/// Resolve the token for this run. A missing token is fatal.
pub fn resolve_token(flag: Option<String>) -> anyhow::Result<(String, TokenSource)> {
    select_token(flag, std::env::var(TOKEN_ENV).ok(), || {
        match get_github_token() {
            Ok(token) => token,
            Err(err) => {
                warn_keychain_error_once(&err);
                None
            }
        }
    })
    .ok_or_else(|| {
        anyhow::anyhow!(
            "No GitHub token found. Pass --token, set {}, or store one with --store-token.",
            TOKEN_ENV
        )
    })
}
