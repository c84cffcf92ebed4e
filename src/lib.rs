pub mod api;
pub mod auth;
pub mod checkout;
pub mod db;
pub mod error;
pub mod mcp;
pub mod notify;
pub mod poll;
pub mod wizard;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::{http_client, ApiClient, REQUEST_TIMEOUT};
use auth::{AuthedApi, SupabaseAuth};
use db::{Db, SharedDb};
use poll::job::JobPollPolicy;
use poll::payment::PaymentPollPolicy;

/// Directory name under the platform data dir.
pub const APP_IDENTIFIER: &str = "com.bimzik.client";

// ---------------------------------------------------------------------------
// Settings: read from {dataDir}/settings.json, then environment overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    #[serde(alias = "apiURL")]
    pub api_base_url: String,
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub supabase_anon_key: String,
    #[serde(default)]
    pub job_max_attempts: Option<u32>,
    #[serde(default)]
    pub payment_max_attempts: Option<u32>,
    /// Per-request bound for backend and auth calls.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_api_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            job_max_attempts: None,
            payment_max_attempts: None,
            request_timeout_secs: None,
        }
    }
}

impl Settings {
    /// Environment variables win over the file.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |slot: &mut String, key: &str| {
            if let Some(v) = var(key).filter(|v| !v.trim().is_empty()) {
                *slot = v.trim().to_string();
            }
        };
        set(&mut self.api_base_url, "BIMZIK_API_URL");
        set(&mut self.supabase_url, "BIMZIK_SUPABASE_URL");
        set(&mut self.supabase_anon_key, "BIMZIK_SUPABASE_ANON_KEY");
    }

    pub fn job_policy(&self) -> JobPollPolicy {
        let mut policy = JobPollPolicy::default();
        if let Some(n) = self.job_max_attempts.filter(|n| *n > 0) {
            policy.max_attempts = n;
        }
        policy
    }

    pub fn payment_policy(&self) -> PaymentPollPolicy {
        let mut policy = PaymentPollPolicy::default();
        if let Some(n) = self.payment_max_attempts.filter(|n| *n > 0) {
            policy.max_attempts = n;
        }
        policy
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(REQUEST_TIMEOUT)
    }

    fn check(&self) -> Result<()> {
        if self.supabase_url.is_empty() || self.supabase_anon_key.is_empty() {
            bail!(
                "auth provider is not configured: set supabaseUrl and supabaseAnonKey in settings.json \
                 or BIMZIK_SUPABASE_URL / BIMZIK_SUPABASE_ANON_KEY"
            );
        }
        Ok(())
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(data_dir: &Path) -> Settings {
    let path = data_dir.join("settings.json");
    let mut settings = match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring unreadable settings: {e}");
            Settings::default()
        }),
        Err(_) => Settings::default(),
    };
    settings.apply_overrides(|k| std::env::var(k).ok());
    settings
}

/// Resolve the app data directory cross-platform.
pub fn resolve_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join("Library/Application Support").join(APP_IDENTIFIER))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let data = dirs::data_dir().context("could not determine data directory")?;
        Ok(data.join(APP_IDENTIFIER))
    }
}

/// Log to stderr so stdout stays free for protocol traffic. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything a front end needs: local store, auth provider, authenticated
/// backend client.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db: SharedDb,
    pub auth: Arc<SupabaseAuth>,
    pub api: AuthedApi,
}

impl AppState {
    pub fn open(data_dir: &Path, settings: Settings) -> Result<Self> {
        settings.check()?;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let db = Db::open(&data_dir.join("bimzik.db"))
            .context("failed to open database")?
            .into_shared();
        Self::with_db(db, settings)
    }

    pub fn with_db(db: SharedDb, settings: Settings) -> Result<Self> {
        let timeout = settings.request_timeout();
        let http = http_client(timeout).context("failed to build HTTP client")?;
        let auth = Arc::new(SupabaseAuth::new(
            settings.supabase_url.clone(),
            settings.supabase_anon_key.clone(),
            http.clone(),
            db.clone(),
        ));
        let api = AuthedApi::new(
            ApiClient::with_client(http, settings.api_base_url.clone()),
            auth.clone(),
        );
        info!(api = %settings.api_base_url, timeout_ms = timeout.as_millis() as u64, "client ready");
        Ok(Self {
            settings,
            db,
            auth,
            api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn settings_parse_camel_case_with_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"supabaseUrl":"https://x.supabase.co","jobMaxAttempts":10}"#)
                .unwrap();
        assert_eq!(s.api_base_url, "http://localhost:8000");
        assert_eq!(s.supabase_url, "https://x.supabase.co");
        assert_eq!(s.job_policy().max_attempts, 10);
        assert_eq!(s.payment_policy().max_attempts, 24);
        assert_eq!(s.request_timeout(), REQUEST_TIMEOUT);
    }

    #[test]
    fn request_timeout_is_configurable() {
        let s: Settings = serde_json::from_str(r#"{"requestTimeoutSecs":3}"#).unwrap();
        assert_eq!(s.request_timeout(), Duration::from_secs(3));
        let zero: Settings = serde_json::from_str(r#"{"requestTimeoutSecs":0}"#).unwrap();
        assert_eq!(zero.request_timeout(), REQUEST_TIMEOUT);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("BIMZIK_API_URL", "https://api.bimzik.app"),
            ("BIMZIK_SUPABASE_ANON_KEY", "  "),
        ]
        .into_iter()
        .collect();
        let mut s = Settings {
            supabase_anon_key: "from-file".into(),
            ..Default::default()
        };
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.api_base_url, "https://api.bimzik.app");
        assert_eq!(s.supabase_anon_key, "from-file");
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = std::env::temp_dir().join(format!("bimzik-test-{}", uuid::Uuid::new_v4()));
        let s = load_settings(&dir);
        assert!(!s.api_base_url.is_empty());
    }

    #[test]
    fn unconfigured_auth_is_rejected() {
        assert!(Settings::default().check().is_err());
    }
}
