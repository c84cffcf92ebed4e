//! Session handling against the Supabase-compatible auth and storage
//! provider, plus the refresh-aware wrapper used by every authenticated call.
//!
//! The provider owns the credential; this module only reads it, refreshes it
//! through the provider, and persists the result in the local store.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::db::SharedDb;
use crate::error::{ClientError, ClientResult};

/// Seconds before expiry at which a token is treated as already expired.
const EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: SessionUser,
}

impl Session {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at
            .map(|exp| exp - EXPIRY_LEEWAY_SECS <= now)
            .unwrap_or(false)
    }
}

/// Raw token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Option<SessionUser>,
}

impl TokenResponse {
    fn into_session(self) -> Option<Session> {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs)
        });
        Some(Session {
            access_token: self.access_token?,
            refresh_token: self.refresh_token?,
            expires_at,
            user: self.user?,
        })
    }
}

// ---------------------------------------------------------------------------
// Credential seam
// ---------------------------------------------------------------------------

/// Bearer token handed to one authenticated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// The token was obtained by refreshing an expired session just now.
    pub refreshed: bool,
}

impl AccessToken {
    pub fn stored(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refreshed: false,
        }
    }

    pub fn refreshed(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refreshed: true,
        }
    }
}

/// Source of bearer tokens for authenticated backend calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, refreshed first if it has expired.
    /// `ClientError::Auth` when there is no session.
    async fn access_token(&self) -> ClientResult<AccessToken>;

    /// Force a refresh after the backend rejected the current token.
    async fn refresh(&self) -> ClientResult<String>;
}

/// Run `call` with a bearer token. At most one refresh happens per call: a
/// 401 on a stored token triggers one refresh and one retry, a 401 on a token
/// that was just refreshed is returned as is. A failed refresh is reported as
/// `ClientError::Auth`.
pub async fn with_credential<T, F, Fut>(creds: &dyn CredentialProvider, call: F) -> ClientResult<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let AccessToken { token, refreshed } = creds.access_token().await?;
    match call(token).await {
        Err(e) if e.is_unauthorized() && !refreshed => {
            debug!("bearer token rejected, refreshing once");
            let token = creds.refresh().await.map_err(|e| match e {
                ClientError::Auth(_) => e,
                other => ClientError::Auth(format!("session refresh failed: {other}")),
            })?;
            call(token).await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Supabase provider
// ---------------------------------------------------------------------------

pub struct SupabaseAuth {
    url: String,
    anon_key: String,
    http: Client,
    db: SharedDb,
}

impl SupabaseAuth {
    /// `http` should carry a request timeout, see [`crate::api::http_client`].
    pub fn new(
        url: impl Into<String>,
        anon_key: impl Into<String>,
        http: Client,
        db: SharedDb,
    ) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            http,
            db,
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("apikey", &self.anon_key)
    }

    /// Session persisted by the last sign-in or refresh, if any.
    pub fn current_session(&self) -> ClientResult<Option<Session>> {
        let db = self
            .db
            .lock()
            .map_err(|e| ClientError::Auth(format!("db lock poisoned: {e}")))?;
        db.load_session()
            .map_err(|e| ClientError::Auth(format!("{e:#}")))
    }

    fn store_session(&self, session: &Session) {
        match self.db.lock() {
            Ok(db) => {
                if let Err(e) = db.save_session(session) {
                    warn!("failed to persist session: {e:#}");
                }
            }
            Err(e) => warn!("db lock poisoned, session not persisted: {e}"),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ClientResult<Session> {
        let resp = self
            .request(self.http.post(format!("{}/auth/v1/token", self.url)))
            .query(&[("grant_type", "password")])
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        let token = read_auth_response(resp).await?;
        let session = token
            .into_session()
            .ok_or_else(|| ClientError::Decode("token response without a session".into()))?;
        self.store_session(&session);
        info!(user_id = %session.user.id, "signed in");
        Ok(session)
    }

    /// Returns `None` when the provider requires email confirmation first.
    pub async fn sign_up(&self, email: &str, password: &str) -> ClientResult<Option<Session>> {
        let resp = self
            .request(self.http.post(format!("{}/auth/v1/signup", self.url)))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        let token = read_auth_response(resp).await?;
        let session = token.into_session();
        if let Some(ref s) = session {
            self.store_session(s);
        }
        Ok(session)
    }

    /// Revoke the session remotely (best effort) and forget it locally.
    pub async fn sign_out(&self) -> ClientResult<()> {
        if let Some(session) = self.current_session()? {
            let result = self
                .request(self.http.post(format!("{}/auth/v1/logout", self.url)))
                .bearer_auth(&session.access_token)
                .send()
                .await;
            if let Err(e) = result {
                warn!("remote sign-out failed: {e}");
            }
        }
        let db = self
            .db
            .lock()
            .map_err(|e| ClientError::Auth(format!("db lock poisoned: {e}")))?;
        db.clear_session()
            .map_err(|e| ClientError::Auth(format!("{e:#}")))
    }

    async fn refresh_session(&self) -> ClientResult<Session> {
        let current = self
            .current_session()?
            .ok_or_else(|| ClientError::Auth("no session to refresh".into()))?;
        let resp = self
            .request(self.http.post(format!("{}/auth/v1/token", self.url)))
            .query(&[("grant_type", "refresh_token")])
            .json(&serde_json::json!({ "refresh_token": current.refresh_token }))
            .send()
            .await
            .map_err(|e| ClientError::Auth(format!("session refresh failed: {e}")))?;
        let token = read_auth_response(resp).await?;
        let session = token
            .into_session()
            .ok_or_else(|| ClientError::Auth("refresh returned no session".into()))?;
        self.store_session(&session);
        debug!(user_id = %session.user.id, "session refreshed");
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Object storage
    // -----------------------------------------------------------------------

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.url)
    }

    /// Upload without overwrite and return the object's public URL.
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ClientResult<String> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.url);
        with_credential(self, |token| {
            let req = self
                .request(self.http.post(&url))
                .bearer_auth(token)
                .header("content-type", content_type)
                .header("x-upsert", "false")
                .body(bytes.clone());
            async move {
                let resp = req.send().await?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(match ClientError::from_status(status.as_u16(), &body) {
                        e if e.is_unauthorized() => e,
                        e => ClientError::provider(format!("upload failed: {e}")),
                    });
                }
                Ok(())
            }
        })
        .await?;
        Ok(self.public_url(bucket, path))
    }
}

#[async_trait]
impl CredentialProvider for SupabaseAuth {
    async fn access_token(&self) -> ClientResult<AccessToken> {
        let session = self
            .current_session()?
            .ok_or_else(|| ClientError::Auth("not signed in".into()))?;
        if session.is_expired(chrono::Utc::now().timestamp()) {
            return self.refresh().await.map(AccessToken::refreshed);
        }
        Ok(AccessToken::stored(session.access_token))
    }

    async fn refresh(&self) -> ClientResult<String> {
        self.refresh_session()
            .await
            .map(|s| s.access_token)
            .map_err(|e| match e {
                ClientError::Auth(_) => e,
                other => ClientError::Auth(format!("session refresh failed: {other}")),
            })
    }
}

async fn read_auth_response(resp: reqwest::Response) -> ClientResult<TokenResponse> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                ["error_description", "msg", "message", "error"]
                    .iter()
                    .find_map(|k| v[*k].as_str().map(String::from))
            })
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return Err(match status.as_u16() {
            400 | 401 | 403 | 422 => ClientError::Auth(message),
            code => ClientError::Http {
                status: code,
                message,
            },
        });
    }
    Ok(resp.json::<TokenResponse>().await?)
}

// ---------------------------------------------------------------------------
// Authenticated backend access
// ---------------------------------------------------------------------------

/// Backend client bound to a credential provider. Implements the source
/// traits consumed by the pollers, the wizard and the opt-in flow.
#[derive(Clone)]
pub struct AuthedApi {
    pub api: ApiClient,
    pub creds: Arc<dyn CredentialProvider>,
}

impl AuthedApi {
    pub fn new(api: ApiClient, creds: Arc<dyn CredentialProvider>) -> Self {
        Self { api, creds }
    }

    pub async fn call<T, F, Fut>(&self, f: F) -> ClientResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        with_credential(self.creds.as_ref(), f).await
    }
}
