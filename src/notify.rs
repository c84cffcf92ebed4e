//! Per-job notification opt-in: push through a platform runtime when one is
//! available, email otherwise.

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::types::{PushSubscription, SubscribeRequest};
use crate::auth::AuthedApi;
use crate::db::SharedDb;
use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Email => "email",
        }
    }
}

/// Permission as the runtime currently reports it, before any prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Prompt,
    Granted,
    Denied,
}

/// Result of the user-gesture permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
    Dismissed,
}

/// Platform push-delivery capability.
#[async_trait]
pub trait PushRuntime: Send + Sync {
    fn permission(&self) -> PermissionState;

    async fn request_permission(&self) -> PermissionOutcome;

    /// Register with the platform push service for the given application
    /// server key (raw P-256 public key bytes).
    async fn subscribe(&self, application_server_key: &[u8]) -> ClientResult<PushSubscription>;
}

/// Backend calls the opt-in flow needs.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn vapid_public_key(&self) -> ClientResult<String>;
    async fn subscribe(&self, req: &SubscribeRequest) -> ClientResult<()>;
}

#[async_trait]
impl NotificationApi for AuthedApi {
    async fn vapid_public_key(&self) -> ClientResult<String> {
        self.api.vapid_public_key().await
    }

    async fn subscribe(&self, req: &SubscribeRequest) -> ClientResult<()> {
        let api = &self.api;
        self.call(|token| async move { api.subscribe(req, &token).await })
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OptInState {
    Choosing,
    Subscribed { channel: Channel, destination: String },
}

pub struct NotificationOptIn {
    job_id: String,
    push: Option<Arc<dyn PushRuntime>>,
    /// Set once the prompt was denied or dismissed; sticks for the session.
    push_blocked: bool,
    store: Option<SharedDb>,
    state: OptInState,
}

impl NotificationOptIn {
    /// A previously confirmed subscription for `job_id` in `store` is picked
    /// up as the starting state.
    pub fn new(
        job_id: impl Into<String>,
        push: Option<Arc<dyn PushRuntime>>,
        store: Option<SharedDb>,
    ) -> Self {
        let job_id = job_id.into();
        let state = store
            .as_ref()
            .and_then(|db| existing_subscription(db, &job_id))
            .unwrap_or(OptInState::Choosing);
        let push_blocked = push
            .as_ref()
            .is_some_and(|rt| rt.permission() == PermissionState::Denied);
        Self {
            job_id,
            push,
            push_blocked,
            store,
            state,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> &OptInState {
        &self.state
    }

    /// Channels to offer. Email is always available.
    pub fn channels(&self) -> Vec<Channel> {
        if self.push.is_some() && !self.push_blocked {
            vec![Channel::Push, Channel::Email]
        } else {
            vec![Channel::Email]
        }
    }

    /// Prompt for permission, then register a push subscription with the
    /// backend. Nothing is recorded unless every stage succeeds.
    pub async fn enable_push(&mut self, api: &dyn NotificationApi) -> ClientResult<OptInState> {
        let runtime = match (&self.push, self.push_blocked) {
            (Some(rt), false) => Arc::clone(rt),
            _ => {
                return Err(ClientError::provider(
                    "push notifications are unavailable, use email instead",
                ))
            }
        };

        match runtime.request_permission().await {
            PermissionOutcome::Granted => {}
            outcome => {
                info!(job_id = %self.job_id, ?outcome, "push permission not granted, falling back to email");
                self.push_blocked = true;
                return Err(ClientError::provider(
                    "notification permission was not granted, use email instead",
                ));
            }
        }

        let key = api.vapid_public_key().await?;
        let key = decode_server_key(&key)?;
        let subscription = runtime.subscribe(&key).await?;
        let endpoint = subscription.endpoint.clone();

        api.subscribe(&SubscribeRequest::Push {
            job_id: self.job_id.clone(),
            subscription,
        })
        .await?;

        info!(job_id = %self.job_id, "push notifications enabled");
        Ok(self.confirm(Channel::Push, endpoint))
    }

    /// Subscribe an email address. Repeating the call with the destination
    /// already confirmed for this job returns the existing state.
    pub async fn subscribe_email(
        &mut self,
        api: &dyn NotificationApi,
        destination: &str,
    ) -> ClientResult<OptInState> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(ClientError::validation("Please enter an email address"));
        }
        if let OptInState::Subscribed {
            channel: Channel::Email,
            destination: current,
        } = &self.state
        {
            if current == destination {
                debug!(job_id = %self.job_id, "email subscription already confirmed");
                return Ok(self.state.clone());
            }
        }

        api.subscribe(&SubscribeRequest::Email {
            job_id: self.job_id.clone(),
            destination: destination.to_string(),
        })
        .await?;

        info!(job_id = %self.job_id, "email notifications enabled");
        Ok(self.confirm(Channel::Email, destination.to_string()))
    }

    fn confirm(&mut self, channel: Channel, destination: String) -> OptInState {
        if let Some(db) = &self.store {
            match db.lock() {
                Ok(db) => {
                    if let Err(e) =
                        db.upsert_subscription(&self.job_id, channel.as_str(), &destination)
                    {
                        warn!(job_id = %self.job_id, "failed to record subscription: {e:#}");
                    }
                }
                Err(e) => warn!("db lock poisoned, subscription not recorded: {e}"),
            }
        }
        self.state = OptInState::Subscribed {
            channel,
            destination,
        };
        self.state.clone()
    }
}

fn existing_subscription(db: &SharedDb, job_id: &str) -> Option<OptInState> {
    let rows = db.lock().ok()?.get_subscriptions(job_id).ok()?;
    let row = rows.into_iter().last()?;
    let channel = match row.channel.as_str() {
        "push" => Channel::Push,
        "email" => Channel::Email,
        _ => return None,
    };
    Some(OptInState::Subscribed {
        channel,
        destination: row.destination,
    })
}

/// VAPID keys are served base64url-encoded, with or without padding.
fn decode_server_key(key: &str) -> ClientResult<Vec<u8>> {
    let trimmed = key.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(ClientError::provider("server returned an empty push key"));
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| ClientError::provider(format!("invalid push key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const KEY: &str = "BEl62iUYgUivxIkv69yViEuiBIa-Ib9-SkvMeAtA3LFgDzkrxZJjSgSnfckjBJuBkr3qBUYIHBQFLXYp5Nksh8U";

    #[derive(Default)]
    struct FakeApi {
        fail_key: bool,
        fail_subscribe: bool,
        key_calls: AtomicUsize,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl NotificationApi for FakeApi {
        async fn vapid_public_key(&self) -> ClientResult<String> {
            self.key_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_key {
                return Err(ClientError::Network("offline".into()));
            }
            Ok(KEY.to_string())
        }

        async fn subscribe(&self, req: &SubscribeRequest) -> ClientResult<()> {
            if self.fail_subscribe {
                return Err(ClientError::from_status(500, ""));
            }
            self.requests
                .lock()
                .unwrap()
                .push(serde_json::to_value(req).unwrap());
            Ok(())
        }
    }

    struct FakeRuntime {
        current: PermissionState,
        prompt: PermissionOutcome,
        seen_key_len: AtomicUsize,
    }

    impl FakeRuntime {
        fn new(current: PermissionState, prompt: PermissionOutcome) -> Arc<Self> {
            Arc::new(Self {
                current,
                prompt,
                seen_key_len: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PushRuntime for FakeRuntime {
        fn permission(&self) -> PermissionState {
            self.current
        }

        async fn request_permission(&self) -> PermissionOutcome {
            self.prompt
        }

        async fn subscribe(&self, key: &[u8]) -> ClientResult<PushSubscription> {
            self.seen_key_len.store(key.len(), Ordering::SeqCst);
            Ok(PushSubscription {
                endpoint: "https://push.example/ep1".into(),
                p256dh: "p256".into(),
                auth: "auth".into(),
            })
        }
    }

    fn store() -> SharedDb {
        crate::db::Db::open_in_memory().unwrap().into_shared()
    }

    #[tokio::test]
    async fn email_opt_in_is_idempotent() {
        let api = FakeApi::default();
        let db = store();
        let mut opt = NotificationOptIn::new("job-1", None, Some(db.clone()));

        let first = opt.subscribe_email(&api, "user@example.com").await.unwrap();
        let second = opt.subscribe_email(&api, " user@example.com ").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.requests.lock().unwrap().len(), 1);
        assert_eq!(db.lock().unwrap().get_subscriptions("job-1").unwrap().len(), 1);

        // A fresh opt-in for the same job picks up the confirmed state.
        let mut again = NotificationOptIn::new("job-1", None, Some(db.clone()));
        assert_eq!(*again.state(), first);
        again.subscribe_email(&api, "user@example.com").await.unwrap();
        assert_eq!(api.requests.lock().unwrap().len(), 1);
        assert_eq!(db.lock().unwrap().get_subscriptions("job-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_email_is_rejected_locally() {
        let api = FakeApi::default();
        let mut opt = NotificationOptIn::new("job-1", None, None);
        let err = opt.subscribe_email(&api, "   ").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(api.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_happy_path_sends_subscription() {
        let api = FakeApi::default();
        let rt = FakeRuntime::new(PermissionState::Prompt, PermissionOutcome::Granted);
        let mut opt = NotificationOptIn::new("job-1", Some(rt.clone()), None);
        assert_eq!(opt.channels(), vec![Channel::Push, Channel::Email]);

        let state = opt.enable_push(&api).await.unwrap();
        assert!(matches!(state, OptInState::Subscribed { channel: Channel::Push, .. }));
        assert_eq!(rt.seen_key_len.load(Ordering::SeqCst), 65);

        let sent = api.requests.lock().unwrap();
        assert_eq!(sent[0]["channel"], "push");
        assert_eq!(sent[0]["subscription"]["endpoint"], "https://push.example/ep1");
    }

    #[tokio::test]
    async fn dismissed_prompt_falls_back_to_email_for_the_session() {
        let api = FakeApi::default();
        let rt = FakeRuntime::new(PermissionState::Prompt, PermissionOutcome::Dismissed);
        let mut opt = NotificationOptIn::new("job-1", Some(rt), None);

        assert!(matches!(
            opt.enable_push(&api).await,
            Err(ClientError::Provider(_))
        ));
        assert_eq!(opt.channels(), vec![Channel::Email]);
        assert_eq!(api.key_calls.load(Ordering::SeqCst), 0);
        assert!(opt.enable_push(&api).await.is_err());
    }

    #[tokio::test]
    async fn denied_runtime_or_no_runtime_offers_email_only() {
        let rt = FakeRuntime::new(PermissionState::Denied, PermissionOutcome::Denied);
        let opt = NotificationOptIn::new("job-1", Some(rt), None);
        assert_eq!(opt.channels(), vec![Channel::Email]);

        let opt = NotificationOptIn::new("job-1", None, None);
        assert_eq!(opt.channels(), vec![Channel::Email]);
    }

    #[tokio::test]
    async fn failed_key_fetch_leaves_no_state_behind() {
        let api = FakeApi {
            fail_key: true,
            ..Default::default()
        };
        let db = store();
        let rt = FakeRuntime::new(PermissionState::Granted, PermissionOutcome::Granted);
        let mut opt = NotificationOptIn::new("job-1", Some(rt.clone()), Some(db.clone()));

        assert!(opt.enable_push(&api).await.is_err());
        assert_eq!(*opt.state(), OptInState::Choosing);
        assert_eq!(rt.seen_key_len.load(Ordering::SeqCst), 0);
        assert!(db.lock().unwrap().get_subscriptions("job-1").unwrap().is_empty());
        // Still retryable.
        assert_eq!(opt.channels(), vec![Channel::Push, Channel::Email]);
    }

    #[tokio::test]
    async fn failed_backend_subscribe_persists_nothing() {
        let api = FakeApi {
            fail_subscribe: true,
            ..Default::default()
        };
        let db = store();
        let rt = FakeRuntime::new(PermissionState::Prompt, PermissionOutcome::Granted);
        let mut opt = NotificationOptIn::new("job-1", Some(rt), Some(db.clone()));

        let err = opt.enable_push(&api).await.unwrap_err();
        assert!(matches!(err, ClientError::Http { .. }), "got {err:?}");
        assert_eq!(*opt.state(), OptInState::Choosing);
        assert!(db.lock().unwrap().get_subscriptions("job-1").unwrap().is_empty());
    }

    #[test]
    fn server_key_accepts_padding() {
        assert_eq!(decode_server_key("AQID").unwrap(), vec![1, 2, 3]);
        assert_eq!(decode_server_key("AQI=").unwrap(), vec![1, 2]);
        assert!(decode_server_key("").is_err());
        assert!(decode_server_key("not base64!").is_err());
    }
}
