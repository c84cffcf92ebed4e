use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::types::PaymentMethod;
use crate::checkout::{verify_redirect, Checkout, CustomerInfo, Initiated, RedirectParams};
use crate::error::ClientError;
use crate::notify::NotificationOptIn;
use crate::poll::job::{JobPhase, JobSource, JobWatch, JobWatchOptions};
use crate::poll::payment::{ChargeSource, PaymentPhase, PaymentWatch};
use crate::wizard::{Language, SongMode, SubmitOutcome, Voice, WizardDraft};
use crate::AppState;

// ---------------------------------------------------------------------------
// Tool parameter schemas (derive JsonSchema for rmcp auto-schema)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SignInParams {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProjectParams {
    pub project_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSongParams {
    /// Song title.
    pub title: String,
    /// Style ID from list_styles.
    pub style_id: String,
    /// "text" when lyrics are supplied, "idea" to generate them from `description`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Full lyrics (text mode).
    #[serde(default)]
    pub lyrics: Option<String>,
    /// Idea or story the lyrics should be written from (idea mode).
    #[serde(default)]
    pub description: Option<String>,
    /// "fr" (default) or "en".
    #[serde(default)]
    pub language: Option<String>,
    /// "auto" (default), "male" or "female".
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct JobParams {
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WaitForJobParams {
    pub job_id: String,
    /// Give up waiting after this many seconds. Defaults to 300.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BuyCreditsParams {
    /// Package ID from list_packages.
    pub package_id: String,
    /// Customer full name.
    pub name: String,
    /// ISO country code, e.g. "CM".
    pub country: String,
    /// Phone number including country code.
    pub phone: String,
    /// "mobile_money" or "card".
    pub method: String,
    /// Mobile network ID (mobile money only), e.g. "MTN".
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PaymentStatusParams {
    pub tx_ref: String,
    /// Ask the backend right away instead of returning the last known state.
    #[serde(default)]
    pub check_now: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct VerifyCardParams {
    pub tx_ref: String,
    /// `status` query parameter from the redirect URL.
    #[serde(default)]
    pub status: Option<String>,
    /// `transaction_id` query parameter from the redirect URL.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NotifyByEmailParams {
    pub job_id: String,
    pub email: String,
}

fn parse_mode(raw: Option<&str>) -> Result<SongMode, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(SongMode::default()),
        Some(m) if m.eq_ignore_ascii_case("text") => Ok(SongMode::Text),
        Some(m) if m.eq_ignore_ascii_case("idea") || m.eq_ignore_ascii_case("context") => {
            Ok(SongMode::Idea)
        }
        Some(other) => Err(format!("unknown mode '{other}', expected 'text' or 'idea'")),
    }
}

fn parse_language(raw: Option<&str>) -> Result<Language, String> {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => Ok(Language::default()),
        Some("fr") => Ok(Language::Fr),
        Some("en") => Ok(Language::En),
        Some(other) => Err(format!("unsupported language '{other}'")),
    }
}

fn parse_voice(raw: Option<&str>) -> Result<Voice, String> {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("auto") => Ok(Voice::Auto),
        Some("male") => Ok(Voice::Male),
        Some("female") => Ok(Voice::Female),
        Some(other) => Err(format!("unknown voice '{other}'")),
    }
}

fn parse_method(raw: &str) -> Result<PaymentMethod, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "mobile_money" | "momo" => Ok(PaymentMethod::MobileMoney),
        "card" => Ok(PaymentMethod::Card),
        other => Err(format!("unknown payment method '{other}'")),
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string(value)
        .map_err(|e| ErrorData::internal_error(format!("failed to serialize result: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn tool_error(msg: impl std::fmt::Display) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

// ---------------------------------------------------------------------------
// Mobile-money watches
// ---------------------------------------------------------------------------

/// Settled payments need no watch. Failures a manual check may still
/// overturn keep theirs.
fn is_settled(phase: &PaymentPhase) -> bool {
    phase.is_terminal() && !phase.is_reconcilable()
}

/// Running payment watches keyed by tx_ref. The map lock is never held
/// across a request.
#[derive(Clone, Default)]
struct PaymentWatches {
    inner: Arc<Mutex<HashMap<String, Arc<PaymentWatch>>>>,
}

impl PaymentWatches {
    async fn insert(&self, tx_ref: String, watch: PaymentWatch) {
        let mut map = self.inner.lock().await;
        map.retain(|_, w| !is_settled(&w.state().phase));
        map.insert(tx_ref, Arc::new(watch));
    }

    async fn get(&self, tx_ref: &str) -> Option<Arc<PaymentWatch>> {
        self.inner.lock().await.get(tx_ref).cloned()
    }

    async fn forget(&self, tx_ref: &str) {
        self.inner.lock().await.remove(tx_ref);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BimZikMcp {
    state: AppState,
    payments: PaymentWatches,
    tool_router: ToolRouter<Self>,
}

impl BimZikMcp {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            payments: PaymentWatches::default(),
            tool_router: Self::tool_router(),
        }
    }

    fn signed_in_user(&self) -> Result<String, ClientError> {
        self.state
            .auth
            .current_session()?
            .map(|s| s.user.id)
            .ok_or_else(|| ClientError::Auth("not signed in, call sign_in first".into()))
    }
}

#[tool_router]
impl BimZikMcp {
    #[tool(description = "Sign in to BimZik with email and password. \
        The session is stored locally and refreshed automatically.")]
    async fn sign_in(
        &self,
        Parameters(params): Parameters<SignInParams>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.state.auth.sign_in(params.email.trim(), &params.password).await {
            Ok(session) => json_result(&serde_json::json!({
                "userId": session.user.id,
                "email": session.user.email,
            })),
            Err(e) => tool_error(format!("Sign-in failed: {e}")),
        }
    }

    #[tool(description = "Create a BimZik account. When the account needs email confirmation \
        no session is returned and sign_in must be called after confirming.")]
    async fn sign_up(
        &self,
        Parameters(params): Parameters<SignInParams>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.state.auth.sign_up(params.email.trim(), &params.password).await {
            Ok(Some(session)) => json_result(&serde_json::json!({
                "userId": session.user.id,
                "confirmationRequired": false,
            })),
            Ok(None) => json_result(&serde_json::json!({ "confirmationRequired": true })),
            Err(e) => tool_error(format!("Sign-up failed: {e}")),
        }
    }

    #[tool(description = "Sign out and forget the stored session.")]
    async fn sign_out(&self) -> Result<CallToolResult, ErrorData> {
        match self.state.auth.sign_out().await {
            Ok(()) => json_result(&serde_json::json!({ "signedOut": true })),
            Err(e) => tool_error(format!("Sign-out failed: {e}")),
        }
    }

    #[tool(description = "Credit balance of the signed-in user.")]
    async fn get_wallet(&self) -> Result<CallToolResult, ErrorData> {
        let api = &self.state.api.api;
        match self
            .state
            .api
            .call(|token| async move { api.get_wallet(&token).await })
            .await
        {
            Ok(wallet) => json_result(&wallet),
            Err(e) => tool_error(format!("Failed to load wallet: {e}")),
        }
    }

    #[tool(description = "List the music styles a song can be created in.")]
    async fn list_styles(&self) -> Result<CallToolResult, ErrorData> {
        match self.state.api.api.list_styles().await {
            Ok(styles) => json_result(&styles),
            Err(e) => tool_error(format!("Failed to list styles: {e}")),
        }
    }

    #[tool(description = "List the signed-in user's projects.")]
    async fn list_projects(&self) -> Result<CallToolResult, ErrorData> {
        let api = &self.state.api.api;
        match self
            .state
            .api
            .call(|token| async move { api.list_projects(&token).await })
            .await
        {
            Ok(projects) => json_result(&projects),
            Err(e) => tool_error(format!("Failed to list projects: {e}")),
        }
    }

    #[tool(description = "Details of one project, including the audio URL once generated.")]
    async fn get_project(
        &self,
        Parameters(params): Parameters<ProjectParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let api = &self.state.api.api;
        let id = params.project_id.as_str();
        match self
            .state
            .api
            .call(|token| async move { api.get_project(id, &token).await })
            .await
        {
            Ok(project) => json_result(&project),
            Err(e) => tool_error(format!("Failed to load project: {e}")),
        }
    }

    #[tool(description = "Public share view of a project. Works without signing in.")]
    async fn shared_project(
        &self,
        Parameters(params): Parameters<ProjectParams>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.state.api.api.get_shared_project(&params.project_id).await {
            Ok(shared) => json_result(&shared),
            Err(e) => tool_error(format!("Failed to load shared project: {e}")),
        }
    }

    #[tool(description = "Create a song and start generating it. \
        In 'text' mode pass the lyrics; in 'idea' mode pass a description and lyrics are written first. \
        Returns a jobId to follow with job_status or wait_for_job. \
        If the wallet is empty the project is kept and topUpRequired is returned.")]
    async fn create_song(
        &self,
        Parameters(params): Parameters<CreateSongParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let mut draft = WizardDraft::new();
        let parsed = (|| -> Result<(), String> {
            draft.mode = parse_mode(params.mode.as_deref())?;
            draft.language = parse_language(params.language.as_deref())?;
            draft.voice = parse_voice(params.voice.as_deref())?;
            Ok(())
        })();
        if let Err(e) = parsed {
            return tool_error(e);
        }
        draft.select_style(params.style_id, None);
        draft.title = params.title;
        draft.description = params.description.unwrap_or_default();
        draft.lyrics = params.lyrics.unwrap_or_default();

        let user_id = match self.signed_in_user() {
            Ok(id) => id,
            Err(e) => return tool_error(e),
        };

        if draft.mode == SongMode::Idea && draft.lyrics.trim().is_empty() {
            if let Err(e) = draft.generate_lyrics(&self.state.api).await {
                return tool_error(format!("Failed to write lyrics: {e}"));
            }
        }

        match draft
            .submit(&self.state.api, self.state.auth.as_ref(), &user_id)
            .await
        {
            Ok(SubmitOutcome::Started { project_id, job_id }) => {
                if let Ok(db) = self.state.db.lock() {
                    if let Err(e) = db.upsert_job(&job_id, Some(&project_id), "queued", None, None) {
                        warn!(%job_id, "failed to record job: {e:#}");
                    }
                }
                json_result(&serde_json::json!({
                    "projectId": project_id,
                    "jobId": job_id,
                    "lyrics": draft.lyrics,
                }))
            }
            Ok(SubmitOutcome::TopUpRequired { project_id }) => json_result(&serde_json::json!({
                "projectId": project_id,
                "topUpRequired": true,
                "message": "Not enough credits. Buy credits with buy_credits, the project is kept.",
            })),
            Err(e) => tool_error(format!("Failed to create song: {e}")),
        }
    }

    #[tool(description = "Fetch the current status of a generation job once.")]
    async fn job_status(
        &self,
        Parameters(params): Parameters<JobParams>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.state.api.fetch_job(&params.job_id).await {
            Ok(job) => json_result(&job),
            Err(e) => tool_error(format!("Failed to fetch job: {e}")),
        }
    }

    #[tool(description = "Follow a generation job until it completes or fails, using the same \
        backoff and error limits as the app. Returns the final phase, or the latest \
        progress if timeout_secs elapses first.")]
    async fn wait_for_job(
        &self,
        Parameters(params): Parameters<WaitForJobParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let source: Arc<dyn JobSource> = Arc::new(self.state.api.clone());
        let watch = JobWatch::start(
            source,
            params.job_id.clone(),
            JobWatchOptions {
                policy: self.state.settings.job_policy(),
                on_navigate: None,
                store: Some(self.state.db.clone()),
            },
        );
        let mut rx = watch.subscribe();
        let limit = Duration::from_secs(params.timeout_secs.unwrap_or(300));
        let timed_out = tokio::time::timeout(limit, rx.wait_for(|v| v.phase.is_terminal()))
            .await
            .is_err();
        let view = watch.state();
        watch.cancel();

        match &view.phase {
            JobPhase::Failed(f) => tool_error(serde_json::json!({
                "jobId": view.job_id,
                "failure": f,
            })),
            _ if timed_out => {
                info!(job_id = %params.job_id, "stopped waiting, job still running");
                json_result(&view)
            }
            _ => json_result(&view),
        }
    }

    #[tool(description = "List the credit packages that can be bought.")]
    async fn list_packages(&self) -> Result<CallToolResult, ErrorData> {
        match self.state.api.api.list_packages().await {
            Ok(packages) => json_result(&packages),
            Err(e) => tool_error(format!("Failed to list packages: {e}")),
        }
    }

    #[tool(description = "Buy a credit package. Card payments return a paymentLink to open. \
        Mobile money payments return a txRef; the customer approves on their phone and \
        payment_status follows the approval.")]
    async fn buy_credits(
        &self,
        Parameters(params): Parameters<BuyCreditsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let method = match parse_method(&params.method) {
            Ok(m) => m,
            Err(e) => return tool_error(e),
        };
        let api = &self.state.api.api;
        let (packages, countries) = match tokio::try_join!(api.list_packages(), api.list_countries())
        {
            Ok(v) => v,
            Err(e) => return tool_error(format!("Failed to load checkout data: {e}")),
        };
        let Some(package) = packages.into_iter().find(|p| p.id == params.package_id) else {
            return tool_error(format!("Package '{}' not found", params.package_id));
        };

        let mut checkout = Checkout::new(countries);
        checkout.select_package(package);
        checkout.customer = CustomerInfo {
            name: params.name,
            country: params.country,
            phone: params.phone,
        };
        checkout.select_method(method, params.network);

        match checkout.initiate(&self.state.api, Some(&self.state.db)).await {
            Ok(Initiated::Redirect {
                payment_link,
                tx_ref,
            }) => json_result(&serde_json::json!({
                "txRef": tx_ref,
                "paymentLink": payment_link,
            })),
            Ok(Initiated::AwaitApproval {
                tx_ref,
                instructions,
            }) => {
                let source: Arc<dyn ChargeSource> = Arc::new(self.state.api.clone());
                let watch = PaymentWatch::start(
                    source,
                    tx_ref.clone(),
                    self.state.settings.payment_policy(),
                    Some(self.state.db.clone()),
                );
                self.payments.insert(tx_ref.clone(), watch).await;
                json_result(&serde_json::json!({
                    "txRef": tx_ref,
                    "instructions": instructions,
                }))
            }
            Err(e) => tool_error(format!("Payment could not be started: {e}")),
        }
    }

    #[tool(description = "Status of a credit purchase. Set check_now to ask the payment \
        service immediately, also after automatic checking has given up.")]
    async fn payment_status(
        &self,
        Parameters(params): Parameters<PaymentStatusParams>,
    ) -> Result<CallToolResult, ErrorData> {
        if let Some(watch) = self.payments.get(&params.tx_ref).await {
            let view = if params.check_now {
                match watch.check_now().await {
                    Ok(view) => view,
                    Err(e) => return tool_error(format!("Status check failed: {e}")),
                }
            } else {
                watch.state()
            };
            if is_settled(&view.phase) {
                self.payments.forget(&params.tx_ref).await;
            }
            return json_result(&view);
        }

        match self.state.api.fetch_charge(&params.tx_ref).await {
            Ok(charge) => json_result(&charge),
            Err(e) => tool_error(format!("Status check failed: {e}")),
        }
    }

    #[tool(description = "Confirm a card payment after the payment page redirected back. \
        Pass the tx_ref, status and transaction_id query parameters of the redirect URL.")]
    async fn verify_card_payment(
        &self,
        Parameters(params): Parameters<VerifyCardParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let redirect = RedirectParams {
            status: params.status,
            tx_ref: Some(params.tx_ref),
            transaction_id: params.transaction_id,
        };
        match verify_redirect(&self.state.api, &redirect, Some(&self.state.db)).await {
            Ok(resp) => json_result(&serde_json::json!({
                "success": resp.success,
                "message": resp.message,
            })),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Email the user when a generation job finishes. \
        Calling it again with the same address is safe.")]
    async fn notify_by_email(
        &self,
        Parameters(params): Parameters<NotifyByEmailParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let mut opt_in = NotificationOptIn::new(params.job_id, None, Some(self.state.db.clone()));
        match opt_in.subscribe_email(&self.state.api, &params.email).await {
            Ok(state) => json_result(&state),
            Err(e) => tool_error(format!("Subscription failed: {e}")),
        }
    }
}

#[tool_handler]
impl ServerHandler for BimZikMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(SERVER_INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

const SERVER_INSTRUCTIONS: &str = "\
BimZik MCP server: create AI-generated songs and manage credits.

# Workflow

1. sign_in with the user's email and password (sign_up creates an account).
2. list_styles, then create_song with a style_id. Use mode \"idea\" with a description to have \
lyrics written, or mode \"text\" with full lyrics.
3. wait_for_job with the returned jobId. Generation usually takes one to four minutes; the video \
is rendered after the audio.
4. If create_song reports topUpRequired, check get_wallet, list_packages and buy_credits, then \
create the song again.
5. get_project returns the finished audio; shared_project is the public view.

# Payments

- Card: open the returned paymentLink, then call verify_card_payment with the redirect parameters.
- Mobile money: the customer approves the prompt on their phone. Poll payment_status; use \
check_now=true if automatic checking gave up.
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_song_params_default_optional_fields() {
        let p: CreateSongParams =
            serde_json::from_str(r#"{"title":"Harmattan","style_id":"afrobeat"}"#).unwrap();
        assert!(p.mode.is_none());
        assert!(p.lyrics.is_none());
        assert_eq!(parse_mode(p.mode.as_deref()).unwrap(), SongMode::Idea);
        assert_eq!(parse_language(p.language.as_deref()).unwrap(), Language::Fr);
        assert_eq!(parse_voice(p.voice.as_deref()).unwrap(), Voice::Auto);
    }

    #[test]
    fn option_parsers_reject_unknown_values() {
        assert_eq!(parse_mode(Some("TEXT")).unwrap(), SongMode::Text);
        assert!(parse_mode(Some("poem")).is_err());
        assert_eq!(parse_language(Some("EN")).unwrap(), Language::En);
        assert!(parse_language(Some("de")).is_err());
        assert_eq!(parse_voice(Some("Female")).unwrap(), Voice::Female);
        assert!(parse_voice(Some("robot")).is_err());
        assert_eq!(parse_method("momo").unwrap(), PaymentMethod::MobileMoney);
        assert!(parse_method("paypal").is_err());
    }

    #[test]
    fn payment_status_check_now_defaults_to_false() {
        let p: PaymentStatusParams = serde_json::from_str(r#"{"tx_ref":"tx-1"}"#).unwrap();
        assert!(!p.check_now);
    }

    #[tokio::test]
    async fn tools_require_a_session() {
        let db = crate::db::Db::open_in_memory().unwrap().into_shared();
        let settings = crate::Settings {
            supabase_url: "http://127.0.0.1:9".into(),
            supabase_anon_key: "anon".into(),
            ..Default::default()
        };
        let server = BimZikMcp::new(AppState::with_db(db, settings).unwrap());
        let err = server.signed_in_user().unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
        assert!(server.get_info().instructions.unwrap().contains("create_song"));
    }

    #[tokio::test]
    async fn sign_out_without_session_is_a_no_op() {
        let db = crate::db::Db::open_in_memory().unwrap().into_shared();
        let settings = crate::Settings {
            supabase_url: "http://127.0.0.1:9".into(),
            supabase_anon_key: "anon".into(),
            ..Default::default()
        };
        let server = BimZikMcp::new(AppState::with_db(db, settings).unwrap());
        let result = server.sign_out().await.unwrap();
        assert_ne!(result.is_error, Some(true));
    }

    struct ScriptedCharge {
        state: crate::api::types::ChargeState,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ChargeSource for ScriptedCharge {
        async fn fetch_charge(
            &self,
            tx_ref: &str,
        ) -> crate::error::ClientResult<crate::api::types::ChargeStatus> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::api::types::ChargeStatus {
                status: self.state,
                message: String::new(),
                tx_ref: tx_ref.into(),
            })
        }
    }

    fn charge_watch(state: crate::api::types::ChargeState, delay: Duration) -> PaymentWatch {
        PaymentWatch::start(
            Arc::new(ScriptedCharge { state, delay }),
            "tx",
            Default::default(),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn settled_watches_are_dropped_on_insert() {
        let watches = PaymentWatches::default();
        let done = charge_watch(crate::api::types::ChargeState::Successful, Duration::ZERO);
        let mut rx = done.subscribe();
        rx.wait_for(|v| v.phase.is_terminal()).await.unwrap();
        watches.insert("tx-done".into(), done).await;
        assert_eq!(watches.len().await, 1);

        let pending = charge_watch(crate::api::types::ChargeState::Pending, Duration::ZERO);
        watches.insert("tx-pending".into(), pending).await;
        assert_eq!(watches.len().await, 1);
        assert!(watches.get("tx-done").await.is_none());
        assert!(watches.get("tx-pending").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_does_not_block_other_lookups() {
        let watches = PaymentWatches::default();
        let slow = charge_watch(crate::api::types::ChargeState::Pending, Duration::from_secs(600));
        watches.insert("tx-slow".into(), slow).await;

        let held = watches.get("tx-slow").await.unwrap();
        let check = tokio::spawn(async move { held.check_now().await });
        tokio::task::yield_now().await;

        let lookup = tokio::time::timeout(Duration::from_secs(1), watches.get("tx-other")).await;
        assert!(matches!(lookup, Ok(None)));
        check.abort();
    }
}
