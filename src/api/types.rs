use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Generation jobs
// GET  {base}/api/v1/generate/jobs/{id}
// POST {base}/api/v1/generate/
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Generating,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Snapshot of a backend generation job. The backend owns every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub video_status: Option<VideoStatus>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default, alias = "error_message")]
    pub error: Option<String>,
    #[serde(default)]
    pub credits_cost: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct GenerateRequest {
    pub project_id: String,
}

#[derive(Debug, Serialize)]
pub struct LyricsRequest {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    pub language: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LyricsResponse {
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub candidates: Option<Vec<String>>,
}

impl LyricsResponse {
    /// Candidates in display order; a bare `lyrics` field counts as one.
    pub fn into_candidates(self) -> Vec<String> {
        match self.candidates {
            Some(c) if !c.is_empty() => c,
            _ => self.lyrics.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Projects
// POST {base}/api/v1/projects/
// GET  {base}/api/v1/projects/[{id}]
// GET  {base}/api/v1/share/{id}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProjectCreate {
    pub title: String,
    pub mode: String, // "TEXT" | "CONTEXT"
    pub language: String,
    pub style_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lyrics_final: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub style_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub lyrics_final: Option<String>,
    #[serde(default)]
    pub context_input: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Public, unauthenticated view of a project for the share page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedProject {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub style_id: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Styles & wallet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StylesResponse {
    #[serde(default)]
    pub styles: Vec<Style>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub credits: i64,
    #[serde(default)]
    pub credits_reserved: i64,
    #[serde(default)]
    pub credits_available: Option<i64>,
}

// ---------------------------------------------------------------------------
// Notifications
// GET  {base}/api/v1/notifications/vapid-key
// POST {base}/api/v1/notifications/subscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VapidKeyResponse {
    pub vapid_public_key: String,
}

/// Push endpoint and keys produced by the platform push runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum SubscribeRequest {
    Email {
        job_id: String,
        destination: String,
    },
    Push {
        job_id: String,
        subscription: PushSubscription,
    },
}

// ---------------------------------------------------------------------------
// Payments
// GET  {base}/api/v1/payments/packages | countries
// POST {base}/api/v1/payments/initiate
// GET  {base}/api/v1/payments/charge-status/{tx_ref}
// GET  {base}/api/v1/payments/verify/{tx_ref}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub price: f64,
    pub currency: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub is_popular: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub currency: String,
    pub dial_code: String,
    pub mobile_money: bool,
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CountriesResponse {
    pub countries: Vec<Country>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    MobileMoney,
    Card,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatePaymentRequest {
    pub package_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePaymentResponse {
    #[serde(default)]
    pub payment_link: Option<String>,
    pub transaction_id: String,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Pending,
    Successful,
    Failed,
}

impl ChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeStatus {
    pub status: ChargeState,
    #[serde(default)]
    pub message: String,
    pub tx_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
