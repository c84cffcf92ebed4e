pub mod types;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use types::{
    ChargeStatus, CountriesResponse, Country, CreditPackage, GenerateRequest, GenerationJob,
    InitiatePaymentRequest, InitiatePaymentResponse, LyricsRequest, LyricsResponse, Project,
    ProjectCreate, SharedProject, Style, StylesResponse, SubscribeRequest, VapidKeyResponse,
    VerifyPaymentResponse, Wallet,
};

/// Upper bound for one request, connect through body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client shared by the backend and auth clients. Every request is
/// bounded by `timeout`; an elapsed request surfaces as
/// [`ClientError::Network`].
pub fn http_client(timeout: Duration) -> ClientResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()
        .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {e}")))
}

/// Typed client for the BimZik backend (`{base_url}/api/v1/...`).
///
/// Stateless with respect to credentials: authenticated calls take the bearer
/// token explicitly. See [`crate::auth::AuthedApi`] for the refresh-aware
/// wrapper.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        Ok(Self::with_client(http_client(REQUEST_TIMEOUT)?, base_url))
    }

    /// Reuse an existing connection pool.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str, token: Option<&str>) -> RequestBuilder {
        let req = self.http.get(self.url(path));
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn post(&self, path: &str, token: Option<&str>) -> RequestBuilder {
        let req = self.http.post(self.url(path));
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// GET /generate/jobs/{job_id}: one status snapshot.
    pub async fn get_job(&self, job_id: &str, token: &str) -> ClientResult<GenerationJob> {
        let resp = self
            .get(&format!("generate/jobs/{job_id}"), Some(token))
            .send()
            .await?;
        read_json(resp).await
    }

    /// POST /generate/: starts generation for an existing project. 402 means
    /// the wallet cannot cover the cost.
    pub async fn start_generation(
        &self,
        project_id: &str,
        token: &str,
    ) -> ClientResult<GenerationJob> {
        let resp = self
            .post("generate/", Some(token))
            .json(&GenerateRequest {
                project_id: project_id.to_string(),
            })
            .send()
            .await?;
        read_json(resp).await
    }

    /// POST /generate/lyrics
    pub async fn generate_lyrics(
        &self,
        req: &LyricsRequest,
        token: &str,
    ) -> ClientResult<LyricsResponse> {
        let resp = self
            .post("generate/lyrics", Some(token))
            .json(req)
            .send()
            .await?;
        read_json(resp).await
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, req: &ProjectCreate, token: &str) -> ClientResult<Project> {
        let resp = self.post("projects/", Some(token)).json(req).send().await?;
        read_json(resp).await
    }

    pub async fn list_projects(&self, token: &str) -> ClientResult<Vec<Project>> {
        let resp = self.get("projects/", Some(token)).send().await?;
        read_json(resp).await
    }

    pub async fn get_project(&self, project_id: &str, token: &str) -> ClientResult<Project> {
        let resp = self
            .get(&format!("projects/{project_id}"), Some(token))
            .send()
            .await?;
        read_json(resp).await
    }

    /// GET /share/{id}: public, no credential.
    pub async fn get_shared_project(&self, project_id: &str) -> ClientResult<SharedProject> {
        let resp = self.get(&format!("share/{project_id}"), None).send().await?;
        read_json(resp).await
    }

    // -----------------------------------------------------------------------
    // Reference data
    // -----------------------------------------------------------------------

    /// GET /styles/: the backend has served both a bare list and
    /// `{"styles": [...]}`; accept either.
    pub async fn list_styles(&self) -> ClientResult<Vec<Style>> {
        let resp = self.get("styles/", None).send().await?;
        let value: serde_json::Value = read_json(resp).await?;
        if value.is_array() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(serde_json::from_value::<StylesResponse>(value)?.styles)
        }
    }

    pub async fn get_wallet(&self, token: &str) -> ClientResult<Wallet> {
        let resp = self.get("users/wallet", Some(token)).send().await?;
        read_json(resp).await
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    pub async fn vapid_public_key(&self) -> ClientResult<String> {
        let resp = self.get("notifications/vapid-key", None).send().await?;
        let body: VapidKeyResponse = read_json(resp).await?;
        Ok(body.vapid_public_key)
    }

    pub async fn subscribe(&self, req: &SubscribeRequest, token: &str) -> ClientResult<()> {
        let resp = self
            .post("notifications/subscribe", Some(token))
            .json(req)
            .send()
            .await?;
        let _: serde_json::Value = read_json(resp).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Payments
    // -----------------------------------------------------------------------

    pub async fn list_packages(&self) -> ClientResult<Vec<CreditPackage>> {
        let resp = self.get("payments/packages", None).send().await?;
        read_json(resp).await
    }

    pub async fn list_countries(&self) -> ClientResult<Vec<Country>> {
        let resp = self.get("payments/countries", None).send().await?;
        let body: CountriesResponse = read_json(resp).await?;
        Ok(body.countries)
    }

    pub async fn initiate_payment(
        &self,
        req: &InitiatePaymentRequest,
        token: &str,
    ) -> ClientResult<InitiatePaymentResponse> {
        let resp = self
            .post("payments/initiate", Some(token))
            .json(req)
            .send()
            .await?;
        read_json(resp).await
    }

    /// GET /payments/charge-status/{tx_ref}: mobile-money approval state.
    pub async fn charge_status(&self, tx_ref: &str, token: &str) -> ClientResult<ChargeStatus> {
        let resp = self
            .get(&format!("payments/charge-status/{tx_ref}"), Some(token))
            .send()
            .await?;
        read_json(resp).await
    }

    /// GET /payments/verify/{tx_ref}[?transaction_id=]: card redirect check.
    pub async fn verify_payment(
        &self,
        tx_ref: &str,
        transaction_id: Option<&str>,
        token: &str,
    ) -> ClientResult<VerifyPaymentResponse> {
        let mut req = self.get(&format!("payments/verify/{tx_ref}"), Some(token));
        if let Some(id) = transaction_id {
            req = req.query(&[("transaction_id", id)]);
        }
        let resp = req.send().await?;
        read_json(resp).await
    }
}

/// Map a response to `T`, turning non-2xx into [`ClientError::from_status`]
/// and an unparseable 2xx body into [`ClientError::Decode`].
pub(crate) async fn read_json<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let status = resp.status();
    let url = resp.url().path().to_string();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        debug!(%url, status = status.as_u16(), "API request failed");
        return Err(ClientError::from_status(status.as_u16(), &body));
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::Decode(format!("{url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_prefixed_and_normalised() {
        let api = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:8000");
        assert_eq!(
            api.url("generate/jobs/j1"),
            "http://localhost:8000/api/v1/generate/jobs/j1"
        );
        assert_eq!(api.url("/projects/"), "http://localhost:8000/api/v1/projects/");
    }

    #[tokio::test]
    async fn silent_server_surfaces_as_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let http = http_client(Duration::from_millis(200)).unwrap();
        let api = ApiClient::with_client(http, format!("http://{addr}"));
        let result = tokio::time::timeout(Duration::from_secs(5), api.get_job("j1", "t")).await;

        let err = result.expect("request was not bounded").unwrap_err();
        assert!(matches!(err, ClientError::Network(_)), "got {err:?}");
    }
}
