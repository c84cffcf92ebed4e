//! Song-creation wizard: three locally validated steps, then upload, project
//! creation and generation start.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::api::types::{GenerationJob, LyricsRequest, LyricsResponse, Project, ProjectCreate};
use crate::auth::{AuthedApi, SupabaseAuth};
use crate::db::Db;
use crate::error::{ClientError, ClientResult};

pub const INPUT_AUDIO_BUCKET: &str = "input-audio";
const RECORDING_CONTENT_TYPE: &str = "audio/webm";
const DRAFT_KEY: &str = "wizard";
const LAST_STEP: u8 = 3;

/// Backend calls the wizard drives.
#[async_trait]
pub trait SongStudio: Send + Sync {
    async fn generate_lyrics(&self, req: &LyricsRequest) -> ClientResult<LyricsResponse>;
    async fn create_project(&self, req: &ProjectCreate) -> ClientResult<Project>;
    async fn start_generation(&self, project_id: &str) -> ClientResult<GenerationJob>;
}

#[async_trait]
impl SongStudio for AuthedApi {
    async fn generate_lyrics(&self, req: &LyricsRequest) -> ClientResult<LyricsResponse> {
        let api = &self.api;
        self.call(|token| async move { api.generate_lyrics(req, &token).await })
            .await
    }

    async fn create_project(&self, req: &ProjectCreate) -> ClientResult<Project> {
        let api = &self.api;
        self.call(|token| async move { api.create_project(req, &token).await })
            .await
    }

    async fn start_generation(&self, project_id: &str) -> ClientResult<GenerationJob> {
        let api = &self.api;
        self.call(|token| async move { api.start_generation(project_id, &token).await })
            .await
    }
}

/// Blob storage for recorded input. Returns the object's public URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ClientResult<String>;
}

#[async_trait]
impl ObjectStorage for SupabaseAuth {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ClientResult<String> {
        SupabaseAuth::upload(self, bucket, path, bytes, content_type).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongMode {
    /// User supplies the lyrics.
    Text,
    /// User describes an idea; lyrics are generated from it.
    #[default]
    Idea,
}

impl SongMode {
    fn wire(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Idea => "CONTEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    En,
    #[default]
    Fr,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Fr => "fr",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    #[default]
    Auto,
    Male,
    Female,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Generation is running; hand `job_id` to the job poller.
    Started { project_id: String, job_id: String },
    /// The project exists but the wallet could not cover generation.
    TopUpRequired { project_id: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WizardDraft {
    step: u8,
    pub mode: SongMode,
    pub style_id: Option<String>,
    pub style_label: Option<String>,
    pub title: String,
    pub description: String,
    pub lyrics: String,
    pub language: Language,
    pub voice: Voice,
    pub lyrics_candidates: Vec<String>,
    pub selected_candidate: Option<usize>,
    /// Raw recorded audio. Never persisted with the draft.
    #[serde(skip)]
    pub recording: Option<Vec<u8>>,
}

impl WizardDraft {
    pub fn new() -> Self {
        Self {
            step: 1,
            ..Default::default()
        }
    }

    pub fn step(&self) -> u8 {
        self.step.clamp(1, LAST_STEP)
    }

    pub fn select_style(&mut self, id: impl Into<String>, label: Option<String>) {
        self.style_id = Some(id.into());
        self.style_label = label;
    }

    /// Advance one step if the current one is complete.
    pub fn next_step(&mut self) -> ClientResult<u8> {
        let step = self.step();
        self.validate_step(step)?;
        self.step = (step + 1).min(LAST_STEP);
        Ok(self.step)
    }

    pub fn previous_step(&mut self) -> u8 {
        self.step = self.step().saturating_sub(1).max(1);
        self.step
    }

    pub fn validate_step(&self, step: u8) -> ClientResult<()> {
        match step {
            1 => {
                if self.style_id.as_deref().map_or(true, str::is_empty) {
                    return Err(ClientError::validation("Pick a style to continue"));
                }
            }
            2 => {
                if self.title.trim().is_empty() {
                    return Err(ClientError::validation("Give your song a title"));
                }
                if self.lyrics.trim().is_empty() {
                    return Err(ClientError::validation(match self.mode {
                        SongMode::Text => "Enter your lyrics",
                        SongMode::Idea => "Generate lyrics from your idea first",
                    }));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `style` or `style:voice` when a voice was picked.
    pub fn style_payload(&self) -> String {
        let style = self.style_id.clone().unwrap_or_default();
        match self.voice {
            Voice::Auto => style,
            Voice::Male => format!("{style}:male"),
            Voice::Female => format!("{style}:female"),
        }
    }

    pub fn project_payload(&self, audio_url: Option<String>) -> ProjectCreate {
        let description = self.description.trim();
        ProjectCreate {
            title: self.title.trim().to_string(),
            mode: self.mode.wire().to_string(),
            language: self.language.code().to_string(),
            style_id: self.style_payload(),
            context_input: (!description.is_empty()).then(|| description.to_string()),
            lyrics_final: Some(self.lyrics.clone()),
            audio_url,
        }
    }

    // -----------------------------------------------------------------------
    // Lyrics
    // -----------------------------------------------------------------------

    /// Ask the backend for lyrics from the description. The first candidate
    /// becomes the working lyrics.
    pub async fn generate_lyrics(&mut self, studio: &dyn SongStudio) -> ClientResult<&[String]> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(ClientError::validation("Describe your song first"));
        }
        let req = LyricsRequest {
            description: description.to_string(),
            title: Some(self.title.trim().to_string()).filter(|t| !t.is_empty()),
            style: self.style_label.clone(),
            language: self.language.code().to_string(),
        };
        let candidates = studio.generate_lyrics(&req).await?.into_candidates();
        if candidates.is_empty() {
            return Err(ClientError::Decode("lyrics response had no candidates".into()));
        }
        info!(count = candidates.len(), "lyrics candidates generated");
        self.lyrics = candidates[0].clone();
        self.selected_candidate = Some(0);
        self.lyrics_candidates = candidates;
        Ok(&self.lyrics_candidates)
    }

    pub fn select_candidate(&mut self, index: usize) -> ClientResult<()> {
        let lyrics = self
            .lyrics_candidates
            .get(index)
            .ok_or_else(|| ClientError::validation("No such lyrics option"))?;
        self.lyrics = lyrics.clone();
        self.selected_candidate = Some(index);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Upload the recording (if any), create the project, start generation.
    ///
    /// An upload failure aborts before anything is created. A generation
    /// start failure leaves the project in place: 402 is reported as
    /// [`SubmitOutcome::TopUpRequired`], anything else as
    /// [`ClientError::OrphanedProject`].
    pub async fn submit(
        &self,
        studio: &dyn SongStudio,
        storage: &dyn ObjectStorage,
        user_id: &str,
    ) -> ClientResult<SubmitOutcome> {
        self.validate_step(1)?;
        self.validate_step(2)?;

        let audio_url = match &self.recording {
            Some(bytes) => {
                let path = format!(
                    "input-{}-{user_id}.webm",
                    chrono::Utc::now().timestamp_millis()
                );
                let url = storage
                    .upload(INPUT_AUDIO_BUCKET, &path, bytes.clone(), RECORDING_CONTENT_TYPE)
                    .await
                    .map_err(|e| match e {
                        ClientError::Provider(_) | ClientError::Auth(_) => e,
                        other => ClientError::provider(format!("upload failed: {other}")),
                    })?;
                info!(%path, "recording uploaded");
                Some(url)
            }
            None => None,
        };

        let project = studio.create_project(&self.project_payload(audio_url)).await?;
        info!(project_id = %project.id, "project created");

        match studio.start_generation(&project.id).await {
            Ok(job) => {
                info!(project_id = %project.id, job_id = %job.id, "generation started");
                Ok(SubmitOutcome::Started {
                    project_id: project.id,
                    job_id: job.id,
                })
            }
            Err(ClientError::InsufficientBalance(msg)) => {
                warn!(
                    project_id = %project.id,
                    "project left without generation, balance too low: {msg}"
                );
                Ok(SubmitOutcome::TopUpRequired {
                    project_id: project.id,
                })
            }
            Err(e) => {
                error!(project_id = %project.id, "project left without generation: {e}");
                Err(ClientError::OrphanedProject {
                    project_id: project.id,
                    source: Box::new(e),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn save(&self, db: &Db) -> Result<()> {
        let body = serde_json::to_string(self).context("failed to serialize wizard draft")?;
        db.save_draft(DRAFT_KEY, &body)
    }

    /// Saved draft, or `None` when there is none or it no longer parses.
    pub fn load(db: &Db) -> Result<Option<Self>> {
        let Some(body) = db.load_draft(DRAFT_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<Self>(&body) {
            Ok(draft) => Ok(Some(draft)),
            Err(e) => {
                warn!("discarding unreadable wizard draft: {e}");
                Ok(None)
            }
        }
    }

    pub fn clear(db: &Db) -> Result<()> {
        db.delete_draft(DRAFT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::JobStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStudio {
        generation_error: Option<u16>,
        lyrics: Vec<String>,
        calls: Mutex<Vec<String>>,
        created: Mutex<Vec<ProjectCreate>>,
    }

    #[async_trait]
    impl SongStudio for FakeStudio {
        async fn generate_lyrics(&self, req: &LyricsRequest) -> ClientResult<LyricsResponse> {
            self.calls.lock().unwrap().push(format!("lyrics:{}", req.language));
            Ok(LyricsResponse {
                lyrics: None,
                candidates: Some(self.lyrics.clone()),
            })
        }

        async fn create_project(&self, req: &ProjectCreate) -> ClientResult<Project> {
            self.calls.lock().unwrap().push("create".into());
            self.created.lock().unwrap().push(req.clone());
            Ok(serde_json::from_value(serde_json::json!({"id": "proj-1", "title": req.title}))
                .unwrap())
        }

        async fn start_generation(&self, project_id: &str) -> ClientResult<GenerationJob> {
            self.calls.lock().unwrap().push(format!("generate:{project_id}"));
            if let Some(status) = self.generation_error {
                return Err(ClientError::from_status(status, r#"{"detail":"nope"}"#));
            }
            Ok(GenerationJob {
                id: "job-1".into(),
                status: JobStatus::Queued,
                video_status: None,
                project_id: Some(project_id.into()),
                error: None,
                credits_cost: Some(10),
                created_at: None,
                completed_at: None,
            })
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        fail: bool,
        uploads: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl ObjectStorage for FakeStorage {
        async fn upload(
            &self,
            bucket: &str,
            path: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> ClientResult<String> {
            if self.fail {
                return Err(ClientError::from_status(413, "Payload too large"));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.into(), path.into(), bytes.len()));
            Ok(format!("https://cdn.example/{bucket}/{path}"))
        }
    }

    fn ready_draft() -> WizardDraft {
        let mut d = WizardDraft::new();
        d.mode = SongMode::Text;
        d.select_style("afrobeat", Some("Afrobeat".into()));
        d.title = "Lagos Nights".into();
        d.lyrics = "verse one".into();
        d
    }

    #[test]
    fn steps_are_gated_locally() {
        let mut d = WizardDraft::new();
        assert_eq!(d.step(), 1);
        assert!(matches!(d.next_step(), Err(ClientError::Validation(_))));

        d.select_style("afrobeat", None);
        assert_eq!(d.next_step().unwrap(), 2);

        d.title = "Song".into();
        assert!(d.next_step().is_err(), "idea mode needs generated lyrics");
        d.lyrics = "la la".into();
        assert_eq!(d.next_step().unwrap(), 3);
        assert_eq!(d.next_step().unwrap(), 3);
        assert_eq!(d.previous_step(), 2);
    }

    #[test]
    fn voice_is_folded_into_style() {
        let mut d = ready_draft();
        assert_eq!(d.style_payload(), "afrobeat");
        d.voice = Voice::Female;
        assert_eq!(d.style_payload(), "afrobeat:female");

        let payload = d.project_payload(None);
        assert_eq!(payload.mode, "TEXT");
        assert_eq!(payload.language, "fr");
        assert!(payload.context_input.is_none());
    }

    #[tokio::test]
    async fn submit_runs_upload_create_generate_in_order() {
        let studio = FakeStudio::default();
        let storage = FakeStorage::default();
        let mut d = ready_draft();
        d.recording = Some(vec![0u8; 16]);

        let outcome = d.submit(&studio, &storage, "user-1").await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Started {
                project_id: "proj-1".into(),
                job_id: "job-1".into()
            }
        );

        let uploads = storage.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, INPUT_AUDIO_BUCKET);
        assert!(uploads[0].1.starts_with("input-"));
        assert!(uploads[0].1.ends_with("-user-1.webm"));

        let created = studio.created.lock().unwrap();
        let url = created[0].audio_url.as_deref().unwrap();
        assert!(url.ends_with(&uploads[0].1));
        assert_eq!(
            *studio.calls.lock().unwrap(),
            vec!["create".to_string(), "generate:proj-1".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_upload_creates_nothing() {
        let studio = FakeStudio::default();
        let storage = FakeStorage {
            fail: true,
            ..Default::default()
        };
        let mut d = ready_draft();
        d.recording = Some(vec![1, 2, 3]);

        let err = d.submit(&studio, &storage, "user-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Provider(_)));
        assert!(studio.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn insufficient_balance_redirects_to_top_up() {
        let studio = FakeStudio {
            generation_error: Some(402),
            ..Default::default()
        };
        let outcome = ready_draft()
            .submit(&studio, &FakeStorage::default(), "user-1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::TopUpRequired {
                project_id: "proj-1".into()
            }
        );
    }

    #[tokio::test]
    async fn other_generation_failures_surface_the_orphan() {
        let studio = FakeStudio {
            generation_error: Some(500),
            ..Default::default()
        };
        let err = ready_draft()
            .submit(&studio, &FakeStorage::default(), "user-1")
            .await
            .unwrap_err();
        match err {
            ClientError::OrphanedProject { project_id, source } => {
                assert_eq!(project_id, "proj-1");
                assert_eq!(source.status(), Some(500));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_draft_never_reaches_the_backend() {
        let studio = FakeStudio::default();
        let mut d = ready_draft();
        d.title = "  ".into();
        assert!(matches!(
            d.submit(&studio, &FakeStorage::default(), "u").await,
            Err(ClientError::Validation(_))
        ));
        assert!(studio.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generated_lyrics_select_the_first_candidate() {
        let studio = FakeStudio {
            lyrics: vec!["first take".into(), "second take".into()],
            ..Default::default()
        };
        let mut d = WizardDraft::new();
        assert!(d.generate_lyrics(&studio).await.is_err());

        d.description = "a song about the harmattan".into();
        d.language = Language::En;
        assert_eq!(d.generate_lyrics(&studio).await.unwrap().len(), 2);
        assert_eq!(d.lyrics, "first take");

        d.select_candidate(1).unwrap();
        assert_eq!(d.lyrics, "second take");
        assert!(d.select_candidate(5).is_err());
        assert_eq!(studio.calls.lock().unwrap()[0], "lyrics:en");
    }

    #[test]
    fn draft_persists_without_the_recording() {
        let db = Db::open_in_memory().unwrap();
        assert!(WizardDraft::load(&db).unwrap().is_none());

        let mut d = ready_draft();
        d.recording = Some(vec![9; 32]);
        d.next_step().unwrap();
        d.save(&db).unwrap();

        let loaded = WizardDraft::load(&db).unwrap().unwrap();
        assert_eq!(loaded.step(), 2);
        assert_eq!(loaded.title, "Lagos Nights");
        assert!(loaded.recording.is_none());

        WizardDraft::clear(&db).unwrap();
        assert!(WizardDraft::load(&db).unwrap().is_none());
    }
}
