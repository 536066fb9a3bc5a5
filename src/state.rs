use crate::config::{GeminiSettings, Settings};
use crate::course::CourseEngine;
use crate::generation::{ContentSchemas, GenerationRequest};
use crate::models::{Attachment, ContentPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub creator_id: String,
    pub content: ContentPayload,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub has_certificate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubmission {
    pub content_id: Uuid,
    pub student_name: String,
    pub score: usize,
    pub total_questions: usize,
    pub module_attempts: Option<BTreeMap<usize, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub content_id: Uuid,
    pub student_name: String,
    pub score: usize,
    pub total_questions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_attempts: Option<BTreeMap<usize, u32>>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityRecord {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub creator_id: String,
    pub visibility: Visibility,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl CommunityRecord {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn visible_to(&self, user_id: &str) -> bool {
        self.visibility == Visibility::Public || self.is_member(user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: Uuid,
    pub community_id: Uuid,
    pub content_id: Uuid,
    pub author_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_author: Option<String>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One learner working through one course. Never persisted.
#[derive(Debug)]
pub struct CourseSession {
    pub id: Uuid,
    pub content_id: Uuid,
    pub student_name: String,
    pub engine: CourseEngine,
    pub started_at: DateTime<Utc>,
}

pub struct InMemoryDb {
    pub content: RwLock<HashMap<Uuid, ContentRecord>>,
    pub submissions: RwLock<Vec<SubmissionRecord>>,
    pub communities: RwLock<HashMap<Uuid, CommunityRecord>>,
    pub posts: RwLock<HashMap<Uuid, PostRecord>>,
    pub comments: RwLock<Vec<CommentRecord>>,
    pub course_sessions: DashMap<Uuid, CourseSession>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistentSnapshot {
    #[serde(default)]
    content: HashMap<Uuid, ContentRecord>,
    #[serde(default)]
    submissions: Vec<SubmissionRecord>,
    #[serde(default)]
    communities: HashMap<Uuid, CommunityRecord>,
    #[serde(default)]
    posts: HashMap<Uuid, PostRecord>,
    #[serde(default)]
    comments: Vec<CommentRecord>,
}

impl InMemoryDb {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        let snapshot = snapshot_path
            .as_deref()
            .and_then(|path| {
                let raw = fs::read_to_string(path).ok()?;
                match serde_json::from_str::<PersistentSnapshot>(&raw) {
                    Ok(s) => Some(s),
                    Err(err) => {
                        warn!("failed to read local snapshot {}: {}", path.display(), err);
                        None
                    }
                }
            })
            .unwrap_or_default();

        Self {
            content: RwLock::new(snapshot.content),
            submissions: RwLock::new(snapshot.submissions),
            communities: RwLock::new(snapshot.communities),
            posts: RwLock::new(snapshot.posts),
            comments: RwLock::new(snapshot.comments),
            course_sessions: DashMap::new(),
            snapshot_path,
        }
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            content: self.content.read().await.clone(),
            submissions: self.submissions.read().await.clone(),
            communities: self.communities.read().await.clone(),
            posts: self.posts.read().await.clone(),
            comments: self.comments.read().await.clone(),
        }
    }

    pub async fn persist_core_data(&self) -> anyhow::Result<()> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        let snapshot = self.snapshot().await;
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }

    /// Drops every live session of a content item; returns how many went.
    pub fn drop_sessions_for(&self, content_id: Uuid) -> usize {
        let before = self.course_sessions.len();
        self.course_sessions.retain(|_, s| s.content_id != content_id);
        before.saturating_sub(self.course_sessions.len())
    }

    /// Drops sessions started more than `ttl` before `now`.
    pub fn sweep_expired_sessions(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let before = self.course_sessions.len();
        self.course_sessions.retain(|_, s| now - s.started_at <= ttl);
        before.saturating_sub(self.course_sessions.len())
    }

    /// Persistence failures are logged, the in-memory change stands.
    pub async fn persist_or_warn(&self, after: &str) {
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after {}: {}", after, err);
        }
    }
}

pub trait AiContentClient: Send + Sync {
    /// Raw model reply for the request; parsing happens in `generation`.
    fn generate(&self, request: &GenerationRequest) -> BoxFuture<'static, anyhow::Result<String>>;
}

/// Deterministic offline generator: every question is keyed to option `a`.
#[derive(Clone)]
pub struct MockAiClient;

fn mock_questions(topic: &str, module: Option<usize>, count: usize) -> Vec<serde_json::Value> {
    (1..=count)
        .map(|n| {
            let label = match module {
                Some(m) => format!("{topic}: module {m}, question {n}"),
                None => format!("{topic}: question {n}"),
            };
            json!({
                "pregunta": label,
                "opciones": {"a": "Correct", "b": "Wrong", "c": "Also wrong", "d": "Not this one"},
                "respuesta_correcta": "a",
                "justificacion": "Generated offline."
            })
        })
        .collect()
}

impl AiContentClient for MockAiClient {
    fn generate(&self, request: &GenerationRequest) -> BoxFuture<'static, anyhow::Result<String>> {
        let payload = match request {
            GenerationRequest::Quiz(p) => json!(mock_questions(&p.title, None, p.num_questions)),
            GenerationRequest::Course(p) => {
                let modules: Vec<_> = (1..=p.num_modules)
                    .map(|m| {
                        let mut module = json!({
                            "titulo": format!("{}: module {}", p.title, m),
                            "cuestionario": mock_questions(&p.title, Some(m), p.questions_per_module),
                        });
                        if p.include_module_summary {
                            module["resumen"] = json!("Offline summary.");
                        }
                        if p.additional_instructions.as_deref().is_some_and(|s| !s.trim().is_empty()) {
                            module["contexto_adicional"] = json!("Offline creator note.");
                        }
                        module
                    })
                    .collect();
                json!({"titulo": p.title, "modulos": modules})
            }
        };
        Box::pin(async move { Ok(payload.to_string()) })
    }
}

#[derive(Clone)]
pub struct GeminiAiClient {
    http: reqwest::Client,
    settings: GeminiSettings,
}

impl GeminiAiClient {
    pub fn new(settings: GeminiSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { http, settings })
    }
}

impl AiContentClient for GeminiAiClient {
    fn generate(&self, request: &GenerationRequest) -> BoxFuture<'static, anyhow::Result<String>> {
        let http = self.http.clone();
        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url, self.settings.model
        );
        let api_key = self.settings.api_key.clone();
        let body = json!({
            "contents": [{"parts": [{"text": request.prompt()}]}],
            "generationConfig": {"responseMimeType": "application/json"}
        });

        Box::pin(async move {
            let response = http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("gemini returned {}: {}", status, text.trim());
            }
            let value: serde_json::Value = response.json().await?;
            let text = value
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            if text.is_empty() {
                anyhow::bail!("gemini returned empty content");
            }
            Ok(text)
        })
    }
}

/// Destination of finished quiz and course results.
#[async_trait]
pub trait SubmissionRecorder: Send + Sync {
    async fn record(&self, submission: NewSubmission) -> anyhow::Result<SubmissionRecord>;
}

pub struct StoreRecorder {
    db: Arc<InMemoryDb>,
}

impl StoreRecorder {
    pub fn new(db: Arc<InMemoryDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubmissionRecorder for StoreRecorder {
    async fn record(&self, submission: NewSubmission) -> anyhow::Result<SubmissionRecord> {
        let record = SubmissionRecord {
            id: Uuid::new_v4(),
            content_id: submission.content_id,
            student_name: submission.student_name,
            score: submission.score,
            total_questions: submission.total_questions,
            module_attempts: submission.module_attempts,
            submitted_at: Utc::now(),
        };
        self.db.submissions.write().await.push(record.clone());
        self.db.persist_or_warn("record_submission").await;
        Ok(record)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<InMemoryDb>,
    pub ai_client: Arc<dyn AiContentClient>,
    pub recorder: Arc<dyn SubmissionRecorder>,
    pub schemas: Arc<ContentSchemas>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings, ai_client: Arc<dyn AiContentClient>, schemas: ContentSchemas) -> Self {
        let db = Arc::new(InMemoryDb::new(settings.local_state_path.clone()));
        Self {
            recorder: Arc::new(StoreRecorder::new(db.clone())),
            db,
            ai_client,
            schemas: Arc::new(schemas),
            settings: Arc::new(settings),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn SubmissionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub async fn create_content(
        &self,
        creator_id: &str,
        title: Option<String>,
        content: ContentPayload,
        attachments: Vec<Attachment>,
        has_certificate: bool,
    ) -> ContentRecord {
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| content.default_title());
        let record = ContentRecord {
            id: Uuid::new_v4(),
            title,
            created_at: Utc::now(),
            creator_id: creator_id.to_string(),
            content,
            attachments,
            has_certificate,
        };
        self.db.content.write().await.insert(record.id, record.clone());
        self.db.persist_or_warn("create_content").await;
        info!(content_id = %record.id, kind = ?record.content.kind(), "content created");
        record
    }

    /// Hands a result to the recorder without waiting for it.
    pub fn record_in_background(&self, submission: NewSubmission) {
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            let content_id = submission.content_id;
            match recorder.record(submission).await {
                Ok(record) => info!(%content_id, submission_id = %record.id, "submission recorded"),
                Err(err) => warn!(%content_id, "failed to record submission: {}", err),
            }
        });
    }
}
