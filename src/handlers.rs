use crate::course::{module_breakdown, Advance, CourseEngine, CourseResult, EngineState, ModuleOutcome, ModuleStatus};
use crate::error::{AppError, AttemptError, ErrorDetail};
use crate::generation::{generate_content, CourseParams, GenerationError, GenerationRequest, QuizParams};
use crate::models::{validate_payload, Attachment, ContentKind, ContentPayload, OptionKey, ValidationIssue};
use crate::scoring::{self, question_views, QuestionView, QuizAttempt};
use crate::state::{
    AppState, CommentRecord, CommunityRecord, ContentRecord, CourseSession, NewSubmission, PostRecord, SubmissionRecord,
    Visibility,
};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use qrcode::render::svg;
use qrcode::QrCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

const USER_HEADER: &str = "x-user-id";
static RATE_LIMIT: Lazy<DashMap<String, (u32, Instant)>> = Lazy::new(DashMap::new);

fn check_rate_limit(scope: &str, key: &str, limit_per_minute: u32) -> bool {
    let now = Instant::now();
    let full_key = format!("{scope}:{key}");
    if let Some(mut entry) = RATE_LIMIT.get_mut(&full_key) {
        if now.duration_since(entry.1) > Duration::from_secs(60) {
            *entry = (1, now);
            true
        } else if entry.0 >= limit_per_minute {
            false
        } else {
            entry.0 += 1;
            true
        }
    } else {
        RATE_LIMIT.insert(full_key, (1, now));
        true
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn client_key(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
}

/// Caller identity as asserted by the upstream gateway.
fn caller_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_caller(headers: &HeaderMap, req_id: &str) -> Result<String, AppError> {
    caller_id(headers).ok_or_else(|| AppError::unauthorized(req_id))
}

fn validation_issues(errors: validator::ValidationErrors) -> Vec<ValidationIssue> {
    errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| ValidationIssue {
                field: field.to_string(),
                issue: e.code.to_string(),
            })
        })
        .collect()
}

fn require_student_name(name: &str, req_id: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "student name is required",
            req_id,
        )
        .with_details(vec![ErrorDetail {
            field: "student_name".into(),
            issue: "must not be empty".into(),
        }]));
    }
    Ok(name.to_string())
}

async fn load_content(state: &AppState, id: Uuid, req_id: &str) -> Result<ContentRecord, AppError> {
    state
        .db
        .content
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| AppError::not_found("content", req_id))
}

async fn load_owned_content(state: &AppState, id: Uuid, caller: &str, req_id: &str) -> Result<ContentRecord, AppError> {
    let record = load_content(state, id, req_id).await?;
    if record.creator_id != caller {
        return Err(AppError::forbidden(req_id));
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Content

#[derive(Debug, Deserialize)]
pub struct CreateContentPayload {
    #[serde(default)]
    pub title: Option<String>,
    pub content: ContentPayload,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub has_certificate: bool,
}

#[derive(Debug, Serialize)]
pub struct ContentSummary {
    pub id: Uuid,
    pub title: String,
    pub kind: ContentKind,
    pub created_at: DateTime<Utc>,
    pub total_questions: usize,
}

impl From<&ContentRecord> for ContentSummary {
    fn from(r: &ContentRecord) -> Self {
        Self {
            id: r.id,
            title: r.title.clone(),
            kind: r.content.kind(),
            created_at: r.created_at,
            total_questions: r.content.total_questions(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ContentListResponse {
    pub items: Vec<ContentSummary>,
    pub total: usize,
}

pub async fn create_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateContentPayload>,
) -> Result<(StatusCode, Json<ContentRecord>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    if let Err(issues) = validate_payload(&payload.content) {
        return Err(AppError::validation("content validation failed", issues, req_id));
    }
    let record = state
        .create_content(
            &caller,
            payload.title,
            payload.content,
            payload.attachments,
            payload.has_certificate,
        )
        .await;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_content(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ContentListResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    let content = state.db.content.read().await;
    let mut owned: Vec<&ContentRecord> = content.values().filter(|c| c.creator_id == caller).collect();
    owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let items: Vec<ContentSummary> = owned.into_iter().map(ContentSummary::from).collect();
    Ok(Json(ContentListResponse { total: items.len(), items }))
}

#[derive(Debug, Serialize)]
pub struct AttachmentView {
    #[serde(flatten)]
    pub attachment: Attachment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LearnerModule {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_note: Option<String>,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum LearnerPayload {
    Quiz(Vec<QuestionView>),
    Course { title: String, modules: Vec<LearnerModule> },
}

/// Shared-link view of a content item; answer keys stay on the server.
#[derive(Debug, Serialize)]
pub struct LearnerContent {
    pub id: Uuid,
    pub title: String,
    pub creator_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_author: Option<String>,
    pub content: LearnerPayload,
    pub attachments: Vec<AttachmentView>,
}

fn learner_payload(payload: &ContentPayload) -> LearnerPayload {
    let fresh = scoring::Answers::new();
    match payload {
        ContentPayload::Quiz(quiz) => LearnerPayload::Quiz(question_views(quiz, &fresh, false)),
        ContentPayload::Course(course) => LearnerPayload::Course {
            title: course.title.clone(),
            modules: course
                .modules
                .iter()
                .map(|m| LearnerModule {
                    title: m.title.clone(),
                    summary: m.summary.clone(),
                    creator_note: m.creator_note.clone(),
                    questions: question_views(&m.quiz, &fresh, false),
                })
                .collect(),
        },
    }
}

fn attachment_views(attachments: &[Attachment]) -> Vec<AttachmentView> {
    attachments
        .iter()
        .map(|a| AttachmentView {
            attachment: a.clone(),
            embed_url: a.embed_url(),
        })
        .collect()
}

pub async fn get_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let record = load_content(&state, id, &req_id).await?;
    if caller_id(&headers).as_deref() == Some(record.creator_id.as_str()) {
        return Ok(Json(json!(record)));
    }

    let custom_author = {
        let posts = state.db.posts.read().await;
        posts
            .values()
            .filter(|p| p.content_id == id)
            .min_by_key(|p| p.published_at)
            .and_then(|p| p.custom_author.clone())
    };
    Ok(Json(json!(LearnerContent {
        id: record.id,
        title: record.title,
        creator_id: record.creator_id,
        custom_author,
        content: learner_payload(&record.content),
        attachments: attachment_views(&record.attachments),
    })))
}

pub async fn delete_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    load_owned_content(&state, id, &caller, &req_id).await?;

    state.db.content.write().await.remove(&id);
    let removed_posts: BTreeSet<Uuid> = {
        let mut posts = state.db.posts.write().await;
        let ids: BTreeSet<Uuid> = posts.values().filter(|p| p.content_id == id).map(|p| p.id).collect();
        posts.retain(|_, p| p.content_id != id);
        ids
    };
    state
        .db
        .comments
        .write()
        .await
        .retain(|c| !removed_posts.contains(&c.post_id));
    let dropped = state.db.drop_sessions_for(id);
    state.db.persist_or_warn("delete_content").await;
    info!(content_id = %id, dropped_sessions = dropped, "content deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ShareLink {
    pub content_id: Uuid,
    pub link: String,
    pub qr_svg: String,
}

pub async fn share_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ShareLink>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    load_owned_content(&state, id, &caller, &req_id).await?;

    let link = state.settings.share_link(&id.to_string());
    let code = QrCode::new(link.as_bytes()).map_err(|e| {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", format!("qr encoding failed: {e}"), req_id.clone())
    })?;
    let svg_markup = code.render::<svg::Color>().min_dimensions(200, 200).build();
    Ok(Json(ShareLink {
        content_id: id,
        link,
        qr_svg: format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg_markup)),
    }))
}

// ---------------------------------------------------------------------------
// AI generation

async fn generate_and_store(
    state: AppState,
    headers: HeaderMap,
    request: GenerationRequest,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("ai_generate", client_key(&headers), state.settings.ai_rate_limit_per_minute) {
        return Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many requests",
            req_id,
        ));
    }
    let caller = require_caller(&headers, &req_id)?;
    if let Err(issues) = request.validate_params() {
        return Err(AppError::validation("invalid generation parameters", issues, req_id));
    }

    let payload = match generate_content(state.ai_client.as_ref(), &request, &state.schemas).await {
        Ok(payload) => payload,
        Err(GenerationError::Upstream(err)) => {
            return Err(AppError::new(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                format!("ai service failed: {}", err),
                req_id,
            ));
        }
        Err(err) => {
            let message = err.to_string();
            return Err(AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message, req_id)
                .with_details(err.into_details().into_iter().map(ErrorDetail::from).collect()));
        }
    };

    let record = state
        .create_content(&caller, Some(request.title().to_string()), payload, Vec::new(), false)
        .await;
    Ok((StatusCode::CREATED, Json(json!({ "content": record, "source": "ai" }))))
}

pub async fn ai_generate_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<QuizParams>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    generate_and_store(state, headers, GenerationRequest::Quiz(params)).await
}

pub async fn ai_generate_course(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<CourseParams>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    generate_and_store(state, headers, GenerationRequest::Course(params)).await
}

// ---------------------------------------------------------------------------
// Standalone quizzes

#[derive(Debug, Deserialize)]
pub struct QuizAttemptPayload {
    pub student_name: String,
    #[serde(default)]
    pub answers: BTreeMap<usize, OptionKey>,
}

#[derive(Debug, Serialize)]
pub struct QuizAttemptResponse {
    pub score: usize,
    pub total_questions: usize,
    pub questions: Vec<QuestionView>,
}

pub async fn submit_quiz_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<QuizAttemptPayload>,
) -> Result<Json<QuizAttemptResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let student_name = require_student_name(&payload.student_name, &req_id)?;
    let record = load_content(&state, id, &req_id).await?;
    let ContentPayload::Quiz(quiz) = &record.content else {
        return Err(AppError::new(StatusCode::CONFLICT, "CONFLICT", "content is not a quiz", req_id));
    };

    let mut attempt = QuizAttempt::new(quiz.len());
    for (index, key) in payload.answers {
        attempt.select(index, key);
    }
    let score = attempt.submit(quiz).map_err(|e| AppError::attempt(e, req_id.clone()))?;

    state.record_in_background(NewSubmission {
        content_id: id,
        student_name,
        score,
        total_questions: quiz.len(),
        module_attempts: None,
    });
    Ok(Json(QuizAttemptResponse {
        score,
        total_questions: quiz.len(),
        questions: attempt.views(quiz),
    }))
}

// ---------------------------------------------------------------------------
// Interactive course sessions

#[derive(Debug, Deserialize)]
pub struct StartCoursePayload {
    pub student_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitModulePayload {
    #[serde(default)]
    pub answers: BTreeMap<usize, OptionKey>,
}

#[derive(Debug, Serialize)]
pub struct ModuleView {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_note: Option<String>,
    pub questions: Vec<QuestionView>,
    /// Selection is closed once the module resolved.
    pub locked: bool,
}

#[derive(Debug, Serialize)]
pub struct CourseSessionView {
    pub session_id: Uuid,
    pub content_id: Uuid,
    pub student_name: String,
    pub state: EngineState,
    pub status: ModuleStatus,
    pub module_index: usize,
    pub module_count: usize,
    pub progress_percent: f64,
    pub attempt_key: String,
    pub module_attempts: BTreeMap<usize, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CourseResult>,
}

fn session_view(session: &CourseSession) -> CourseSessionView {
    let engine = &session.engine;
    let module = engine.current_module().map(|m| ModuleView {
        title: m.title.clone(),
        summary: m.summary.clone(),
        creator_note: m.creator_note.clone(),
        questions: engine.attempt().views(&m.quiz),
        locked: engine.status() != ModuleStatus::Pending,
    });
    CourseSessionView {
        session_id: session.id,
        content_id: session.content_id,
        student_name: session.student_name.clone(),
        state: engine.state(),
        status: engine.status(),
        module_index: engine.current_index(),
        module_count: engine.module_count(),
        progress_percent: engine.progress_percent(),
        attempt_key: engine.attempt_key().to_string(),
        module_attempts: engine.module_attempts().clone(),
        module,
        result: engine.result(),
    }
}

pub async fn start_course_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartCoursePayload>,
) -> Result<(StatusCode, Json<CourseSessionView>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let student_name = require_student_name(&payload.student_name, &req_id)?;
    let record = load_content(&state, id, &req_id).await?;
    let ContentPayload::Course(course) = record.content else {
        return Err(AppError::new(StatusCode::CONFLICT, "CONFLICT", "content is not a course", req_id));
    };

    const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
    let ttl = chrono::Duration::seconds(state.settings.course_session_ttl_secs.min(MAX_TTL_SECS) as i64);
    let expired = state.db.sweep_expired_sessions(Utc::now(), ttl);
    if expired > 0 {
        info!(expired, "expired course sessions dropped");
    }

    let session = CourseSession {
        id: Uuid::new_v4(),
        content_id: id,
        student_name,
        engine: CourseEngine::new(course),
        started_at: Utc::now(),
    };
    let view = session_view(&session);
    info!(session_id = %session.id, content_id = %id, "course session started");
    state.db.course_sessions.insert(session.id, session);
    Ok((StatusCode::CREATED, Json(view)))
}

fn session_not_found(req_id: &str) -> AppError {
    AppError::not_found("course session", req_id)
}

pub async fn get_course_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseSessionView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = state.db.course_sessions.get(&id).ok_or_else(|| session_not_found(&req_id))?;
    Ok(Json(session_view(&session)))
}

#[derive(Debug, Serialize)]
pub struct SubmitModuleResponse {
    pub outcome: ModuleOutcome,
    pub session: CourseSessionView,
}

pub async fn submit_course_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubmitModulePayload>,
) -> Result<Json<SubmitModuleResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let mut session = state.db.course_sessions.get_mut(&id).ok_or_else(|| session_not_found(&req_id))?;
    let engine = &mut session.engine;

    // Grading needs a complete answer set; a resolved module is left to the
    // engine so the caller sees the transition error instead.
    if let (Some(module), ModuleStatus::Pending) = (engine.current_module(), engine.status()) {
        if !scoring::is_complete(&module.quiz, &payload.answers) {
            let answered = (0..module.quiz.len()).filter(|i| payload.answers.contains_key(i)).count();
            return Err(AppError::attempt(
                AttemptError::Incomplete {
                    answered,
                    total: module.quiz.len(),
                },
                req_id,
            ));
        }
    }

    let outcome = engine.submit(payload.answers).map_err(|e| AppError::transition(e, req_id))?;
    info!(
        session_id = %id,
        module = outcome.module_index,
        raw_score = outcome.raw_score,
        passing = outcome.passing_score,
        status = ?outcome.status,
        "module graded"
    );
    Ok(Json(SubmitModuleResponse {
        outcome,
        session: session_view(&session),
    }))
}

pub async fn retry_course_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseSessionView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let mut session = state.db.course_sessions.get_mut(&id).ok_or_else(|| session_not_found(&req_id))?;
    session.engine.retry().map_err(|e| AppError::transition(e, req_id))?;
    Ok(Json(session_view(&session)))
}

pub async fn advance_course(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseSessionView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let (view, completion) = {
        let mut session = state.db.course_sessions.get_mut(&id).ok_or_else(|| session_not_found(&req_id))?;
        let advance = session.engine.advance().map_err(|e| AppError::transition(e, req_id))?;
        let completion = match advance {
            Advance::Completed(result) => Some(NewSubmission {
                content_id: session.content_id,
                student_name: session.student_name.clone(),
                score: result.score,
                total_questions: result.total_questions,
                module_attempts: Some(result.module_attempts),
            }),
            Advance::NextModule(_) => None,
        };
        (session_view(&session), completion)
    };

    if let Some(submission) = completion {
        info!(session_id = %id, score = submission.score, total = submission.total_questions, "course completed");
        state.record_in_background(submission);
    }
    Ok(Json(view))
}

pub async fn restart_course(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseSessionView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let mut session = state.db.course_sessions.get_mut(&id).ok_or_else(|| session_not_found(&req_id))?;
    session.engine.restart();
    session.started_at = Utc::now();
    Ok(Json(session_view(&session)))
}

/// Learner left the course; its attempt state goes with it.
pub async fn end_course_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    state
        .db
        .course_sessions
        .remove(&id)
        .ok_or_else(|| session_not_found(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Submissions

#[derive(Debug, Serialize)]
pub struct ModuleLine {
    pub index: usize,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_in: Option<u32>,
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct SubmissionOut {
    #[serde(flatten)]
    pub submission: SubmissionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<ModuleLine>>,
}

pub async fn list_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    let record = load_owned_content(&state, id, &caller, &req_id).await?;

    let mut submissions: Vec<SubmissionRecord> = state
        .db
        .submissions
        .read()
        .await
        .iter()
        .filter(|s| s.content_id == id)
        .cloned()
        .collect();
    submissions.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));

    let items: Vec<SubmissionOut> = submissions
        .into_iter()
        .map(|submission| {
            let modules = match (&record.content, &submission.module_attempts) {
                (ContentPayload::Course(course), Some(attempts)) => Some(
                    module_breakdown(course, attempts)
                        .into_iter()
                        .map(|r| ModuleLine {
                            label: r.to_string(),
                            index: r.index,
                            title: r.title,
                            passed_in: r.passed_in,
                        })
                        .collect(),
                ),
                _ => None,
            };
            SubmissionOut { submission, modules }
        })
        .collect();
    let total = items.len();
    Ok(Json(json!({ "items": items, "total": total })))
}

// ---------------------------------------------------------------------------
// Communities, posts and comments

#[derive(Debug, Deserialize, Validate)]
pub struct CommunityPayload {
    #[validate(length(min = 3, max = 80))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub description: String,
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
pub struct CommunityOut {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub creator_id: String,
    pub visibility: Visibility,
    pub member_count: usize,
    pub is_member: bool,
}

fn community_out(c: &CommunityRecord, caller: &str) -> CommunityOut {
    CommunityOut {
        id: c.id,
        name: c.name.clone(),
        description: c.description.clone(),
        creator_id: c.creator_id.clone(),
        visibility: c.visibility,
        member_count: c.members.len(),
        is_member: c.is_member(caller),
    }
}

pub async fn create_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CommunityPayload>,
) -> Result<(StatusCode, Json<CommunityOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    if let Err(errors) = payload.validate() {
        return Err(AppError::validation("community validation failed", validation_issues(errors), req_id));
    }
    let community = CommunityRecord {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        description: payload.description.trim().to_string(),
        creator_id: caller.clone(),
        visibility: payload.visibility,
        members: BTreeSet::from([caller.clone()]),
        created_at: Utc::now(),
    };
    let out = community_out(&community, &caller);
    state.db.communities.write().await.insert(community.id, community);
    state.db.persist_or_warn("create_community").await;
    Ok((StatusCode::CREATED, Json(out)))
}

pub async fn list_communities(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    let communities = state.db.communities.read().await;
    let mut visible: Vec<&CommunityRecord> = communities.values().filter(|c| c.visible_to(&caller)).collect();
    visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let items: Vec<CommunityOut> = visible.into_iter().map(|c| community_out(c, &caller)).collect();
    let total = items.len();
    Ok(Json(json!({ "items": items, "total": total })))
}

pub async fn update_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<CommunityPayload>,
) -> Result<Json<CommunityOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    if let Err(errors) = payload.validate() {
        return Err(AppError::validation("community validation failed", validation_issues(errors), req_id));
    }
    let out = {
        let mut communities = state.db.communities.write().await;
        let community = communities.get_mut(&id).ok_or_else(|| AppError::not_found("community", &req_id))?;
        if community.creator_id != caller {
            return Err(AppError::forbidden(req_id));
        }
        community.name = payload.name.trim().to_string();
        community.description = payload.description.trim().to_string();
        community.visibility = payload.visibility;
        community_out(community, &caller)
    };
    state.db.persist_or_warn("update_community").await;
    Ok(Json(out))
}

pub async fn join_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CommunityOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    let out = {
        let mut communities = state.db.communities.write().await;
        let community = communities.get_mut(&id).ok_or_else(|| AppError::not_found("community", &req_id))?;
        if !community.visible_to(&caller) {
            return Err(AppError::forbidden(req_id));
        }
        if !community.members.insert(caller.clone()) {
            return Err(AppError::new(StatusCode::CONFLICT, "CONFLICT", "already a member", req_id));
        }
        community_out(community, &caller)
    };
    state.db.persist_or_warn("join_community").await;
    Ok(Json(out))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PublishPostPayload {
    pub content_id: Uuid,
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub message: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 120))]
    pub custom_author: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostOut {
    pub id: Uuid,
    pub community_id: Uuid,
    pub author_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub content: ContentSummary,
    pub comments: Vec<CommentRecord>,
}

pub async fn publish_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(community_id): Path<Uuid>,
    Json(payload): Json<PublishPostPayload>,
) -> Result<(StatusCode, Json<PostOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    if let Err(errors) = payload.validate() {
        return Err(AppError::validation("post validation failed", validation_issues(errors), req_id));
    }
    {
        let communities = state.db.communities.read().await;
        let community = communities
            .get(&community_id)
            .ok_or_else(|| AppError::not_found("community", &req_id))?;
        if !community.is_member(&caller) {
            return Err(AppError::forbidden(req_id));
        }
    }
    let content = load_owned_content(&state, payload.content_id, &caller, &req_id).await?;

    let post = PostRecord {
        id: Uuid::new_v4(),
        community_id,
        content_id: content.id,
        author_id: caller,
        message: payload.message.trim().to_string(),
        custom_author: payload.custom_author.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
        published_at: Utc::now(),
    };
    state.db.posts.write().await.insert(post.id, post.clone());
    state.db.persist_or_warn("publish_post").await;
    info!(post_id = %post.id, %community_id, "content published to community");
    Ok((
        StatusCode::CREATED,
        Json(PostOut {
            id: post.id,
            community_id,
            author_id: post.author_id,
            message: post.message,
            custom_author: post.custom_author,
            published_at: post.published_at,
            content: ContentSummary::from(&content),
            comments: Vec::new(),
        }),
    ))
}

pub async fn list_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(community_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    {
        let communities = state.db.communities.read().await;
        let community = communities
            .get(&community_id)
            .ok_or_else(|| AppError::not_found("community", &req_id))?;
        if !community.visible_to(&caller) {
            return Err(AppError::forbidden(req_id));
        }
    }

    let posts = state.db.posts.read().await;
    let content = state.db.content.read().await;
    let comments = state.db.comments.read().await;
    let mut feed: Vec<&PostRecord> = posts.values().filter(|p| p.community_id == community_id).collect();
    feed.sort_by(|a, b| b.published_at.cmp(&a.published_at));

    let items: Vec<PostOut> = feed
        .into_iter()
        .filter_map(|p| {
            let item = content.get(&p.content_id)?;
            let mut thread: Vec<CommentRecord> = comments.iter().filter(|c| c.post_id == p.id).cloned().collect();
            thread.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Some(PostOut {
                id: p.id,
                community_id: p.community_id,
                author_id: p.author_id.clone(),
                message: p.message.clone(),
                custom_author: p.custom_author.clone(),
                published_at: p.published_at,
                content: ContentSummary::from(item),
                comments: thread,
            })
        })
        .collect();
    let total = items.len();
    Ok(Json(json!({ "items": items, "total": total })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CommentPayload {
    #[validate(length(min = 1, max = 2000))]
    pub text: String,
}

pub async fn add_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<Uuid>,
    Json(payload): Json<CommentPayload>,
) -> Result<(StatusCode, Json<CommentRecord>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let caller = require_caller(&headers, &req_id)?;
    let text = payload.text.trim().to_string();
    let trimmed = CommentPayload { text: text.clone() };
    if let Err(errors) = trimmed.validate() {
        return Err(AppError::validation("comment validation failed", validation_issues(errors), req_id));
    }

    let community_id = state
        .db
        .posts
        .read()
        .await
        .get(&post_id)
        .map(|p| p.community_id)
        .ok_or_else(|| AppError::not_found("post", &req_id))?;
    let visible = state
        .db
        .communities
        .read()
        .await
        .get(&community_id)
        .is_some_and(|c| c.visible_to(&caller));
    if !visible {
        return Err(AppError::forbidden(req_id));
    }

    let comment = CommentRecord {
        id: Uuid::new_v4(),
        post_id,
        author_id: caller,
        text,
        created_at: Utc::now(),
    };
    state.db.comments.write().await.push(comment.clone());
    state.db.persist_or_warn("add_comment").await;
    Ok((StatusCode::CREATED, Json(comment)))
}
