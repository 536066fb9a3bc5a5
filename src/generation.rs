//! Turning study material into quizzes and courses through an AI client:
//! prompt construction, cleaning of the raw reply and validation of the
//! generated JSON before anything is stored.

use crate::models::{validate_payload, ContentKind, ContentPayload, Course, Quiz, ValidationIssue};
use crate::state::AiContentClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use validator::Validate;

/// Generation attempts before the last failure is reported.
pub const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Intermediate,
    Advanced,
}

impl Difficulty {
    fn describe(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy, suitable for beginners",
            Difficulty::Intermediate => "intermediate, suitable for students",
            Difficulty::Advanced => "advanced, suitable for experts",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QuizParams {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    pub selected_pages: String,
    #[validate(length(min = 20, max = 200000))]
    pub extracted_text: String,
    pub difficulty: Difficulty,
    #[validate(range(min = 1, max = 50))]
    pub num_questions: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CourseParams {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    pub selected_pages: String,
    #[validate(length(min = 20, max = 200000))]
    pub extracted_text: String,
    pub difficulty: Difficulty,
    #[validate(range(min = 1, max = 20))]
    pub num_modules: usize,
    #[validate(range(min = 1, max = 20))]
    pub questions_per_module: usize,
    #[serde(default)]
    pub include_module_summary: bool,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub additional_instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GenerationRequest {
    Quiz(QuizParams),
    Course(CourseParams),
}

const QUESTION_SHAPE: &str = r#"{"pregunta": "...", "opciones": {"a": "...", "b": "...", "c": "...", "d": "..."}, "respuesta_correcta": "a", "justificacion": "..."}"#;

impl GenerationRequest {
    pub fn kind(&self) -> ContentKind {
        match self {
            GenerationRequest::Quiz(_) => ContentKind::Quiz,
            GenerationRequest::Course(_) => ContentKind::Course,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            GenerationRequest::Quiz(p) => &p.title,
            GenerationRequest::Course(p) => &p.title,
        }
    }

    pub fn validate_params(&self) -> Result<(), Vec<ValidationIssue>> {
        let result = match self {
            GenerationRequest::Quiz(p) => p.validate(),
            GenerationRequest::Course(p) => p.validate(),
        };
        result.map_err(|errors| {
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
        })
    }

    pub fn prompt(&self) -> String {
        match self {
            GenerationRequest::Quiz(p) => format!(
                "Write a multiple choice quiz from the material below, taken from pages {pages} of \"{title}\".\n\
                 Use only facts stated in the material. Produce exactly {n} questions, each with four options \
                 (one correct, three plausible distractors) and a short justification quoting the material.\n\
                 Difficulty: {difficulty}.\n\
                 Reply with a JSON array only, each element shaped like:\n{shape}\n\n---\n{text}\n---\n",
                pages = p.selected_pages,
                title = p.title,
                n = p.num_questions,
                difficulty = p.difficulty.describe(),
                shape = QUESTION_SHAPE,
                text = p.extracted_text,
            ),
            GenerationRequest::Course(p) => {
                let summary = if p.include_module_summary {
                    "Every module includes \"resumen\": a 2-4 sentence summary of its key points."
                } else {
                    "Do not include \"resumen\"."
                };
                let note = match p.additional_instructions.as_deref().map(str::trim) {
                    Some(extra) if !extra.is_empty() => format!(
                        "Where relevant add \"contexto_adicional\", a 1-2 sentence creator note following: \"{extra}\"."
                    ),
                    _ => "Do not include \"contexto_adicional\".".to_string(),
                };
                format!(
                    "Split the material below, taken from pages {pages} of \"{title}\", into exactly {m} sequential \
                     learning modules.\n\
                     Reply with one JSON object {{\"titulo\": \"...\", \"modulos\": [...]}}. Each module has \"titulo\" \
                     and \"cuestionario\": exactly {n} multiple choice questions shaped like:\n{shape}\n\
                     {summary}\n{note}\nDifficulty: {difficulty}. Use only facts stated in the material.\n\n---\n{text}\n---\n",
                    pages = p.selected_pages,
                    title = p.title,
                    m = p.num_modules,
                    n = p.questions_per_module,
                    shape = QUESTION_SHAPE,
                    difficulty = p.difficulty.describe(),
                    text = p.extracted_text,
                )
            }
        }
    }
}

/// Strips surrounding whitespace and a Markdown code fence.
pub fn clean_response(raw: &str) -> &str {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub struct ContentSchemas {
    quiz: jsonschema::Validator,
    course: jsonschema::Validator,
}

impl ContentSchemas {
    pub fn load() -> anyhow::Result<Self> {
        let quiz: serde_json::Value = serde_json::from_str(include_str!("../contracts/quiz.schema.json"))?;
        let course: serde_json::Value = serde_json::from_str(include_str!("../contracts/course.schema.json"))?;
        Ok(Self {
            quiz: jsonschema::draft202012::new(&quiz)
                .map_err(|e| anyhow::anyhow!("quiz schema: {e}"))?,
            course: jsonschema::draft202012::new(&course)
                .map_err(|e| anyhow::anyhow!("course schema: {e}"))?,
        })
    }

    fn for_kind(&self, kind: ContentKind) -> &jsonschema::Validator {
        match kind {
            ContentKind::Quiz => &self.quiz,
            ContentKind::Course => &self.course,
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("ai service failed: {0}")]
    Upstream(anyhow::Error),
    #[error("ai result is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ai result has an unexpected shape: {0}")]
    Shape(&'static str),
    #[error("ai payload does not match schema")]
    Schema(Vec<ValidationIssue>),
    #[error("generated content failed validation")]
    Invalid(Vec<ValidationIssue>),
}

impl GenerationError {
    pub fn into_details(self) -> Vec<ValidationIssue> {
        match self {
            GenerationError::Schema(issues) | GenerationError::Invalid(issues) => issues,
            _ => Vec::new(),
        }
    }
}

pub fn parse_generated(raw: &str, kind: ContentKind, schemas: &ContentSchemas) -> Result<ContentPayload, GenerationError> {
    let value: serde_json::Value = serde_json::from_str(clean_response(raw))?;
    match kind {
        ContentKind::Quiz if !value.is_array() => {
            return Err(GenerationError::Shape("quiz reply must be a JSON array"));
        }
        ContentKind::Course if !value.get("modulos").is_some_and(|m| m.is_array()) => {
            return Err(GenerationError::Shape("course reply must be an object with a 'modulos' array"));
        }
        _ => {}
    }

    let schema = schemas.for_kind(kind);
    if !schema.is_valid(&value) {
        return Err(GenerationError::Schema(
            schema
                .iter_errors(&value)
                .map(|e| ValidationIssue {
                    field: e.instance_path.to_string(),
                    issue: e.to_string(),
                })
                .collect(),
        ));
    }

    let payload = match kind {
        ContentKind::Quiz => ContentPayload::Quiz(serde_json::from_value::<Quiz>(value)?),
        ContentKind::Course => ContentPayload::Course(serde_json::from_value::<Course>(value)?),
    };
    validate_payload(&payload).map_err(GenerationError::Invalid)?;
    Ok(payload)
}

/// Asks the client for content, retrying once on a malformed reply.
/// Transport failures are not retried.
pub async fn generate_content(
    client: &dyn AiContentClient,
    request: &GenerationRequest,
    schemas: &ContentSchemas,
) -> Result<ContentPayload, GenerationError> {
    let mut last_error = GenerationError::Shape("no generation attempt was made");
    for attempt in 1..=MAX_ATTEMPTS {
        let raw = client.generate(request).await.map_err(GenerationError::Upstream)?;
        match parse_generated(&raw, request.kind(), schemas) {
            Ok(payload) => return Ok(payload),
            Err(err) => {
                warn!(attempt, kind = ?request.kind(), "rejected ai output: {}", err);
                last_error = err;
            }
        }
    }
    Err(last_error)
}
