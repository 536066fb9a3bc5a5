use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Fixed set of option keys a question can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKey {
    A,
    B,
    C,
    D,
}

impl OptionKey {
    pub const ALL: [OptionKey; 4] = [OptionKey::A, OptionKey::B, OptionKey::C, OptionKey::D];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::A => "a",
            OptionKey::B => "b",
            OptionKey::C => "c",
            OptionKey::D => "d",
        }
    }
}

/// A multiple choice question. Field names on the wire follow the JSON
/// contract the generator produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "pregunta")]
    pub prompt: String,
    #[serde(rename = "opciones")]
    pub options: BTreeMap<OptionKey, String>,
    #[serde(rename = "respuesta_correcta")]
    pub correct: OptionKey,
    #[serde(rename = "justificacion", default)]
    pub justification: String,
}

/// Ordered; question position is the answer index.
pub type Quiz = Vec<Question>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseModule {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "resumen", default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "contexto_adicional", default, skip_serializing_if = "Option::is_none")]
    pub creator_note: Option<String>,
    #[serde(rename = "cuestionario", default)]
    pub quiz: Quiz,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "modulos", default)]
    pub modules: Vec<CourseModule>,
}

impl Course {
    pub fn total_questions(&self) -> usize {
        self.modules.iter().map(|m| m.quiz.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Quiz,
    Course,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ContentPayload {
    Quiz(Quiz),
    Course(Course),
}

impl ContentPayload {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentPayload::Quiz(_) => ContentKind::Quiz,
            ContentPayload::Course(_) => ContentKind::Course,
        }
    }

    pub fn total_questions(&self) -> usize {
        match self {
            ContentPayload::Quiz(quiz) => quiz.len(),
            ContentPayload::Course(course) => course.total_questions(),
        }
    }

    pub fn default_title(&self) -> String {
        match self {
            ContentPayload::Quiz(_) => "Untitled quiz".into(),
            ContentPayload::Course(course) if !course.title.trim().is_empty() => course.title.clone(),
            ContentPayload::Course(_) => "Untitled course".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    File {
        title: String,
        #[serde(default)]
        description: String,
        file_name: String,
    },
    Video {
        title: String,
        #[serde(default)]
        description: String,
        youtube_url: String,
    },
}

impl Attachment {
    pub fn embed_url(&self) -> Option<String> {
        match self {
            Attachment::Video { youtube_url, .. } => youtube_embed_url(youtube_url),
            Attachment::File { .. } => None,
        }
    }
}

/// Embeddable player URL for `youtu.be/<id>` and `youtube.com/watch?v=<id>` links.
pub fn youtube_embed_url(link: &str) -> Option<String> {
    let parsed = Url::parse(link.trim()).ok()?;
    let host = parsed.host_str()?;
    let id = if host == "youtu.be" {
        parsed.path().trim_start_matches('/').to_string()
    } else if host.contains("youtube.com") {
        parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())?
    } else {
        return None;
    };
    (!id.is_empty()).then(|| format!("https://www.youtube.com/embed/{id}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

fn check_questions(quiz: &[Question], prefix: &str, issues: &mut Vec<ValidationIssue>) {
    for (i, q) in quiz.iter().enumerate() {
        if q.prompt.trim().is_empty() {
            issues.push(ValidationIssue {
                field: format!("{prefix}[{i}].pregunta"),
                issue: "must not be empty".into(),
            });
        }
        if q.options.len() < 2 {
            issues.push(ValidationIssue {
                field: format!("{prefix}[{i}].opciones"),
                issue: "must contain at least 2 options".into(),
            });
        }
        for (key, text) in &q.options {
            if text.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: format!("{prefix}[{i}].opciones.{}", key.as_str()),
                    issue: "must not be empty".into(),
                });
            }
        }
        if !q.options.contains_key(&q.correct) {
            issues.push(ValidationIssue {
                field: format!("{prefix}[{i}].respuesta_correcta"),
                issue: "must reference an existing option".into(),
            });
        }
    }
}

/// Standalone quizzes need at least one question.
pub fn validate_quiz(quiz: &[Question]) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if quiz.is_empty() {
        issues.push(ValidationIssue {
            field: "data".into(),
            issue: "must contain at least one question".into(),
        });
    }
    check_questions(quiz, "data", &mut issues);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Courses may have no modules and modules may have empty quizzes.
pub fn validate_course(course: &Course) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if course.title.trim().is_empty() {
        issues.push(ValidationIssue {
            field: "data.titulo".into(),
            issue: "must not be empty".into(),
        });
    }
    for (i, module) in course.modules.iter().enumerate() {
        if module.title.trim().is_empty() {
            issues.push(ValidationIssue {
                field: format!("data.modulos[{i}].titulo"),
                issue: "must not be empty".into(),
            });
        }
        check_questions(&module.quiz, &format!("data.modulos[{i}].cuestionario"), &mut issues);
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

pub fn validate_payload(payload: &ContentPayload) -> Result<(), Vec<ValidationIssue>> {
    match payload {
        ContentPayload::Quiz(quiz) => validate_quiz(quiz),
        ContentPayload::Course(course) => validate_course(course),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn question_uses_generator_field_names() {
        let raw = r#"{
            "pregunta": "2+2?",
            "opciones": {"a": "3", "b": "4", "c": "5", "d": "22"},
            "respuesta_correcta": "b",
            "justificacion": "arithmetic"
        }"#;
        let q: Question = serde_json::from_str(raw).unwrap();
        assert_eq!(q.correct, OptionKey::B);
        assert_eq!(q.options[&OptionKey::D], "22");
        let back = serde_json::to_value(&q).unwrap();
        assert_eq!(back["respuesta_correcta"], "b");
    }

    #[test]
    fn course_tolerates_missing_optional_fields_and_extra_keys() {
        let raw = r#"{
            "titulo": "Biology",
            "modulos": [{"titulo": "Intro", "cuestionario": []}],
            "propertyOrdering": ["titulo", "modulos"]
        }"#;
        let course: Course = serde_json::from_str(raw).unwrap();
        assert_eq!(course.modules.len(), 1);
        assert!(course.modules[0].summary.is_none());
        assert!(validate_course(&course).is_ok());
    }

    #[test]
    fn payload_is_adjacently_tagged() {
        let payload = ContentPayload::Quiz(quiz(1));
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "quiz");
        assert!(v["data"].is_array());
        assert_eq!(payload.kind(), ContentKind::Quiz);
    }

    #[test]
    fn correct_key_must_exist_in_options() {
        let mut q = question(OptionKey::C);
        q.options.remove(&OptionKey::C);
        let issues = validate_quiz(&[q]).unwrap_err();
        assert!(issues.iter().any(|i| i.field == "data[0].respuesta_correcta"));
    }

    #[test]
    fn empty_standalone_quiz_rejected_but_empty_course_allowed() {
        assert!(validate_quiz(&[]).is_err());
        let course = course(&[]);
        assert!(validate_course(&course).is_ok());
        assert_eq!(course.total_questions(), 0);
    }

    #[test]
    fn youtube_links_map_to_embed_urls() {
        assert_eq!(
            youtube_embed_url("https://youtu.be/abc123").as_deref(),
            Some("https://www.youtube.com/embed/abc123")
        );
        assert_eq!(
            youtube_embed_url("https://www.youtube.com/watch?v=XyZ_9&t=10").as_deref(),
            Some("https://www.youtube.com/embed/XyZ_9")
        );
        assert_eq!(
            youtube_embed_url("https://WWW.YOUTUBE.COM/watch?v=abc123").as_deref(),
            Some("https://www.youtube.com/embed/abc123")
        );
        assert_eq!(
            youtube_embed_url("https://www.youtube.com:443/watch?v=abc123").as_deref(),
            Some("https://www.youtube.com/embed/abc123")
        );
        assert_eq!(
            youtube_embed_url("http://m.youtube.com:8080/watch?feature=share&v=abc123").as_deref(),
            Some("https://www.youtube.com/embed/abc123")
        );
        assert_eq!(youtube_embed_url("https://www.youtube.com/watch?list=x"), None);
        assert_eq!(youtube_embed_url("https://youtu.be/"), None);
        assert_eq!(youtube_embed_url("https://vimeo.com/123"), None);
        assert_eq!(youtube_embed_url("not a url"), None);
    }
}
