use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An uploaded tender source file. Immutable once stored; read-only input
/// to retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub project_id: i64,
    pub filename: String,
    pub object_name: String,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyDate {
    pub label: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub sections: Vec<String>,
}

/// The analysis returned to clients and persisted per project; latest row by
/// `updated_at` is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderAnalysis {
    pub summary: String,
    pub key_dates: Vec<KeyDate>,
    pub document_structure: Vec<Chapter>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub id: i64,
    pub project_id: i64,
    pub summary: String,
    pub key_dates: Vec<KeyDate>,
    pub document_structure: Vec<Chapter>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSection {
    pub heading: String,
    pub level: i64,
    pub body: String,
}

/// Generated prose plus the outline it was generated from, persisted
/// separately from the analysis so edits never overwrite the outline and
/// re-analysis never clobbers the prose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentContent {
    #[serde(default)]
    pub content: Vec<GeneratedSection>,
    #[serde(default)]
    pub structure: Vec<Chapter>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MaterialKind {
    Image,
    Pdf,
    Word,
    Excel,
    Other,
}

impl MaterialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MaterialKind::Image => "Image",
            MaterialKind::Pdf => "PDF",
            MaterialKind::Word => "Word",
            MaterialKind::Excel => "Excel",
            MaterialKind::Other => "Other",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "Image" => MaterialKind::Image,
            "PDF" => MaterialKind::Pdf,
            "Word" => MaterialKind::Word,
            "Excel" => MaterialKind::Excel,
            _ => MaterialKind::Other,
        }
    }

    pub fn guess(filename: &str, content_type: Option<&str>) -> Self {
        let lower = filename.to_ascii_lowercase();
        if [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            return MaterialKind::Image;
        }
        if lower.ends_with(".pdf") {
            return MaterialKind::Pdf;
        }
        if lower.ends_with(".doc") || lower.ends_with(".docx") {
            return MaterialKind::Word;
        }
        if lower.ends_with(".xls") || lower.ends_with(".xlsx") {
            return MaterialKind::Excel;
        }
        if content_type.map(|ct| ct.contains("image")).unwrap_or(false) {
            return MaterialKind::Image;
        }
        MaterialKind::Other
    }
}

/// A reusable content asset from the material library; independent of any
/// single project, bindable to placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: i64,
    pub kind: MaterialKind,
    pub name: String,
    pub size: i64,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialBinding {
    pub id: i64,
    pub project_id: i64,
    pub placeholder_key: String,
    pub material_id: i64,
}

#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: i64,
    pub project_id: i64,
    pub file_id: i64,
    pub chunk_index: i64,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: i64,
    pub content: String,
    pub score: f32,
}

/// Fixed-shape fact record extracted from the raw tender text. Model output
/// is duck-typed; see `KeyFacts::from_value` for the tolerant coercion.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct KeyFacts {
    pub project_type: Option<String>,
    pub core_tech: Vec<String>,
    pub qualification: Vec<String>,
    pub scoring_focus: Vec<String>,
    pub risk_points: Vec<String>,
}

impl KeyFacts {
    pub fn is_empty(&self) -> bool {
        self.project_type.is_none()
            && self.core_tech.is_empty()
            && self.qualification.is_empty()
            && self.scoring_focus.is_empty()
            && self.risk_points.is_empty()
    }

    pub fn from_value(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };

        Self {
            project_type: map
                .get("project_type")
                .and_then(|v| coerce_scalar(v))
                .filter(|s| !s.is_empty()),
            core_tech: coerce_string_list(map.get("core_tech")),
            qualification: coerce_string_list(map.get("qualification")),
            scoring_focus: coerce_string_list(map.get("scoring_focus")),
            risk_points: coerce_string_list(map.get("risk_points")),
        }
    }
}

/// Flatten a duck-typed list field into plain strings. List entries may be
/// strings or objects carrying the text under value/name/title/type.
fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    let Some(value) = value else {
        return vec![];
    };
    match value {
        Value::Array(items) => items.iter().filter_map(coerce_scalar).collect(),
        other => coerce_scalar(other).map(|s| vec![s]).unwrap_or_default(),
    }
}

pub(crate) fn coerce_scalar(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => {
            let inner = ["value", "name", "title", "type", "text"]
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| v.as_str()));
            match inner {
                Some(s) => s.trim().to_string(),
                None => value.to_string(),
            }
        }
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Everything a generation pass grounds its prompts on. Rebuilt per pass,
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub raw_excerpts: String,
    pub key_facts: KeyFacts,
    pub kb_answers: String,
    pub local_snippets: Vec<ScoredChunk>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    Ingest,
    Generation,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Ingest => "ingest",
            TaskKind::Generation => "generation",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "ingest" => TaskKind::Ingest,
            _ => TaskKind::Generation,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "Pending" => TaskState::Pending,
            "Running" => TaskState::Running,
            "Completed" => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// A background job record. Persisted so task state survives restarts and
/// failures land in a terminal `Failed` state instead of vanishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: i64,
    pub project_id: i64,
    pub kind: TaskKind,
    pub state: TaskState,
    pub progress: f64,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_facts_coerce_mixed_shapes() {
        let value = json!({
            "project_type": "网络安全运营服务",
            "core_tech": ["7x24监测", {"name": "态势感知"}],
            "qualification": {"type": "等保三级"},
            "scoring_focus": [],
        });

        let facts = KeyFacts::from_value(&value);
        assert_eq!(facts.project_type.as_deref(), Some("网络安全运营服务"));
        assert_eq!(facts.core_tech, vec!["7x24监测", "态势感知"]);
        assert_eq!(facts.qualification, vec!["等保三级"]);
        assert!(facts.scoring_focus.is_empty());
        assert!(facts.risk_points.is_empty());
    }

    #[test]
    fn key_facts_from_non_object_is_empty() {
        assert!(KeyFacts::from_value(&json!("not an object")).is_empty());
        assert!(KeyFacts::from_value(&json!(null)).is_empty());
    }

    #[test]
    fn material_kind_guess_prefers_extension() {
        assert_eq!(MaterialKind::guess("logo.PNG", None), MaterialKind::Image);
        assert_eq!(MaterialKind::guess("brief.pdf", None), MaterialKind::Pdf);
        assert_eq!(
            MaterialKind::guess("intro.docx", Some("application/zip")),
            MaterialKind::Word
        );
        assert_eq!(
            MaterialKind::guess("photo", Some("image/jpeg")),
            MaterialKind::Image
        );
        assert_eq!(MaterialKind::guess("data.bin", None), MaterialKind::Other);
    }
}
