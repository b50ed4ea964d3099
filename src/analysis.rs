use chrono::{DateTime, Utc};
use serde_json::Map;

use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::LlmClient;
use crate::models::{AnalysisRecord, DocumentContent, RetrievedContext, TenderAnalysis};
use crate::parse::{parse_llm_json, preview};
use crate::retrieval::ContextBuilder;
use crate::structure::{
    coerce_summary, normalize_key_dates, normalize_structure, OutlineTemplate,
};
use crate::tasks::ProjectLocks;

/// Why an analysis request hit or missed the cache. All non-`CachedValid`
/// states trigger the same regeneration path; the distinction is for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    NoRecord,
    CachedValid,
    CachedStaleNewFile,
    CachedInvalidContent,
    ForcedRefresh,
}

impl CacheState {
    pub fn should_regenerate(self) -> bool {
        self != CacheState::CachedValid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::NoRecord => "no-record",
            CacheState::CachedValid => "cached-valid",
            CacheState::CachedStaleNewFile => "stale-new-file",
            CacheState::CachedInvalidContent => "invalid-content",
            CacheState::ForcedRefresh => "forced-refresh",
        }
    }
}

/// A stored record is reusable only when its content is substantive: a real
/// summary, at least one key date and a non-empty outline.
pub fn record_is_valid(record: &AnalysisRecord) -> bool {
    let summary = record.summary.trim();
    !summary.is_empty()
        && summary != crate::structure::SUMMARY_PLACEHOLDER
        && !record.key_dates.is_empty()
        && !record.document_structure.is_empty()
}

pub fn evaluate_cache(
    record: Option<&AnalysisRecord>,
    latest_file_at: Option<DateTime<Utc>>,
    refresh: bool,
) -> CacheState {
    let Some(record) = record else {
        return CacheState::NoRecord;
    };
    if refresh {
        return CacheState::ForcedRefresh;
    }
    let has_new_file = latest_file_at
        .map(|at| at > record.updated_at)
        .unwrap_or(false);
    if has_new_file {
        return CacheState::CachedStaleNewFile;
    }
    if !record_is_valid(record) {
        return CacheState::CachedInvalidContent;
    }
    CacheState::CachedValid
}

/// Runs the full tender analysis: retrieval, one structured LLM call,
/// tolerant decoding, outline enforcement, then persistence. Mutations for
/// one project are serialized behind its lock.
#[derive(Clone)]
pub struct AnalysisService {
    db: Database,
    llm: LlmClient,
    context: ContextBuilder,
    locks: ProjectLocks,
    template: OutlineTemplate,
}

impl AnalysisService {
    pub fn new(db: Database, llm: LlmClient, context: ContextBuilder, locks: ProjectLocks) -> Self {
        Self {
            db,
            llm,
            context,
            locks,
            template: OutlineTemplate::commercial(),
        }
    }

    pub async fn analyze(&self, project_id: i64, refresh: bool) -> PipelineResult<TenderAnalysis> {
        let project = self
            .db
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("project {project_id}")))?;

        let files = self.db.files_for_project(project_id).await?;
        if files.is_empty() {
            return Err(PipelineError::Validation(
                "未找到招标文件，请先上传后再分析".to_string(),
            ));
        }

        let _guard = self.locks.acquire(project_id).await;

        let record = self.db.latest_analysis(project_id).await?;
        // Files are ordered newest first.
        let latest_file_at = files.first().map(|f| f.created_at);
        let state = evaluate_cache(record.as_ref(), latest_file_at, refresh);

        if !state.should_regenerate() {
            if let Some(record) = record {
                tracing::info!("analysis cache hit | project_id={project_id}");
                return Ok(TenderAnalysis {
                    summary: record.summary,
                    key_dates: record.key_dates,
                    document_structure: record.document_structure,
                });
            }
        }

        tracing::info!(
            "regenerating analysis | project_id={project_id} reason={}",
            state.as_str()
        );

        let context = self.context.build(&project, &files, None).await?;
        let prompt = analysis_prompt(&project.name, &context, &self.template);
        let raw = self.llm.generate(&prompt).await?;

        let parsed = match parse_llm_json(&raw) {
            Ok(map) => map,
            Err(_) => {
                tracing::warn!(
                    "analysis output not JSON, falling back to defaults | project_id={project_id} raw={}",
                    preview(&raw)
                );
                Map::new()
            }
        };

        let analysis = decode_analysis(&parsed, &self.template);
        self.db.upsert_analysis(project_id, &analysis).await?;
        self.seed_outline(project_id, &analysis).await?;
        self.db.update_project_status(project_id, "Analyzed").await?;

        Ok(analysis)
    }

    /// Store the fresh outline alongside the generated prose, but only when
    /// no prose exists yet. Re-analysis must never clobber generated text.
    async fn seed_outline(&self, project_id: i64, analysis: &TenderAnalysis) -> PipelineResult<()> {
        let existing = self.db.document_content(project_id).await?;
        if existing
            .as_ref()
            .map(|c| !c.content.is_empty())
            .unwrap_or(false)
        {
            return Ok(());
        }
        self.db
            .save_document_content(
                project_id,
                &DocumentContent {
                    content: vec![],
                    structure: analysis.document_structure.clone(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Map the duck-typed model payload onto the canonical analysis shape, then
/// force the outline through template enforcement.
pub fn decode_analysis(
    parsed: &Map<String, serde_json::Value>,
    template: &OutlineTemplate,
) -> TenderAnalysis {
    let summary = coerce_summary(parsed.get("summary"));
    let key_dates = normalize_key_dates(parsed.get("key_dates").or_else(|| parsed.get("keyDates")));
    let structure = normalize_structure(
        parsed
            .get("document_structure")
            .or_else(|| parsed.get("documentStructure")),
    );

    TenderAnalysis {
        summary,
        key_dates,
        document_structure: template.enforce(structure),
    }
}

fn analysis_prompt(
    project_name: &str,
    context: &RetrievedContext,
    template: &OutlineTemplate,
) -> String {
    let skeleton = serde_json::to_string(&template.chapters).unwrap_or_default();
    let facts = serde_json::to_string(&context.key_facts).unwrap_or_default();
    let kb = if context.kb_answers.trim().is_empty() {
        "无"
    } else {
        context.kb_answers.as_str()
    };
    let raw = if context.raw_excerpts.trim().is_empty() {
        "无"
    } else {
        context.raw_excerpts.as_str()
    };

    format!(
        "你是投标书编制专家。请分析项目「{project_name}」的招标文件，并只输出一个 JSON 对象（不要解释、不要 Markdown 代码块），包含：\n\
         - summary: 对招标内容的总结（项目背景、采购范围、关键要求），连续成段文字。\n\
         - key_dates: 数组，每项 {{\"label\": 名称, \"date\": 时间}}，至少包含投标截止时间、开标时间、答疑截止时间，原文未给出的填“待定”。\n\
         - document_structure: 投标文件章节数组，每项 {{\"id\", \"title\", \"sections\"}}。必须覆盖以下模板的全部章节编号，可以在其基础上细化：\n{skeleton}\n\n\
         已提取的关键信息：{facts}\n\n\
         知识库参考：\n{kb}\n\n\
         招标文件原文摘录：\n{raw}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KnowledgeConfig, LlmConfig, RetrievalConfig};
    use crate::knowledge::KnowledgeBase;
    use crate::models::{Chapter, KeyDate};
    use crate::storage::BlobStore;

    fn record(summary: &str, dates: usize, chapters: usize) -> AnalysisRecord {
        AnalysisRecord {
            id: 1,
            project_id: 1,
            summary: summary.to_string(),
            key_dates: (0..dates)
                .map(|i| KeyDate {
                    label: format!("d{i}"),
                    date: "待定".to_string(),
                })
                .collect(),
            document_structure: (0..chapters)
                .map(|i| Chapter {
                    id: i.to_string(),
                    title: format!("c{i}"),
                    sections: vec![],
                })
                .collect(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn missing_record_always_regenerates() {
        assert_eq!(evaluate_cache(None, None, false), CacheState::NoRecord);
        assert!(CacheState::NoRecord.should_regenerate());
    }

    #[test]
    fn cache_decision_covers_all_condition_combinations() {
        // Four booleans: forced refresh, valid summary, non-empty content
        // (dates and structure), and a file newer than the record. Only the
        // single all-good row may serve from cache.
        for refresh in [false, true] {
            for summary_ok in [false, true] {
                for content_ok in [false, true] {
                    for new_file in [false, true] {
                        let summary = if summary_ok { "正常总结" } else { "" };
                        let n = if content_ok { 2 } else { 0 };
                        let rec = record(summary, n, n);
                        let file_at = if new_file {
                            Some(rec.updated_at + chrono::Duration::seconds(60))
                        } else {
                            Some(rec.updated_at - chrono::Duration::seconds(60))
                        };

                        let state = evaluate_cache(Some(&rec), file_at, refresh);
                        let expect_hit = !refresh && summary_ok && content_ok && !new_file;
                        assert_eq!(
                            state == CacheState::CachedValid,
                            expect_hit,
                            "refresh={refresh} summary_ok={summary_ok} content_ok={content_ok} new_file={new_file} -> {state:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn placeholder_summary_invalidates_the_record() {
        let rec = record(crate::structure::SUMMARY_PLACEHOLDER, 2, 2);
        assert!(!record_is_valid(&rec));
        assert_eq!(
            evaluate_cache(Some(&rec), None, false),
            CacheState::CachedInvalidContent
        );
    }

    #[test]
    fn decode_falls_back_to_template_on_empty_payload() {
        let template = OutlineTemplate::commercial();
        let analysis = decode_analysis(&Map::new(), &template);

        assert_eq!(analysis.summary, crate::structure::SUMMARY_PLACEHOLDER);
        assert_eq!(analysis.document_structure, template.chapters);
        assert!(analysis
            .key_dates
            .iter()
            .all(|d| d.date == "待定"));
    }

    async fn test_service() -> (tempfile::TempDir, Database, AnalysisService) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("analysis.db").display());
        let db = Database::connect(&dsn).await.unwrap();

        let storage = BlobStore::new(dir.path().join("blobs"));
        let llm = LlmClient::new(&LlmConfig {
            base_url: None,
            model: "qwen3:14b".to_string(),
            timeout_secs: 300,
            extract_timeout_secs: 60,
        });
        let kb = KnowledgeBase::new(&KnowledgeConfig {
            base_url: None,
            api_key: None,
            timeout_secs: 45,
        });
        let context = ContextBuilder::new(
            db.clone(),
            storage,
            llm.clone(),
            kb,
            RetrievalConfig {
                raw_text_budget: 2000,
                snippet_top_k: 5,
                chunk_max_tokens: 800,
            },
        );
        let service = AnalysisService::new(db.clone(), llm, context, ProjectLocks::new());
        (dir, db, service)
    }

    #[tokio::test]
    async fn zero_files_rejects_without_creating_a_record() {
        let (_dir, db, service) = test_service().await;
        let project = db.create_project("空项目", None).await.unwrap();

        let err = service.analyze(project.id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(err.to_string().contains("未找到招标文件"));
        assert!(db.latest_analysis(project.id).await.unwrap().is_none());
    }
}
