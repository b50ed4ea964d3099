use serde_json::json;

use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::export::DocxExporter;
use crate::llm::LlmClient;
use crate::models::{Chapter, DocumentContent, GeneratedSection, RetrievedContext};
use crate::placeholder::PlaceholderEngine;
use crate::retrieval::ContextBuilder;
use crate::storage::BlobStore;
use crate::tasks::ProjectLocks;

/// Generates chapter prose from the analyzed outline, substitutes bound
/// materials and exports the assembled document. Chapters run strictly in
/// order; any LLM failure aborts the whole request.
#[derive(Clone)]
pub struct GenerationService {
    db: Database,
    llm: LlmClient,
    context: ContextBuilder,
    locks: ProjectLocks,
    storage: BlobStore,
    exporter: DocxExporter,
    chunk_max_tokens: usize,
}

impl GenerationService {
    pub fn new(
        db: Database,
        llm: LlmClient,
        context: ContextBuilder,
        locks: ProjectLocks,
        storage: BlobStore,
        chunk_max_tokens: usize,
    ) -> Self {
        let exporter = DocxExporter::new(storage.clone());
        Self {
            db,
            llm,
            context,
            locks,
            storage,
            exporter,
            chunk_max_tokens,
        }
    }

    pub async fn generate(&self, project_id: i64) -> PipelineResult<serde_json::Value> {
        let project = self
            .db
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("project {project_id}")))?;

        let analysis = self
            .db
            .latest_analysis(project_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Validation("请先完成招标内容解析后再生成投标书".to_string())
            })?;

        let _guard = self.locks.acquire(project_id).await;

        // Prefer the outline stored alongside the generated content; the
        // client may have edited it after analysis.
        let stored = self.db.document_content(project_id).await?;
        let chapters = effective_chapters(
            stored.as_ref().map(|c| c.structure.clone()).unwrap_or_default(),
            &analysis.document_structure,
            &analysis.summary,
        );
        if chapters.is_empty() {
            return Err(PipelineError::Validation(
                "请先完成招标内容解析后再生成投标书".to_string(),
            ));
        }

        let files = self.db.files_for_project(project_id).await?;

        let mut sections = Vec::with_capacity(chapters.len());
        for chapter in &chapters {
            let query = format!("{} {}", project.name, chapter.title);
            let context = self.context.build(&project, &files, Some(&query)).await?;
            let prompt = chapter_prompt(&project.name, chapter, &analysis.summary, &context);

            tracing::info!(
                "generating chapter | project_id={project_id} chapter={}",
                chapter.id
            );
            let raw = self.llm.generate(&prompt).await?;

            sections.push(GeneratedSection {
                heading: chapter.title.clone(),
                level: heading_level(&chapter.id),
                body: clean_markdown(&raw),
            });
        }

        let engine = PlaceholderEngine::for_project(
            &self.db,
            &self.storage,
            project_id,
            self.chunk_max_tokens,
        )
        .await?;
        let sections = engine.apply_sections(&sections);

        self.db
            .save_document_content(
                project_id,
                &DocumentContent {
                    content: sections.clone(),
                    structure: chapters,
                },
            )
            .await?;

        let export = self.exporter.export(&project.name, &sections).await?;
        self.db.update_project_status(project_id, "Generated").await?;

        Ok(json!({
            "objectName": export.object_name,
            "filename": export.filename,
            "size": export.size,
            "sections": sections.len(),
        }))
    }
}

/// The outline the generation loop walks: stored structure if present, else
/// the analysis outline, else a single overview chapter synthesized from the
/// summary. An empty summary yields nothing.
pub fn effective_chapters(
    stored: Vec<Chapter>,
    analyzed: &[Chapter],
    summary: &str,
) -> Vec<Chapter> {
    if !stored.is_empty() {
        return stored;
    }
    if !analyzed.is_empty() {
        return analyzed.to_vec();
    }
    let summary = summary.trim();
    if summary.is_empty() {
        return vec![];
    }
    vec![Chapter {
        id: "1".to_string(),
        title: "概要".to_string(),
        sections: vec![summary.to_string()],
    }]
}

/// Heading depth from the hierarchical chapter id: "1" is level 1, "2.1"
/// level 2, and so on.
pub fn heading_level(chapter_id: &str) -> i64 {
    chapter_id.split('.').filter(|part| !part.is_empty()).count() as i64
}

pub fn chapter_prompt(
    project_name: &str,
    chapter: &Chapter,
    summary: &str,
    context: &RetrievedContext,
) -> String {
    let bullets = chapter
        .sections
        .iter()
        .enumerate()
        .map(|(i, section)| format!("{}. {}", i + 1, section))
        .collect::<Vec<_>>()
        .join("\n");
    let bullets = if bullets.is_empty() {
        "（无要点，请围绕章节标题撰写）".to_string()
    } else {
        bullets
    };

    let facts = serde_json::to_string(&context.key_facts).unwrap_or_default();
    let kb = non_empty_or(&context.kb_answers, "无");
    // Chapter prompts carry a tighter evidence excerpt than analysis does.
    let raw: String = context.raw_excerpts.chars().take(500).collect();
    let raw = non_empty_or(&raw, "无");
    let snippets = if context.local_snippets.is_empty() {
        "无".to_string()
    } else {
        context
            .local_snippets
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "你是投标书撰写专家，正在为项目「{project_name}」撰写投标文件中的章节「{}」。\n\
         要求：\n\
         1. 只输出本章节的连续正文，不要重复章节标题，不要问候语、落款或任何解释说明。\n\
         2. 必须逐条展开下列每个要点，并遵循要点自带的编号层级。\n\
         3. 形如 {{{{...}}}} 的占位符必须原样保留，不得改写或删除。\n\n\
         本章要点：\n{bullets}\n\n\
         招标内容总结：\n{}\n\n\
         已提取的关键信息：{facts}\n\n\
         知识库参考：\n{kb}\n\n\
         本地资料片段：\n{snippets}\n\n\
         招标文件原文摘录：\n{raw}",
        chapter.title,
        non_empty_or(summary, "无"),
    )
}

fn non_empty_or<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    if text.trim().is_empty() {
        fallback
    } else {
        text
    }
}

/// Strip residual Markdown markers line by line, preserving line breaks:
/// leading heading hashes, bullet dashes/asterisks, and bold markers.
pub fn clean_markdown(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let without_heading = trimmed.trim_start_matches('#').trim_start();
            let without_bullet = without_heading
                .strip_prefix("- ")
                .or_else(|| without_heading.strip_prefix("* "))
                .unwrap_or(without_heading);
            without_bullet.replace("**", "").replace("__", "")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyFacts;

    #[test]
    fn markdown_markers_are_stripped_per_line() {
        let raw = "## 标题行\n- 第一点\n* 第二点\n正文包含**加粗**与__强调__\n\n  - 缩进要点";
        let cleaned = clean_markdown(raw);
        assert_eq!(
            cleaned,
            "标题行\n第一点\n第二点\n正文包含加粗与强调\n\n缩进要点"
        );
    }

    #[test]
    fn placeholders_survive_cleaning() {
        assert_eq!(
            clean_markdown("见 {{material:company_intro}} 部分"),
            "见 {{material:company_intro}} 部分"
        );
    }

    #[test]
    fn heading_levels_follow_id_depth() {
        assert_eq!(heading_level("1"), 1);
        assert_eq!(heading_level("2.1"), 2);
        assert_eq!(heading_level("2.1.3"), 3);
    }

    #[test]
    fn stored_outline_wins_over_analysis_outline() {
        let stored = vec![Chapter {
            id: "1".to_string(),
            title: "编辑后的章节".to_string(),
            sections: vec![],
        }];
        let analyzed = vec![Chapter {
            id: "9".to_string(),
            title: "分析章节".to_string(),
            sections: vec![],
        }];
        let chapters = effective_chapters(stored.clone(), &analyzed, "总结");
        assert_eq!(chapters, stored);
    }

    #[test]
    fn empty_outline_synthesizes_overview_from_summary() {
        let chapters = effective_chapters(vec![], &[], "本项目为安全运营服务。");
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "概要");
        assert_eq!(chapters[0].sections, vec!["本项目为安全运营服务。"]);

        assert!(effective_chapters(vec![], &[], "  ").is_empty());
    }

    #[test]
    fn prompt_numbers_bullets_and_keeps_placeholders() {
        let chapter = Chapter {
            id: "2.1".to_string(),
            title: "2.1 投标方信息概述".to_string(),
            sections: vec![
                "2.1.1 公司简介".to_string(),
                "{{material:company_intro}}".to_string(),
            ],
        };
        let context = RetrievedContext {
            raw_excerpts: String::new(),
            key_facts: KeyFacts::default(),
            kb_answers: String::new(),
            local_snippets: vec![],
        };

        let prompt = chapter_prompt("测试项目", &chapter, "总结文字", &context);
        assert!(prompt.contains("1. 2.1.1 公司简介"));
        assert!(prompt.contains("2. {{material:company_intro}}"));
        assert!(prompt.contains("测试项目"));
        assert!(prompt.contains("总结文字"));
        assert!(prompt.contains("原样保留"));
    }
}
