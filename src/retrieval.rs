use std::collections::{HashMap, HashSet};

use crate::config::RetrievalConfig;
use crate::db::Database;
use crate::error::PipelineResult;
use crate::ingest::{is_textual, parse_file_bytes};
use crate::knowledge::KnowledgeBase;
use crate::llm::LlmClient;
use crate::models::{DocumentChunk, FileRecord, KeyFacts, Project, RetrievedContext, ScoredChunk};
use crate::parse::{parse_llm_json, preview};
use crate::storage::BlobStore;

/// How local chunks are scored against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankMode {
    TfIdf,
    KeywordCount,
}

/// Assembles everything a model call is grounded on: raw source excerpts,
/// an extracted fact record, knowledge-base answers and locally ranked
/// snippets. Rebuilt for every analysis or generation pass.
#[derive(Clone)]
pub struct ContextBuilder {
    db: Database,
    storage: BlobStore,
    llm: LlmClient,
    kb: KnowledgeBase,
    config: RetrievalConfig,
}

impl ContextBuilder {
    pub fn new(
        db: Database,
        storage: BlobStore,
        llm: LlmClient,
        kb: KnowledgeBase,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            storage,
            llm,
            kb,
            config,
        }
    }

    pub async fn build(
        &self,
        project: &Project,
        files: &[FileRecord],
        chapter_query: Option<&str>,
    ) -> PipelineResult<RetrievedContext> {
        let raw_excerpts = self.read_raw_text(files).await;
        let key_facts = self.extract_key_facts(&raw_excerpts).await;

        let queries = build_kb_queries(&key_facts, &project.name);
        let kb_answers = self.collect_kb_answers(&queries).await;

        let chunks = self.db.chunks_for_project(project.id).await?;
        let query = chapter_query.unwrap_or(project.name.as_str());
        let local_snippets = rank_chunks(&chunks, query, self.config.snippet_top_k);

        Ok(RetrievedContext {
            raw_excerpts,
            key_facts,
            kb_answers,
            local_snippets,
        })
    }

    /// Read source excerpts straight from the blob store, newest file first,
    /// under the shared character budget.
    async fn read_raw_text(&self, files: &[FileRecord]) -> String {
        let mut parts = Vec::new();
        for file in files {
            if !is_textual(&file.filename, file.content_type.as_deref()) {
                continue;
            }
            let Ok(bytes) = self.storage.get(&file.object_name).await else {
                continue;
            };
            match parse_file_bytes(&file.filename, &bytes, self.config.chunk_max_tokens) {
                Ok(chunks) if !chunks.is_empty() => {
                    parts.push((file.filename.clone(), chunks.join("\n")))
                }
                _ => continue,
            }
        }
        assemble_excerpts(parts, self.config.raw_text_budget)
    }

    /// One auxiliary LLM call extracting the fixed-shape fact record from
    /// the raw text. Fails open: any error yields an empty record.
    pub async fn extract_key_facts(&self, raw_text: &str) -> KeyFacts {
        if raw_text.trim().is_empty() {
            return KeyFacts::default();
        }

        let prompt = format!(
            "你是招标文件的关键信息抽取器。请只基于原文提取，输出 JSON（不要解释、不用 Markdown），字段：\n\
             - project_type: 简短项目类型（如“网络安全运营服务”），不要长句。\n\
             - core_tech: 关键技术/服务能力关键词数组，不要泛化表述。\n\
             - qualification: 必须的资质/证书/人员要求。\n\
             - scoring_focus: 评分办法中明确影响得分的要点。\n\
             - risk_points: 可直接从文件判断的废标或重大扣分风险，若无则空数组。\n\n\
             招标文件原文：\n{raw_text}"
        );

        let raw = match self.llm.generate_auxiliary(&prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("key fact extraction failed: {err}");
                return KeyFacts::default();
            }
        };

        match parse_llm_json(&raw) {
            Ok(map) => KeyFacts::from_value(&serde_json::Value::Object(map)),
            Err(_) => {
                tracing::warn!("key fact output not JSON | raw={}", preview(&raw));
                KeyFacts::default()
            }
        }
    }

    /// Query the knowledge base once per derived question. Per-query
    /// failures are logged and skipped; they never abort the batch.
    pub async fn collect_kb_answers(&self, queries: &[String]) -> String {
        if !self.kb.is_configured() {
            return String::new();
        }

        let mut answers = Vec::new();
        for query in queries {
            match self.kb.query(query).await {
                Ok(Some(answer)) => answers.push(format!("【{query}】\n{answer}")),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("knowledge base query failed | q={query} | {err}");
                }
            }
        }
        answers.join("\n\n")
    }
}

/// Concatenate filename-tagged excerpts under a shared character budget.
/// Files past the budget are dropped entirely.
pub fn assemble_excerpts(parts: Vec<(String, String)>, budget: usize) -> String {
    let mut remaining = budget;
    let mut snippets = Vec::new();
    for (filename, text) in parts {
        if remaining == 0 {
            break;
        }
        let trimmed: String = text.chars().take(remaining).collect();
        if trimmed.is_empty() {
            continue;
        }
        remaining -= trimmed.chars().count();
        snippets.push(format!("[{filename}]\n{trimmed}"));
    }
    snippets.join("\n\n")
}

/// Derive targeted knowledge-base questions from the extracted facts. With
/// no usable facts, a single generic query built from the project name.
pub fn build_kb_queries(facts: &KeyFacts, project_name: &str) -> Vec<String> {
    if facts.is_empty() {
        return vec![format!("{project_name} 招投标 经验 要点")];
    }

    let project_type = facts.project_type.as_deref().unwrap_or("");
    let mut queries = Vec::new();

    if !project_type.is_empty() {
        queries.push(format!("{project_type} 招投标 常见 技术评分 要点"));
        queries.push(format!("{project_type} 项目 废标 常见 原因"));
    }
    if !facts.qualification.is_empty() {
        queries.push(format!(
            "{project_type} 资质审查 风险 {}",
            facts.qualification.join(" ")
        ));
    }
    if !facts.core_tech.is_empty() {
        queries.push(format!(
            "{project_type} {} 技术方案 投标 经验",
            facts.core_tech.join(" ")
        ));
    }
    if !facts.scoring_focus.is_empty() {
        queries.push(format!(
            "{project_type} 评分重点 {}",
            facts.scoring_focus.join(" ")
        ));
    }

    if queries.is_empty() {
        queries.push(format!("{project_name} 招投标 经验 要点"));
    }
    queries
}

/// Rank stored chunks against a query: TF-IDF cosine first, falling back to
/// keyword occurrence counts when the vector pass finds nothing. Top-K,
/// highest first; ties keep storage order (stable sort).
pub fn rank_chunks(chunks: &[DocumentChunk], query: &str, top_k: usize) -> Vec<ScoredChunk> {
    let scored = rank_chunks_with_mode(chunks, query, top_k, RankMode::TfIdf);
    if scored.iter().any(|s| s.score > 0.0) {
        return scored;
    }
    rank_chunks_with_mode(chunks, query, top_k, RankMode::KeywordCount)
}

pub fn rank_chunks_with_mode(
    chunks: &[DocumentChunk],
    query: &str,
    top_k: usize,
    mode: RankMode,
) -> Vec<ScoredChunk> {
    if chunks.is_empty() || top_k == 0 {
        return vec![];
    }

    let scores: Vec<f32> = match mode {
        RankMode::TfIdf => tfidf_scores(chunks, query),
        RankMode::KeywordCount => chunks
            .iter()
            .map(|chunk| keyword_score(&chunk.content, query))
            .collect(),
    };

    let mut ranked: Vec<ScoredChunk> = chunks
        .iter()
        .zip(scores)
        .map(|(chunk, score)| ScoredChunk {
            chunk_id: chunk.id,
            content: chunk.content.clone(),
            score,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_k);
    ranked
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
        .collect()
}

/// Cosine similarity between the query and each chunk in TF-IDF space.
fn tfidf_scores(chunks: &[DocumentChunk], query: &str) -> Vec<f32> {
    let doc_tokens: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.content)).collect();
    let n_docs = doc_tokens.len() as f32;

    let mut doc_freq: HashMap<&str, f32> = HashMap::new();
    for tokens in &doc_tokens {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for token in unique {
            *doc_freq.entry(token).or_insert(0.0) += 1.0;
        }
    }

    let idf = |token: &str| -> f32 {
        let df = doc_freq.get(token).copied().unwrap_or(0.0);
        ((n_docs + 1.0) / (df + 1.0)).ln() + 1.0
    };

    let vector_of = |tokens: &[String]| -> HashMap<String, f32> {
        let mut tf: HashMap<String, f32> = HashMap::new();
        for token in tokens {
            *tf.entry(token.clone()).or_insert(0.0) += 1.0;
        }
        let total = tokens.len().max(1) as f32;
        tf.into_iter()
            .map(|(token, count)| {
                let weight = (count / total) * idf(&token);
                (token, weight)
            })
            .collect()
    };

    let query_vec = vector_of(&tokenize(query));
    let query_norm = norm(&query_vec);
    if query_norm == 0.0 {
        return vec![0.0; chunks.len()];
    }

    doc_tokens
        .iter()
        .map(|tokens| {
            let doc_vec = vector_of(tokens);
            let doc_norm = norm(&doc_vec);
            if doc_norm == 0.0 {
                return 0.0;
            }
            let dot: f32 = query_vec
                .iter()
                .filter_map(|(token, w)| doc_vec.get(token).map(|dw| w * dw))
                .sum();
            dot / (query_norm * doc_norm)
        })
        .collect()
}

fn norm(vector: &HashMap<String, f32>) -> f32 {
    vector.values().map(|w| w * w).sum::<f32>().sqrt()
}

/// Occurrence count of chunk tokens inside the query, summed per token.
fn keyword_score(content: &str, query: &str) -> f32 {
    let query_tokens = tokenize(query);
    tokenize(content)
        .iter()
        .map(|token| query_tokens.iter().filter(|q| *q == token).count() as f32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, content: &str) -> DocumentChunk {
        DocumentChunk {
            id,
            project_id: 1,
            file_id: 1,
            chunk_index: id,
            content: content.to_string(),
        }
    }

    #[test]
    fn denser_match_ranks_first_in_both_modes() {
        let chunks = vec![chunk(1, "cat dog"), chunk(2, "cat cat cat")];

        for mode in [RankMode::TfIdf, RankMode::KeywordCount] {
            let ranked = rank_chunks_with_mode(&chunks, "cat", 5, mode);
            assert_eq!(ranked[0].chunk_id, 2, "mode {mode:?}");
            assert!(ranked[0].score > ranked[1].score);
        }
    }

    #[test]
    fn ties_keep_storage_order() {
        let chunks = vec![chunk(10, "alpha beta"), chunk(11, "alpha beta")];
        let ranked = rank_chunks(&chunks, "alpha", 2);
        assert_eq!(ranked[0].chunk_id, 10);
        assert_eq!(ranked[1].chunk_id, 11);
    }

    #[test]
    fn top_k_truncates() {
        let chunks: Vec<DocumentChunk> = (0..10).map(|i| chunk(i, "term filler")).collect();
        assert_eq!(rank_chunks(&chunks, "term", 3).len(), 3);
    }

    #[test]
    fn unmatched_query_falls_back_to_keyword_mode() {
        // TF-IDF gives all zeros for a query with no shared vocabulary; the
        // keyword pass also scores zero but must not panic or drop entries.
        let chunks = vec![chunk(1, "alpha"), chunk(2, "beta")];
        let ranked = rank_chunks(&chunks, "岗位", 2);
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn excerpt_budget_is_shared_across_files() {
        let parts = vec![
            ("a.txt".to_string(), "12345".to_string()),
            ("b.txt".to_string(), "67890".to_string()),
        ];
        let out = assemble_excerpts(parts, 7);
        assert!(out.contains("[a.txt]\n12345"));
        assert!(out.contains("[b.txt]\n67"));
        assert!(!out.contains("678901"));
    }

    #[test]
    fn empty_facts_build_generic_query() {
        let queries = build_kb_queries(&KeyFacts::default(), "某某运营项目");
        assert_eq!(queries, vec!["某某运营项目 招投标 经验 要点"]);
    }

    #[test]
    fn rich_facts_build_targeted_queries() {
        let facts = KeyFacts {
            project_type: Some("网络安全运营服务".to_string()),
            core_tech: vec!["7x24监测".to_string(), "态势感知".to_string()],
            qualification: vec!["等保三级".to_string()],
            scoring_focus: vec!["人员配置".to_string()],
            risk_points: vec![],
        };
        let queries = build_kb_queries(&facts, "ignored");
        assert_eq!(queries.len(), 5);
        assert!(queries[0].contains("技术评分"));
        assert!(queries[1].contains("废标"));
        assert!(queries[2].contains("等保三级"));
        assert!(queries[3].contains("7x24监测 态势感知"));
        assert!(queries[4].contains("人员配置"));
    }
}
