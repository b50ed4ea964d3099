use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use roxmltree::Document;
use zip::ZipArchive;

use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::BlobStore;

/// True for content kinds the retrieval pipeline can read as text.
pub fn is_textual(filename: &str, content_type: Option<&str>) -> bool {
    let lower = filename.to_ascii_lowercase();
    if [".pdf", ".doc", ".docx", ".txt", ".md"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        return true;
    }
    content_type
        .map(|ct| ["pdf", "word", "text"].iter().any(|tag| ct.contains(tag)))
        .unwrap_or(false)
}

/// Parse raw file bytes into word-bounded chunks. Unknown formats are
/// treated as UTF-8 text.
pub fn parse_file_bytes(filename: &str, data: &[u8], max_tokens: usize) -> Result<Vec<String>> {
    let lower = filename.to_ascii_lowercase();
    let text = if lower.ends_with(".pdf") {
        extract_pdf_text(data)?
    } else if lower.ends_with(".docx") || lower.ends_with(".doc") {
        extract_docx_text(data)?
    } else {
        String::from_utf8_lossy(data).into_owned()
    };
    Ok(chunk_text(&text, max_tokens))
}

/// Split text into chunks of at most `max_tokens` whitespace words.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(max_tokens)
        .map(|chunk| chunk.join(" "))
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn extract_pdf_text(data: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(data).context("failed to extract text from PDF")
}

fn extract_docx_text(data: &[u8]) -> Result<String> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).context("DOCX is not a valid ZIP archive")?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX missing word/document.xml")?
        .read_to_string(&mut document_xml)
        .context("failed to read word/document.xml")?;

    let doc = Document::parse(&document_xml).context("failed to parse DOCX XML")?;

    let mut paragraphs = Vec::new();
    for paragraph in doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "p")
    {
        let text = paragraph
            .descendants()
            .filter(|node| node.is_element() && node.tag_name().name() == "t")
            .filter_map(|node| node.text())
            .collect::<Vec<_>>()
            .join("");
        let normalized = normalize_text(&text);
        if !normalized.is_empty() {
            paragraphs.push(normalized);
        }
    }

    Ok(paragraphs.join("\n"))
}

fn normalize_text(input: &str) -> String {
    input
        .replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Parses a project's uploaded files and appends their chunks to the local
/// chunk store. Runs as a background task; re-ingestion appends rather than
/// rewrites.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    storage: BlobStore,
    chunk_max_tokens: usize,
}

impl Ingestor {
    pub fn new(db: Database, storage: BlobStore, chunk_max_tokens: usize) -> Self {
        Self {
            db,
            storage,
            chunk_max_tokens,
        }
    }

    pub async fn ingest_project(&self, project_id: i64) -> PipelineResult<i64> {
        let files = self.db.files_for_project(project_id).await?;
        if files.is_empty() {
            return Err(PipelineError::Validation(
                "未找到可入库的文件，请先上传".to_string(),
            ));
        }

        let mut chunk_count = 0i64;
        for file in files {
            if !is_textual(&file.filename, file.content_type.as_deref()) {
                continue;
            }
            let bytes = match self.storage.get(&file.object_name).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(
                        "skipping unreadable file | file_id={} object={} err={err:#}",
                        file.id,
                        file.object_name
                    );
                    continue;
                }
            };
            let chunks = match parse_file_bytes(&file.filename, &bytes, self.chunk_max_tokens) {
                Ok(chunks) => chunks,
                Err(err) => {
                    tracing::warn!("parse failed | file_id={} err={err:#}", file.id);
                    continue;
                }
            };
            chunk_count += chunks.len() as i64;
            self.db.append_chunks(project_id, file.id, &chunks).await?;
        }

        Ok(chunk_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_on_word_boundary() {
        let text = (1..=25)
            .map(|n| format!("word{n}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].split_whitespace().count(), 10);
        assert_eq!(chunks[2].split_whitespace().count(), 5);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("   \n  ", 10).is_empty());
    }

    #[test]
    fn textual_detection_covers_extensions_and_content_types() {
        assert!(is_textual("tender.PDF", None));
        assert!(is_textual("notes.md", None));
        assert!(is_textual("blob", Some("application/pdf")));
        assert!(is_textual("blob", Some("text/plain")));
        assert!(!is_textual("photo.png", Some("image/png")));
    }

    #[test]
    fn plain_text_bytes_parse_as_utf8() {
        let chunks = parse_file_bytes("notes.txt", "alpha beta gamma".as_bytes(), 2).unwrap();
        assert_eq!(chunks, vec!["alpha beta", "gamma"]);
    }
}
