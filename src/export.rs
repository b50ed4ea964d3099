use std::io::{Cursor, Write};

use anyhow::Context;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::error::{PipelineError, PipelineResult};
use crate::models::GeneratedSection;
use crate::storage::BlobStore;

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="xml" ContentType="application/xml"/>
  <Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
</Types>"#;

const RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>
</Relationships>"#;

/// What an export produced: where the document landed and how big it is.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub object_name: String,
    pub filename: String,
    pub size: i64,
}

/// Renders generated sections into a minimal WordprocessingML package and
/// stores it in the blob store.
#[derive(Clone)]
pub struct DocxExporter {
    storage: BlobStore,
}

impl DocxExporter {
    pub fn new(storage: BlobStore) -> Self {
        Self { storage }
    }

    pub async fn export(
        &self,
        title: &str,
        sections: &[GeneratedSection],
    ) -> PipelineResult<ExportResult> {
        let bytes = build_docx(title, sections)
            .map_err(|err| PipelineError::Export(format!("docx assembly failed: {err:#}")))?;

        let filename = format!("{}_投标文件.docx", sanitize_filename(title));
        let object_name = format!("exports/{}_{filename}", uuid::Uuid::new_v4());
        let size = bytes.len() as i64;

        self.storage
            .put(&object_name, &bytes)
            .await
            .map_err(|err| PipelineError::Export(format!("failed to store export: {err:#}")))?;

        Ok(ExportResult {
            object_name,
            filename,
            size,
        })
    }
}

fn build_docx(title: &str, sections: &[GeneratedSection]) -> anyhow::Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", options)?;
    zip.write_all(CONTENT_TYPES_XML.as_bytes())?;

    zip.start_file("_rels/.rels", options)?;
    zip.write_all(RELS_XML.as_bytes())?;

    zip.start_file("word/document.xml", options)?;
    zip.write_all(build_document_xml(title, sections).as_bytes())?;

    let cursor = zip.finish().context("failed to finalize docx archive")?;
    Ok(cursor.into_inner())
}

fn build_document_xml(title: &str, sections: &[GeneratedSection]) -> String {
    let mut body = String::new();
    body.push_str(&title_paragraph(title));

    for section in sections {
        body.push_str(&heading_paragraph(&section.heading, section.level));
        for line in section.body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            body.push_str(&text_paragraph(&render_line(line)));
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
    )
}

/// Image markers survive into plain-text export as a labeled reference.
fn render_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix("[[IMAGE|") {
        if let Some(inner) = rest.strip_suffix("]]") {
            let name = inner.split('|').nth(1).unwrap_or(inner);
            return format!("【图片：{name}】");
        }
    }
    line.to_string()
}

fn title_paragraph(title: &str) -> String {
    format!(
        r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:rPr><w:b/><w:sz w:val="44"/></w:rPr><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
        xml_escape(title)
    )
}

fn heading_paragraph(heading: &str, level: i64) -> String {
    let size = match level {
        l if l <= 1 => 32,
        2 => 28,
        _ => 24,
    };
    format!(
        r#"<w:p><w:r><w:rPr><w:b/><w:sz w:val="{size}"/></w:rPr><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
        xml_escape(heading)
    )
}

fn text_paragraph(text: &str) -> String {
    format!(
        r#"<w:p><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
        xml_escape(text)
    )
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.trim().is_empty() {
        "投标项目".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    fn section(heading: &str, body: &str) -> GeneratedSection {
        GeneratedSection {
            heading: heading.to_string(),
            level: 1,
            body: body.to_string(),
        }
    }

    #[test]
    fn produced_archive_contains_the_document_part() {
        let bytes = build_docx("测试项目", &[section("第一章 投标函", "正文第一行\n正文第二行")])
            .unwrap();

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .unwrap()
            .read_to_string(&mut xml)
            .unwrap();

        assert!(xml.contains("测试项目"));
        assert!(xml.contains("第一章 投标函"));
        assert!(xml.contains("正文第二行"));
        assert!(archive.by_name("[Content_Types].xml").is_ok());
    }

    #[test]
    fn xml_content_is_escaped() {
        let xml = build_document_xml("A & B", &[section("H", "1 < 2")]);
        assert!(xml.contains("A &amp; B"));
        assert!(xml.contains("1 &lt; 2"));
    }

    #[test]
    fn image_markers_render_as_labeled_references() {
        assert_eq!(
            render_line("[[IMAGE|materials/cert.png|资质证书]]"),
            "【图片：资质证书】"
        );
        assert_eq!(render_line("普通一行"), "普通一行");
    }

    #[test]
    fn filenames_drop_path_separators() {
        assert_eq!(sanitize_filename("a/b:c"), "a_b_c");
        assert_eq!(sanitize_filename("  "), "投标项目");
    }
}
