use crate::db::Database;
use crate::error::PipelineResult;
use crate::ingest::parse_file_bytes;
use crate::models::{GeneratedSection, Material, MaterialKind};
use crate::storage::BlobStore;

/// Resolves `{{namespace:key}}` tokens in generated prose against the
/// project's material bindings. Unbound tokens are left in place; a token the
/// engine does not know is never an error.
pub struct PlaceholderEngine {
    // Binding order; substitution must be deterministic even when one
    // replacement's text contains another binding's token.
    replacements: Vec<(String, String)>,
}

impl PlaceholderEngine {
    /// Resolve every binding of a project up front. Non-image materials are
    /// parsed to text on demand from their stored bytes.
    pub async fn for_project(
        db: &Database,
        storage: &BlobStore,
        project_id: i64,
        chunk_max_tokens: usize,
    ) -> PipelineResult<Self> {
        let bindings = db.bindings_for_project(project_id).await?;

        let mut replacements = Vec::new();
        for binding in bindings {
            let Some(material) = db.get_material(binding.material_id).await? else {
                tracing::warn!(
                    "binding points at missing material | binding_id={} material_id={}",
                    binding.id,
                    binding.material_id
                );
                continue;
            };
            let replacement = resolve_material(storage, &material, chunk_max_tokens).await;
            for token in token_variants(&binding.placeholder_key) {
                replacements.push((token, replacement.clone()));
            }
        }

        Ok(Self { replacements })
    }

    #[cfg(test)]
    fn from_bindings(bindings: Vec<(String, String)>) -> Self {
        let mut replacements = Vec::new();
        for (key, replacement) in bindings {
            for token in token_variants(&key) {
                replacements.push((token, replacement.clone()));
            }
        }
        Self { replacements }
    }

    /// Substitute tokens in binding order, so output stays the same run to
    /// run even when a replacement introduces another binding's token.
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, replacement) in &self.replacements {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), replacement);
            }
        }
        out
    }

    /// Substitute in both headings and bodies, preserving section order.
    pub fn apply_sections(&self, sections: &[GeneratedSection]) -> Vec<GeneratedSection> {
        sections
            .iter()
            .map(|section| GeneratedSection {
                heading: self.apply(&section.heading),
                level: section.level,
                body: self.apply(&section.body),
            })
            .collect()
    }
}

/// Every literal token form a binding key answers to: the fully-qualified
/// key, the short key after the namespace, each with and without padding
/// inside the braces.
fn token_variants(placeholder_key: &str) -> Vec<String> {
    let mut keys = vec![placeholder_key.to_string()];
    if let Some((_, short)) = placeholder_key.split_once(':') {
        if !short.is_empty() {
            keys.push(short.to_string());
        }
    }

    let mut tokens = Vec::new();
    for key in keys {
        tokens.push(format!("{{{{{key}}}}}"));
        tokens.push(format!("{{{{ {key} }}}}"));
    }
    tokens
}

/// The text a bound material contributes. Images stay as inline markers for
/// the renderer; documents contribute their parsed text, falling back to a
/// name-and-link reference when nothing parseable is stored.
async fn resolve_material(
    storage: &BlobStore,
    material: &Material,
    chunk_max_tokens: usize,
) -> String {
    if material.kind == MaterialKind::Image {
        return format!("[[IMAGE|{}|{}]]", material.url, material.name);
    }

    if let Ok(bytes) = storage.get(&material.url).await {
        match parse_file_bytes(&material.name, &bytes, chunk_max_tokens) {
            Ok(chunks) if !chunks.is_empty() => return chunks.join("\n"),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("material parse failed | id={} err={err:#}", material.id);
            }
        }
    }

    if material.url.is_empty() {
        material.name.clone()
    } else {
        format!("{}（{}）", material.name, material.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_short_keys_resolve_identically() {
        let engine = PlaceholderEngine::from_bindings(vec![(
            "material:company_intro".to_string(),
            "公司简介正文".to_string(),
        )]);

        assert_eq!(
            engine.apply("前言 {{material:company_intro}} 后记"),
            "前言 公司简介正文 后记"
        );
        assert_eq!(
            engine.apply("前言 {{company_intro}} 后记"),
            "前言 公司简介正文 后记"
        );
        assert_eq!(
            engine.apply("{{ material:company_intro }}"),
            "公司简介正文"
        );
    }

    #[test]
    fn unbound_tokens_are_left_untouched() {
        let engine = PlaceholderEngine::from_bindings(vec![(
            "material:company_intro".to_string(),
            "text".to_string(),
        )]);
        assert_eq!(
            engine.apply("见 {{material:unknown}}"),
            "见 {{material:unknown}}"
        );
    }

    #[test]
    fn chained_replacements_follow_binding_order() {
        // A replacement that itself carries a later binding's token must
        // resolve the same way every run.
        let engine = PlaceholderEngine::from_bindings(vec![
            (
                "material:solution_detail".to_string(),
                "方案正文，详见 {{material:pricing_form}}".to_string(),
            ),
            ("material:pricing_form".to_string(), "报价表正文".to_string()),
        ]);

        for _ in 0..8 {
            assert_eq!(
                engine.apply("{{solution_detail}}"),
                "方案正文，详见 报价表正文"
            );
        }
    }

    #[test]
    fn namespaceless_keys_only_match_themselves() {
        let engine =
            PlaceholderEngine::from_bindings(vec![("logo".to_string(), "替换".to_string())]);
        assert_eq!(engine.apply("{{logo}}"), "替换");
        assert_eq!(engine.apply("{{material:logo}}"), "{{material:logo}}");
    }

    #[test]
    fn sections_substitute_headings_and_bodies() {
        let engine = PlaceholderEngine::from_bindings(vec![(
            "material:bid_letter".to_string(),
            "投标函全文".to_string(),
        )]);
        let sections = vec![GeneratedSection {
            heading: "第一章 {{bid_letter}}".to_string(),
            level: 1,
            body: "正文 {{material:bid_letter}}".to_string(),
        }];

        let out = engine.apply_sections(&sections);
        assert_eq!(out[0].heading, "第一章 投标函全文");
        assert_eq!(out[0].body, "正文 投标函全文");
    }

    #[tokio::test]
    async fn image_material_becomes_inline_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlobStore::new(dir.path().to_path_buf());
        let material = Material {
            id: 1,
            kind: MaterialKind::Image,
            name: "资质证书".to_string(),
            size: 10,
            url: "materials/cert.png".to_string(),
            uploaded_at: chrono::Utc::now(),
        };

        let replacement = resolve_material(&storage, &material, 800).await;
        assert_eq!(replacement, "[[IMAGE|materials/cert.png|资质证书]]");
    }

    #[tokio::test]
    async fn document_material_falls_back_to_name_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlobStore::new(dir.path().to_path_buf());
        let material = Material {
            id: 2,
            kind: MaterialKind::Word,
            name: "公司简介".to_string(),
            size: 0,
            url: "materials/intro.docx".to_string(),
            uploaded_at: chrono::Utc::now(),
        };

        // Nothing stored under the object name: fall back to the reference.
        let replacement = resolve_material(&storage, &material, 800).await;
        assert_eq!(replacement, "公司简介（materials/intro.docx）");
    }

    #[tokio::test]
    async fn document_material_uses_parsed_text_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlobStore::new(dir.path().to_path_buf());
        storage
            .put("materials/plan.txt", "服务方案 第一节".as_bytes())
            .await
            .unwrap();
        let material = Material {
            id: 3,
            kind: MaterialKind::Other,
            name: "plan.txt".to_string(),
            size: 10,
            url: "materials/plan.txt".to_string(),
            uploaded_at: chrono::Utc::now(),
        };

        let replacement = resolve_material(&storage, &material, 800).await;
        assert_eq!(replacement, "服务方案 第一节");
    }
}
