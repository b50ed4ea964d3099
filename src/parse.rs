use serde_json::{Map, Value};

use crate::error::{PipelineError, PipelineResult};

const PREVIEW_LIMIT: usize = 800;

/// Extract the first JSON object from noisy model output.
///
/// Accepted shapes: plain JSON text, JSON wrapped in a ``` / ```json fence,
/// or JSON preceded/followed by explanatory prose. Trailing characters after
/// the matched object are ignored.
pub fn parse_llm_json(raw: &str) -> PipelineResult<Map<String, Value>> {
    let mut text = raw.trim();

    if text.starts_with("```") {
        text = strip_fences(text);
    }

    if let Some(start) = text.find('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Ok(map);
        }
    }

    // The whole string may still be valid JSON (e.g. leading '{' inside a
    // quoted prefix confused the incremental pass).
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Ok(map);
    }

    Err(PipelineError::Parse(preview(raw)))
}

/// Bounded preview of raw model output for log lines.
pub fn preview(raw: &str) -> String {
    if raw.chars().count() <= PREVIEW_LIMIT {
        return raw.to_string();
    }
    let cut: String = raw.chars().take(PREVIEW_LIMIT).collect();
    format!("{cut}...(truncated)")
}

fn strip_fences(text: &str) -> &str {
    let mut inner = text.trim_start_matches("```");
    // Tolerate a language tag on the opening fence, case-insensitive. The
    // slice must stay on a char boundary; fence tags can be multibyte.
    if inner
        .get(..4)
        .map_or(false, |tag| tag.eq_ignore_ascii_case("json"))
    {
        inner = &inner[4..];
    }
    inner = inner.trim();
    inner.trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_round_trips() {
        let parsed = parse_llm_json(r#"{"a": 1, "b": [2, 3]}"#).unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));
        assert_eq!(parsed.get("b"), Some(&json!([2, 3])));
    }

    #[test]
    fn fenced_block_is_unwrapped() {
        let parsed = parse_llm_json("```json\n{\"a\":1}\n```").unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));

        let parsed = parse_llm_json("```JSON\n{\"a\":1}\n```").unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));

        let parsed = parse_llm_json("```\n{\"a\":1}\n```").unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));
    }

    #[test]
    fn multibyte_fence_tag_is_tolerated() {
        let parsed = parse_llm_json("```格式\n{\"a\":1}\n```").unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));
    }

    #[test]
    fn leading_and_trailing_prose_is_tolerated() {
        let parsed = parse_llm_json("Here you go: {\"a\":1} thanks").unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));
    }

    #[test]
    fn nested_objects_survive_trailing_text() {
        let parsed =
            parse_llm_json("result: {\"outer\": {\"inner\": \"v\"}} -- done").unwrap();
        assert_eq!(parsed["outer"]["inner"], json!("v"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_llm_json("not json at all").unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    #[test]
    fn preview_is_bounded() {
        let long = "x".repeat(2_000);
        let p = preview(&long);
        assert!(p.ends_with("...(truncated)"));
        assert!(p.chars().count() < 900);
    }
}
