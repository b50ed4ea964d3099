use serde_json::Value;

use crate::models::{coerce_scalar, Chapter, KeyDate};

/// Shown when the model produced no usable summary. A cached record whose
/// summary equals this sentinel is not cache-valid.
pub const SUMMARY_PLACEHOLDER: &str = "暂无模型总结，请检查招标文件与模型输出。";

/// A mandatory outline skeleton: the required chapter-id set plus the full
/// fallback chapters. Adding a new document family means adding another
/// constructor here, not another normalization code path.
#[derive(Debug, Clone)]
pub struct OutlineTemplate {
    pub required_ids: Vec<&'static str>,
    pub chapters: Vec<Chapter>,
}

impl OutlineTemplate {
    /// The standard commercial/technical bid skeleton.
    pub fn commercial() -> Self {
        let chapter = |id: &str, title: &str, sections: &[&str]| Chapter {
            id: id.to_string(),
            title: title.to_string(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
        };

        Self {
            required_ids: vec!["1", "2.1", "2.2", "2.3", "2.4", "2.5"],
            chapters: vec![
                chapter(
                    "1",
                    "1. 投标函",
                    &[
                        "投标声明",
                        "法定代表人身份证明或授权委托书",
                        "{{material:bid_letter}}",
                    ],
                ),
                chapter(
                    "2.1",
                    "2.1 第一部分：投标方信息概述",
                    &[
                        "2.1.1 公司简介",
                        "2.1.2 公司资质证明",
                        "2.1.3 营业执照",
                        "2.1.4 财务和经营状况良好、近期无亏损声明",
                        "2.1.5 依法纳税人资格证明",
                        "2.1.6 其他必须具备的资质证明",
                        "{{material:company_intro}}",
                    ],
                ),
                chapter(
                    "2.2",
                    "2.2 第二部分：实施服务",
                    &[
                        "2.2.1 项目实施方案",
                        "2.2.2 服务资源配备-项目人员配置方案",
                        "2.2.3 项目管理方案",
                        "2.2.4 项目质量管控方案",
                        "2.2.5 明确出现问题的解决方案",
                        "2.2.6 近三年项目的成功案例（实施服务）",
                        "{{material:solution_detail}}",
                    ],
                ),
                chapter(
                    "2.3",
                    "2.3 第三部分：售后服务",
                    &[
                        "2.3.1 承诺的服务响应时间",
                        "2.3.2 有必要说明的其他内容（售后服务）",
                        "{{material:service_plan}}",
                    ],
                ),
                chapter(
                    "2.4",
                    "2.4 第四部分：商务相关",
                    &["2.4.1 报价表", "2.4.2 其他优惠条件", "{{material:pricing_form}}"],
                ),
                chapter(
                    "2.5",
                    "2.5 第五部分：评审材料",
                    &["2.5.1 条款/偏离表", "2.5.2 评分索引表", "{{material:deviation_form}}"],
                ),
            ],
        }
    }

    /// All-or-nothing template enforcement: the produced id set must be a
    /// superset of the required ids, otherwise the model's structure is
    /// discarded entirely so every export keeps the mandatory skeleton.
    pub fn enforce(&self, chapters: Vec<Chapter>) -> Vec<Chapter> {
        if chapters.is_empty() {
            return self.chapters.clone();
        }
        let ids: std::collections::HashSet<&str> =
            chapters.iter().map(|c| c.id.as_str()).collect();
        if self.required_ids.iter().all(|id| ids.contains(id)) {
            chapters
        } else {
            self.chapters.clone()
        }
    }
}

/// Convert the model's `documentStructure` field into chapters. The field
/// may be absent, a single object, or a list of heterogeneous entries.
pub fn normalize_structure(value: Option<&Value>) -> Vec<Chapter> {
    let entries: Vec<&Value> = match value {
        None | Some(Value::Null) => vec![],
        Some(obj @ Value::Object(_)) => vec![obj],
        Some(Value::Array(items)) => items.iter().collect(),
        Some(_) => vec![],
    };

    let mut chapters = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Object(map) => {
                let title = ["title", "heading", "id"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(coerce_scalar))
                    .unwrap_or_else(|| "章节".to_string());
                let sections_field = ["sections", "content", "details"]
                    .iter()
                    .find_map(|key| map.get(*key))
                    .cloned()
                    .unwrap_or(Value::Null);
                let id = map
                    .get("id")
                    .and_then(coerce_scalar)
                    .unwrap_or_else(|| title.clone());
                chapters.push(Chapter {
                    id,
                    title,
                    sections: normalize_sections(&sections_field),
                });
            }
            scalar => {
                if let Some(text) = coerce_scalar(scalar) {
                    chapters.push(Chapter {
                        id: text.clone(),
                        title: text,
                        sections: vec![],
                    });
                }
            }
        }
    }
    chapters
}

/// Flatten a sections value into bullet strings. Compound entries prefer
/// their content/details sub-list; everything else is stringified.
pub fn normalize_sections(value: &Value) -> Vec<String> {
    match value {
        Value::Null => vec![],
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    Value::Object(map) => {
                        let sub = ["content", "details"]
                            .iter()
                            .find_map(|key| map.get(*key).and_then(|v| v.as_array()));
                        if let Some(sub_items) = sub {
                            out.extend(sub_items.iter().filter_map(coerce_scalar));
                        } else if let Some(text) = coerce_scalar(item) {
                            out.push(text);
                        }
                    }
                    scalar => {
                        if let Some(text) = coerce_scalar(scalar) {
                            out.push(text);
                        }
                    }
                }
            }
            out
        }
        other => coerce_scalar(other).map(|s| vec![s]).unwrap_or_default(),
    }
}

/// Coerce the model's `summary` field, which may be a string, a list of
/// fragments, or a keyed object. Falls back to the placeholder sentinel.
pub fn coerce_summary(value: Option<&Value>) -> String {
    let text = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(coerce_scalar)
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| format!("{k}:{}", coerce_scalar(v).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if text.trim().is_empty() {
        SUMMARY_PLACEHOLDER.to_string()
    } else {
        text
    }
}

/// Coerce `keyDates` entries: label from label/name/title, date from
/// date/value/time; bare scalars become a label with an empty date. An empty
/// result gets the standard undetermined rows.
pub fn normalize_key_dates(value: Option<&Value>) -> Vec<KeyDate> {
    let mut out = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            match item {
                Value::Object(map) => {
                    let label = ["label", "name", "title"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(coerce_scalar))
                        .unwrap_or_else(|| "关键时间".to_string());
                    let date = ["date", "value", "time"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(coerce_scalar))
                        .unwrap_or_default();
                    out.push(KeyDate { label, date });
                }
                scalar => {
                    if let Some(label) = coerce_scalar(scalar) {
                        out.push(KeyDate {
                            label,
                            date: String::new(),
                        });
                    }
                }
            }
        }
    }

    if out.is_empty() {
        out = ["投标截止", "开标时间", "答疑截止"]
            .iter()
            .map(|label| KeyDate {
                label: label.to_string(),
                date: "待定".to_string(),
            })
            .collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> OutlineTemplate {
        OutlineTemplate::commercial()
    }

    #[test]
    fn canonical_structure_is_idempotent() {
        let tpl = template();
        let as_value = serde_json::to_value(&tpl.chapters).unwrap();
        let normalized = normalize_structure(Some(&as_value));
        let enforced = tpl.enforce(normalized);
        assert_eq!(enforced, tpl.chapters);

        // A second pass changes nothing.
        let again = tpl.enforce(normalize_structure(
            Some(&serde_json::to_value(&enforced).unwrap()),
        ));
        assert_eq!(again, enforced);
    }

    #[test]
    fn missing_required_id_replaces_wholesale() {
        let tpl = template();
        // Everything but "2.5"; partial merges must not happen.
        let partial: Vec<Chapter> = tpl
            .chapters
            .iter()
            .filter(|c| c.id != "2.5")
            .cloned()
            .collect();
        let enforced = tpl.enforce(partial);
        assert_eq!(enforced, tpl.chapters);
    }

    #[test]
    fn superset_structure_is_kept() {
        let tpl = template();
        let mut chapters = tpl.chapters.clone();
        chapters.push(Chapter {
            id: "3".to_string(),
            title: "3. 附件".to_string(),
            sections: vec!["附件清单".to_string()],
        });
        let enforced = tpl.enforce(chapters.clone());
        assert_eq!(enforced, chapters);
    }

    #[test]
    fn empty_structure_falls_back_to_template() {
        let tpl = template();
        assert_eq!(tpl.enforce(vec![]), tpl.chapters);
        assert_eq!(tpl.enforce(normalize_structure(None)), tpl.chapters);
    }

    #[test]
    fn heterogeneous_entries_are_normalized() {
        let value = json!([
            {"id": "1", "title": "1. 投标函", "sections": ["a", {"value": "b"}]},
            {"heading": "技术方案", "content": [{"content": ["x", "y"]}]},
            "纯字符串章节"
        ]);
        let chapters = normalize_structure(Some(&value));
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].sections, vec!["a", "b"]);
        assert_eq!(chapters[1].title, "技术方案");
        assert_eq!(chapters[1].id, "技术方案");
        assert_eq!(chapters[1].sections, vec!["x", "y"]);
        assert_eq!(chapters[2].id, "纯字符串章节");
        assert!(chapters[2].sections.is_empty());
    }

    #[test]
    fn single_object_structure_is_wrapped() {
        let value = json!({"id": "1", "title": "唯一章节", "sections": "单条要点"});
        let chapters = normalize_structure(Some(&value));
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].sections, vec!["单条要点"]);
    }

    #[test]
    fn summary_coercion_handles_shapes() {
        assert_eq!(coerce_summary(Some(&json!("  概述  "))), "概述");
        assert_eq!(coerce_summary(Some(&json!(["甲", "乙"]))), "甲 乙");
        let keyed = coerce_summary(Some(&json!({"范围": "运维"})));
        assert_eq!(keyed, "范围:运维");
        assert_eq!(coerce_summary(None), SUMMARY_PLACEHOLDER);
        assert_eq!(coerce_summary(Some(&json!(""))), SUMMARY_PLACEHOLDER);
    }

    #[test]
    fn key_dates_tolerate_field_aliases() {
        let value = json!([
            {"label": "投标截止", "date": "2025-01-01"},
            {"name": "开标时间", "value": "2025-01-05"},
            "踏勘时间"
        ]);
        let dates = normalize_key_dates(Some(&value));
        assert_eq!(dates[0].date, "2025-01-01");
        assert_eq!(dates[1].label, "开标时间");
        assert_eq!(dates[1].date, "2025-01-05");
        assert_eq!(dates[2].label, "踏勘时间");
        assert_eq!(dates[2].date, "");
    }

    #[test]
    fn empty_key_dates_get_default_rows() {
        let dates = normalize_key_dates(None);
        assert_eq!(dates.len(), 3);
        assert!(dates.iter().all(|d| d.date == "待定"));
    }
}
