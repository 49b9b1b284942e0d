//! Extracts the Chinese/English prompt pair from free-form model output.
//!
//! Tried in order: a JSON object, then `中文：` / `英文：` labelled lines. When
//! neither yields both languages, the raw text is used for both fields and
//! the result is marked as not succeeded.

use serde_json::{Map, Value};

const CHINESE_KEYS: &[&str] = &["中文提示词", "中文", "chinese", "zh", "caption_chinese"];
const ENGLISH_KEYS: &[&str] = &["英文提示词", "英文", "english", "en", "caption_english"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFormat {
    Json,
    Labelled,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    pub chinese: String,
    pub english: String,
    pub raw: String,
    pub succeeded: bool,
    pub format: ParseFormat,
}

impl ParseResult {
    fn parsed(chinese: String, english: String, raw: &str, format: ParseFormat) -> Self {
        Self {
            chinese,
            english,
            raw: raw.to_string(),
            succeeded: true,
            format,
        }
    }

    fn fallback(raw: &str) -> Self {
        let text = raw.trim().to_string();
        Self {
            chinese: text.clone(),
            english: text,
            raw: raw.to_string(),
            succeeded: false,
            format: ParseFormat::Raw,
        }
    }
}

pub fn parse_caption(raw: &str) -> ParseResult {
    if let Some((zh, en)) = parse_json(raw) {
        return ParseResult::parsed(zh, en, raw, ParseFormat::Json);
    }
    if let Some((zh, en)) = parse_labelled(raw) {
        return ParseResult::parsed(zh, en, raw, ParseFormat::Labelled);
    }
    tracing::warn!("无法解析模型回答，使用原始文本: {}", raw);
    ParseResult::fallback(raw)
}

fn parse_json(raw: &str) -> Option<(String, String)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &raw[start..=end];

    let object = match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => map,
        // models often answer with python-style single quotes
        _ => match serde_json::from_str::<Value>(&candidate.replace('\'', "\"")) {
            Ok(Value::Object(map)) => map,
            _ => return None,
        },
    };

    let zh = lookup(&object, CHINESE_KEYS)?;
    let en = lookup(&object, ENGLISH_KEYS)?;
    Some((zh, en))
}

fn lookup(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let text = match object.get(*key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

fn parse_labelled(raw: &str) -> Option<(String, String)> {
    let zh = labelled_section(raw, &["中文", "Chinese"])?;
    let en = labelled_section(raw, &["英文", "English"])?;
    Some((zh, en))
}

/// Text following `label：` (or `label:`) up to the next language label.
fn labelled_section(raw: &str, labels: &[&str]) -> Option<String> {
    let (pos, marker_len) = labels
        .iter()
        .flat_map(|label| [format!("{}：", label), format!("{}:", label)])
        .filter_map(|marker| raw.find(&marker).map(|pos| (pos, marker.len())))
        .min_by_key(|(pos, _)| *pos)?;

    let rest = &raw[pos + marker_len..];
    let end = ["中文：", "中文:", "英文：", "英文:", "Chinese:", "English:"]
        .iter()
        .filter_map(|next| rest.find(next))
        .min()
        .unwrap_or(rest.len());

    let text = rest[..end].trim().trim_matches(|c: char| c == '[' || c == ']').trim();
    (!text.is_empty()).then(|| text.to_string())
}
