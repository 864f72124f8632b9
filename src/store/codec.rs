//! Conversion between API-edge values and the text properties the graph stores.
//!
//! Note content is a structured value everywhere above the store and JSON text inside it.
//! Older nodes may hold a bare text blob; those decode as content with only `text` set.

use serde_json::Value;

use crate::models::NoteContent;

pub fn encode_content(content: &NoteContent) -> String {
    serde_json::to_string(content).unwrap_or_else(|_| content.text.clone())
}

pub fn decode_content(raw: &str) -> NoteContent {
    if raw.trim_start().starts_with('{') {
        if let Ok(content) = serde_json::from_str::<NoteContent>(raw) {
            return content;
        }
    }
    NoteContent::from_text(raw)
}

pub fn encode_template(template: &Value) -> String {
    match template {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn decode_template(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
