//! Archived document shapes and collection names.

use chrono::Utc;
use mm_gateway::ChatEvent;
use mm_titler::{TranscriptLine, TranscriptSender};
use serde::Serialize;
use serde_json::{Map, Value, json};

pub const FORWARD_MESSAGES: &str = "forward_messages";
pub const FORWARD_VIEWS: &str = "forward_views";
pub const MESSAGE_RELATIONS: &str = "message_relations";

pub const TITLE_FIELD: &str = "title";
pub const SENDER_FIELD: &str = "sender";
pub const VIEW_RECORD_FIELD: &str = "view_record";
pub const MESSAGE_RECORD_FIELD: &str = "message_record";

/// Display projection of one message inside a view record.
pub fn project(event: &ChatEvent) -> TranscriptLine {
    TranscriptLine {
        time: event.time,
        message_type: event.message_type.clone(),
        sender: TranscriptSender {
            user_id: event.sender.user_id,
            nickname: event.sender.nickname.clone(),
            card: event.sender.card.clone(),
        },
        raw_message: event.raw_message.clone(),
    }
}

/// Raw messages exactly as the gateway returned them.
pub fn raw_record(messages: &[Value]) -> Value {
    json!({
        "messages": messages,
        "count": messages.len(),
    })
}

pub fn view_record(lines: &[TranscriptLine]) -> Value {
    json!({
        "messages": lines,
        "count": lines.len(),
    })
}

pub fn relation_record(message_record: &str, view_record: &str) -> Value {
    json!({
        MESSAGE_RECORD_FIELD: message_record,
        VIEW_RECORD_FIELD: view_record,
        "created_at": Utc::now().to_rfc3339(),
    })
}

pub fn single_field(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(key.to_string(), value.into());
    fields
}

/// Non-empty string field of a stored document.
pub fn string_field<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn doc_id(doc: &Value) -> Option<&str> {
    string_field(doc, crate::store::ID_FIELD)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub title: String,
}

/// Id and title per view, in storage order. Untitled views are named by position.
pub fn list_entries(views: &[Value]) -> Vec<ListEntry> {
    views
        .iter()
        .enumerate()
        .filter_map(|(i, view)| {
            let id = doc_id(view)?;
            let title = string_field(view, TITLE_FIELD)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Chat {}", i + 1));
            Some(ListEntry {
                id: id.to_string(),
                title,
            })
        })
        .collect()
}
