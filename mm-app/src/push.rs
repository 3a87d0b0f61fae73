//! Re-publishes an archived conversation to the inform group as a merged forward.

use crate::assets::sanitize_file_name;
use crate::notices::{self, Notifier};
use crate::records::{
    FORWARD_MESSAGES, FORWARD_VIEWS, MESSAGE_RECORD_FIELD, MESSAGE_RELATIONS, TITLE_FIELD,
    VIEW_RECORD_FIELD, string_field,
};
use crate::store::{DocumentStore, Filter};
use anyhow::{Context, anyhow};
use mm_gateway::{Action, ChatEvent, SEGMENT_NODE, Segment, SegmentData, SegmentKind};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const PUSH_PROMPT: &str = "memento push";
const DEFAULT_SOURCE: &str = "memento";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub title: Option<String>,
    pub messages: usize,
}

pub struct PushWorkflow {
    store: Arc<dyn DocumentStore>,
    notifier: Notifier,
    public_base_url: String,
}

impl PushWorkflow {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Notifier,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            notifier,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(view_id = %view_id, requested_by = %requested_by))]
    pub async fn push_view(&self, view_id: &str, requested_by: &str) -> anyhow::Result<PushReport> {
        let view = self
            .store
            .find_one(FORWARD_VIEWS, Filter::id(view_id))
            .await
            .with_context(|| format!("load view {view_id}"))?;
        let title = string_field(&view, TITLE_FIELD).map(str::to_string);

        let relation = self
            .store
            .find_one(MESSAGE_RELATIONS, Filter::field_eq(VIEW_RECORD_FIELD, view_id))
            .await
            .with_context(|| format!("load relation for view {view_id}"))?;
        let raw_id = string_field(&relation, MESSAGE_RECORD_FIELD)
            .ok_or_else(|| anyhow!("relation for view {view_id} has no message record"))?;
        let raw = self
            .store
            .find_one(FORWARD_MESSAGES, Filter::id(raw_id))
            .await
            .with_context(|| format!("load raw messages {raw_id}"))?;

        let events = raw
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("raw record {raw_id} has no messages"))?
            .iter()
            .map(|m| serde_json::from_value::<ChatEvent>(m.clone()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("decode raw messages {raw_id}"))?;
        let nodes: Vec<Segment> = events
            .iter()
            .map(|event| self.node_for(event))
            .collect();
        let messages = nodes.len();

        self.notifier
            .gateway()
            .call_ok(Action::SendForwardMsg {
                group_id: self.notifier.inform_group().to_string(),
                messages: nodes,
                news: Vec::new(),
                prompt: PUSH_PROMPT.to_string(),
                summary: format!("{messages} messages"),
                source: title.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            })
            .await
            .context("send_forward_msg")?;
        tracing::info!(messages, "view pushed");

        self.notifier
            .group(notices::pushed(requested_by, title.as_deref()))
            .await;
        Ok(PushReport { title, messages })
    }

    fn node_for(&self, event: &ChatEvent) -> Segment {
        let content: Vec<Segment> = event
            .message
            .iter()
            .map(|segment| self.rewrite_image(segment))
            .collect();
        let mut extra = Map::new();
        extra.insert("user_id".into(), json!(event.sender.user_id.to_string()));
        extra.insert("nickname".into(), json!(event.sender.nickname));
        extra.insert("content".into(), json!(content));
        Segment {
            r#type: SEGMENT_NODE.to_string(),
            data: SegmentData {
                extra,
                ..SegmentData::default()
            },
        }
    }

    /// Points image segments at this server's `/pic/` route.
    fn rewrite_image(&self, segment: &Segment) -> Segment {
        let mut segment = segment.clone();
        if segment.kind() != SegmentKind::Image {
            return segment;
        }
        if let Some(file) = segment.data.file.as_deref().and_then(sanitize_file_name) {
            segment.data.url = Some(format!("{}/pic/{file}", self.public_base_url));
        }
        segment
    }
}
