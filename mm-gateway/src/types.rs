use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const SEGMENT_TEXT: &str = "text";
pub const SEGMENT_IMAGE: &str = "image";
pub const SEGMENT_FORWARD: &str = "forward";
pub const SEGMENT_NODE: &str = "node";

/// Outbound gateway action. Serializes as `{"action": ..., "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    GetForwardMsg {
        message_id: String,
    },
    SendGroupMsg {
        group_id: String,
        message: Vec<Segment>,
    },
    SendPrivateMsg {
        user_id: String,
        message: Vec<Segment>,
    },
    SendForwardMsg {
        group_id: String,
        messages: Vec<Segment>,
        news: Vec<Value>,
        prompt: String,
        summary: String,
        source: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetForwardMsg { .. } => "get_forward_msg",
            Self::SendGroupMsg { .. } => "send_group_msg",
            Self::SendPrivateMsg { .. } => "send_private_msg",
            Self::SendForwardMsg { .. } => "send_forward_msg",
        }
    }

    pub fn group_text(group_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::SendGroupMsg {
            group_id: group_id.into(),
            message: vec![Segment::text(text)],
        }
    }

    pub fn private_text(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::SendPrivateMsg {
            user_id: user_id.into(),
            message: vec![Segment::text(text)],
        }
    }
}

/// Wire frame for an outbound action: the action plus its correlation echo.
#[derive(Debug, Serialize)]
pub(crate) struct ActionFrame<'a> {
    #[serde(flatten)]
    pub action: &'a Action,
    pub echo: &'a str,
}

/// Reply to an action, matched to its caller by `echo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
    pub echo: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub wording: Option<String>,
}

impl ActionReply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok" && self.retcode == 0
    }

    pub fn error_message(&self) -> &str {
        self.wording
            .as_deref()
            .or(self.message.as_deref())
            .filter(|m| !m.is_empty())
            .unwrap_or("no message")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Image,
    Forward,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub r#type: String,
    #[serde(default)]
    pub data: SegmentData,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            r#type: SEGMENT_TEXT.to_string(),
            data: SegmentData {
                text: Some(text.into()),
                ..SegmentData::default()
            },
        }
    }

    pub fn kind(&self) -> SegmentKind {
        match self.r#type.as_str() {
            SEGMENT_TEXT => SegmentKind::Text,
            SEGMENT_IMAGE => SegmentKind::Image,
            SEGMENT_FORWARD => SegmentKind::Forward,
            _ => SegmentKind::Other,
        }
    }

    /// Id of the nested conversation a forward segment points at.
    /// Gateways send it either as a string or as a number.
    pub fn forward_id(&self) -> Option<String> {
        match self.data.extra.get("id")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Unsolicited inbound event: chat message, notice, heartbeat or self echo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
    #[serde(default)]
    pub post_type: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default, deserialize_with = "deserialize_segments")]
    pub message: Vec<Segment>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_event_type: Option<String>,
}

impl ChatEvent {
    pub fn is_message(&self) -> bool {
        self.post_type == "message" || self.post_type == "message_sent"
    }

    pub fn is_heartbeat(&self) -> bool {
        self.meta_event_type.as_deref() == Some("heartbeat")
    }

    pub fn is_self_originated(&self) -> bool {
        self.self_id != 0 && self.sender.user_id == self.self_id
    }

    pub fn is_self_or_heartbeat(&self) -> bool {
        self.is_self_originated() || self.is_heartbeat()
    }

    pub fn display_name(&self) -> &str {
        match self.sender.card.as_deref() {
            Some(card) if !card.trim().is_empty() => card,
            _ => &self.sender.nickname,
        }
    }
}

/// Some gateways deliver `message` as a CQ-coded string instead of a segment array.
fn deserialize_segments<'de, D>(deserializer: D) -> Result<Vec<Segment>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Segments(Vec<Segment>),
        Text(String),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        Some(Repr::Segments(segments)) => segments,
        Some(Repr::Text(text)) if !text.is_empty() => vec![Segment::text(text)],
        Some(Repr::Text(_)) | None => Vec::new(),
    })
}

/// An inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply-shaped frame. `raw` is kept so an unmatched reply can still be
    /// routed as an event.
    Reply { reply: ActionReply, raw: Value },
    Event(ChatEvent),
}

/// Reply envelope first (string `echo` plus `status` or `retcode`), event otherwise.
pub fn decode_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let raw: Value = serde_json::from_str(text)?;
    if is_reply_shaped(&raw) {
        let reply = ActionReply::deserialize(&raw)?;
        return Ok(InboundFrame::Reply { reply, raw });
    }
    Ok(InboundFrame::Event(ChatEvent::deserialize(raw)?))
}

fn is_reply_shaped(raw: &Value) -> bool {
    let Some(obj) = raw.as_object() else {
        return false;
    };
    let has_echo = obj
        .get("echo")
        .and_then(Value::as_str)
        .is_some_and(|e| !e.is_empty());
    has_echo && (obj.contains_key("status") || obj.contains_key("retcode"))
}
