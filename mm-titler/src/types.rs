use serde::{Deserialize, Serialize};

/// Body returned by the title service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One line of an archived conversation, as stored in a view record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    #[serde(default)]
    pub time: i64,
    #[serde(default, rename = "messagetype")]
    pub message_type: String,
    #[serde(default)]
    pub sender: TranscriptSender,
    #[serde(default, rename = "rawmessage")]
    pub raw_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSender {
    #[serde(default, rename = "userid")]
    pub user_id: i64,
    #[serde(default)]
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
}

/// Speaker/utterance pair fed to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueTurn {
    pub role: String,
    pub content: String,
}

/// Image-only and expired lines carry nothing a title could use.
pub fn dialogue_from(lines: &[TranscriptLine]) -> Vec<DialogueTurn> {
    lines
        .iter()
        .filter(|line| {
            let raw = line.raw_message.trim();
            !raw.is_empty() && !raw.starts_with("[CQ:image") && !is_expired(raw)
        })
        .map(|line| DialogueTurn {
            role: line.sender.nickname.clone(),
            content: line.raw_message.clone(),
        })
        .collect()
}

fn is_expired(raw: &str) -> bool {
    raw.contains("已过期") || raw.to_ascii_lowercase().contains("expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transcript_lines_read_archived_keys() {
        let line: TranscriptLine = serde_json::from_value(json!({
            "time": 1700000000,
            "messagetype": "group",
            "sender": { "userid": 7, "nickname": "bob", "card": "" },
            "rawmessage": "lunch?"
        }))
        .expect("decode line");
        assert_eq!(line.sender.nickname, "bob");
        assert_eq!(line.raw_message, "lunch?");
        assert_eq!(line.message_type, "group");
    }

    #[test]
    fn dialogue_drops_image_only_and_expired_lines() {
        let line = |nick: &str, raw: &str| TranscriptLine {
            sender: TranscriptSender {
                nickname: nick.to_string(),
                ..TranscriptSender::default()
            },
            raw_message: raw.to_string(),
            ..TranscriptLine::default()
        };
        let lines = vec![
            line("a", "[CQ:image,file=abc.png]"),
            line("b", "the file has expired"),
            line("c", "   "),
            line("d", "grapes in the microwave"),
        ];
        let dialogue = dialogue_from(&lines);
        assert_eq!(
            dialogue,
            vec![DialogueTurn {
                role: "d".to_string(),
                content: "grapes in the microwave".to_string(),
            }]
        );
    }
}
