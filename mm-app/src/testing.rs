//! In-memory collaborators shared by unit tests.

use crate::assets::AssetFetcher;
use async_trait::async_trait;
use bytes::Bytes;
use mm_gateway::{Action, ActionReply, GatewayClient, GatewayError, Segment};
use mm_titler::{Summarizer, TitleError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

fn ok_reply(data: Value) -> ActionReply {
    ActionReply {
        status: "ok".to_string(),
        retcode: 0,
        data,
        echo: "test".to_string(),
        message: None,
        wording: None,
    }
}

/// Records every action; answers `get_forward_msg` from a scripted table.
#[derive(Default)]
pub struct FakeGateway {
    sent: Mutex<Vec<Action>>,
    forwards: Mutex<HashMap<String, Vec<Value>>>,
    fail_sends: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_forward(&self, message_id: &str, messages: Vec<Value>) {
        self.forwards
            .lock()
            .expect("forwards lock")
            .insert(message_id.to_string(), messages);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Action> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn group_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|a| match a {
                Action::SendGroupMsg { message, .. } => Some(joined_text(&message)),
                _ => None,
            })
            .collect()
    }

    pub fn private_texts(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|a| match a {
                Action::SendPrivateMsg { user_id, message } => {
                    Some((user_id, joined_text(&message)))
                }
                _ => None,
            })
            .collect()
    }

    pub fn forward_lookups(&self) -> usize {
        self.sent()
            .iter()
            .filter(|a| matches!(a, Action::GetForwardMsg { .. }))
            .count()
    }
}

fn joined_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|s| s.data.text.clone())
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn call(&self, action: Action) -> mm_gateway::Result<ActionReply> {
        self.sent.lock().expect("sent lock").push(action.clone());
        match action {
            Action::GetForwardMsg { message_id } => {
                let scripted = self
                    .forwards
                    .lock()
                    .expect("forwards lock")
                    .get(&message_id)
                    .cloned();
                Ok(match scripted {
                    Some(messages) => ok_reply(json!({ "messages": messages })),
                    None => ActionReply {
                        status: "failed".to_string(),
                        retcode: 1200,
                        data: Value::Null,
                        echo: "test".to_string(),
                        message: None,
                        wording: Some("forward expired".to_string()),
                    },
                })
            }
            _ if self.fail_sends.load(Ordering::SeqCst) => Err(GatewayError::Closed),
            _ => Ok(ok_reply(json!({ "message_id": 1 }))),
        }
    }
}

/// Returns a fixed title; optionally parks each call until released.
pub struct FakeSummarizer {
    calls: AtomicUsize,
    result: Mutex<Result<String, String>>,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
}

impl FakeSummarizer {
    pub fn titled(title: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: Mutex::new(Ok(title.to_string())),
            gate: None,
            entered: Arc::new(Notify::new()),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: Mutex::new(Err(error.to_string())),
            gate: None,
            entered: Arc::new(Notify::new()),
        })
    }

    /// Each call signals `entered()` and then waits for `gate.notify_one()`.
    pub fn gated(title: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: Mutex::new(Ok(title.to_string())),
            gate: Some(gate),
            entered: Arc::new(Notify::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn entered(&self) -> Arc<Notify> {
        self.entered.clone()
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, _view: &Value) -> mm_titler::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result
            .lock()
            .expect("result lock")
            .clone()
            .map_err(TitleError::Rejected)
    }
}

/// Serves bytes for known urls; everything else is unreachable.
#[derive(Default)]
pub struct FakeFetcher {
    assets: Mutex<HashMap<String, Bytes>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: &'static [u8]) {
        self.assets
            .lock()
            .expect("assets lock")
            .insert(url.to_string(), Bytes::from_static(body));
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Bytes> {
        self.assets
            .lock()
            .expect("assets lock")
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused: {url}"))
    }
}

/// Gateway-shaped chat message JSON.
pub fn message_json(user_id: i64, nickname: &str, segments: Value, raw: &str) -> Value {
    json!({
        "time": 1700000000,
        "message_type": "group",
        "sender": { "user_id": user_id, "nickname": nickname },
        "message": segments,
        "raw_message": raw,
    })
}
