//! Inbound message ingestion: saves images and archives forwarded conversations.

use crate::assets::{AssetDir, AssetFetcher};
use crate::records::{
    self, FORWARD_MESSAGES, FORWARD_VIEWS, MESSAGE_RELATIONS, SENDER_FIELD, single_field,
};
use crate::store::DocumentStore;
use crate::titles::{TitleTrigger, TitleWorkflow};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use mm_gateway::{Action, ChatEvent, EventHandler, GatewayClient, Segment, SegmentKind};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const DEFAULT_MAX_FORWARD_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotMessage,
    SelfOriginated,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStatus {
    ImageSaved { file: String },
    ImageFailed { error: String },
    Archived { raw_id: String, view_id: String, messages: usize },
    ForwardFailed { error: String },
    DepthExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    /// 0 for the inbound event, +1 per forward level.
    pub depth: usize,
    pub index: usize,
    pub status: SegmentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub segments: Vec<SegmentReport>,
}

impl IngestReport {
    pub fn archived_views(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match &s.status {
                SegmentStatus::Archived { view_id, .. } => Some(view_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn saved_images(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s.status, SegmentStatus::ImageSaved { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SegmentStatus::ImageFailed { .. }
                        | SegmentStatus::ForwardFailed { .. }
                        | SegmentStatus::DepthExceeded
                )
            })
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Skipped(SkipReason),
    Done(IngestReport),
}

type ScanFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub struct IngestPipeline {
    gateway: Arc<dyn GatewayClient>,
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn AssetFetcher>,
    assets: AssetDir,
    titles: Arc<TitleWorkflow>,
    max_forward_depth: usize,
}

impl IngestPipeline {
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        store: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn AssetFetcher>,
        assets: AssetDir,
        titles: Arc<TitleWorkflow>,
    ) -> Self {
        Self {
            gateway,
            store,
            fetcher,
            assets,
            titles,
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
        }
    }

    pub fn with_max_forward_depth(mut self, depth: usize) -> Self {
        self.max_forward_depth = depth;
        self
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(message_id = ?event.message_id, user_id = event.sender.user_id)
    )]
    pub async fn ingest(&self, event: &ChatEvent) -> IngestOutcome {
        if event.is_heartbeat() {
            return IngestOutcome::Skipped(SkipReason::Heartbeat);
        }
        if event.is_self_originated() {
            return IngestOutcome::Skipped(SkipReason::SelfOriginated);
        }
        if !event.is_message() {
            return IngestOutcome::Skipped(SkipReason::NotMessage);
        }

        let mut report = IngestReport::default();
        self.scan(&event.message, &event.sender.nickname, 0, &mut report)
            .await;
        IngestOutcome::Done(report)
    }

    fn scan<'a>(
        &'a self,
        segments: &'a [Segment],
        sender: &'a str,
        depth: usize,
        report: &'a mut IngestReport,
    ) -> ScanFuture<'a> {
        Box::pin(async move {
            for (index, segment) in segments.iter().enumerate() {
                let status = match segment.kind() {
                    SegmentKind::Image => self.save_image(segment).await,
                    SegmentKind::Forward => {
                        self.archive_forward(segment, sender, depth, report).await
                    }
                    SegmentKind::Text | SegmentKind::Other => continue,
                };
                report.segments.push(SegmentReport {
                    depth,
                    index,
                    status,
                });
            }
        })
    }

    async fn save_image(&self, segment: &Segment) -> SegmentStatus {
        match self.try_save_image(segment).await {
            Ok(file) => {
                tracing::debug!(file = %file, "image saved");
                SegmentStatus::ImageSaved { file }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "image not saved");
                SegmentStatus::ImageFailed {
                    error: format!("{e:#}"),
                }
            }
        }
    }

    async fn try_save_image(&self, segment: &Segment) -> anyhow::Result<String> {
        let url = segment
            .data
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("image segment has no url"))?;
        let file = segment
            .data
            .file
            .as_deref()
            .ok_or_else(|| anyhow!("image segment has no file name"))?;
        let bytes = self.fetcher.fetch(url).await?;
        self.assets.save(file, &bytes).await
    }

    async fn archive_forward(
        &self,
        segment: &Segment,
        sender: &str,
        depth: usize,
        report: &mut IngestReport,
    ) -> SegmentStatus {
        if depth >= self.max_forward_depth {
            tracing::warn!(depth, max = self.max_forward_depth, "forward nesting too deep; not resolved");
            return SegmentStatus::DepthExceeded;
        }
        match self.try_archive_forward(segment, sender, depth, report).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), depth, "forward not archived");
                SegmentStatus::ForwardFailed {
                    error: format!("{e:#}"),
                }
            }
        }
    }

    async fn try_archive_forward(
        &self,
        segment: &Segment,
        sender: &str,
        depth: usize,
        report: &mut IngestReport,
    ) -> anyhow::Result<SegmentStatus> {
        let forward_id = segment
            .forward_id()
            .ok_or_else(|| anyhow!("forward segment has no id"))?;
        let reply = self
            .gateway
            .call_ok(Action::GetForwardMsg {
                message_id: forward_id.clone(),
            })
            .await
            .with_context(|| format!("get_forward_msg {forward_id}"))?;
        let raw_messages = reply
            .data
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| anyhow!("forward {forward_id} reply carries no messages"))?;
        let nested = raw_messages
            .iter()
            .map(|m| serde_json::from_value::<ChatEvent>(m.clone()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("decode forward {forward_id} messages"))?;

        for message in nested.iter().filter(|m| !m.is_self_or_heartbeat()) {
            self.scan(&message.message, sender, depth + 1, report).await;
        }

        let lines: Vec<_> = nested.iter().map(records::project).collect();
        let raw_id = self
            .store
            .insert(FORWARD_MESSAGES, records::raw_record(&raw_messages))
            .await
            .context("insert raw messages")?;
        let view_id = match self
            .store
            .insert(FORWARD_VIEWS, records::view_record(&lines))
            .await
        {
            Ok(view_id) => view_id,
            Err(e) => {
                tracing::error!(%e, forward_id = %forward_id, raw_id = %raw_id, "view insert failed; raw messages left without a view");
                return Err(anyhow::Error::new(e).context(format!("insert view for raw {raw_id}")));
            }
        };
        self.store
            .update_fields(FORWARD_VIEWS, &view_id, single_field(SENDER_FIELD, sender))
            .await
            .context("set view sender")?;
        if let Err(e) = self
            .store
            .insert(MESSAGE_RELATIONS, records::relation_record(&raw_id, &view_id))
            .await
        {
            tracing::error!(%e, raw_id = %raw_id, view_id = %view_id, "relation insert failed; view is not linked to its raw messages");
            return Err(anyhow::Error::new(e).context(format!("link raw {raw_id} to view {view_id}")));
        }
        tracing::info!(
            forward_id = %forward_id,
            raw_id = %raw_id,
            view_id = %view_id,
            messages = lines.len(),
            "forward archived"
        );

        let titles = self.titles.clone();
        let spawned_view = view_id.clone();
        tokio::spawn(async move {
            if let Err(e) = titles
                .request_title(&spawned_view, TitleTrigger::Ingest)
                .await
            {
                tracing::warn!(error = %format!("{e:#}"), view_id = %spawned_view, "title generation failed");
            }
        });

        Ok(SegmentStatus::Archived {
            raw_id,
            view_id,
            messages: lines.len(),
        })
    }
}

#[async_trait]
impl EventHandler for IngestPipeline {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn handle(&self, event: Arc<ChatEvent>) -> anyhow::Result<()> {
        match self.ingest(&event).await {
            IngestOutcome::Skipped(reason) => {
                tracing::trace!(?reason, "event skipped");
            }
            IngestOutcome::Done(report) if report.segments.is_empty() => {}
            IngestOutcome::Done(report) => {
                tracing::info!(
                    views = report.archived_views().len(),
                    images = report.saved_images(),
                    failures = report.failures(),
                    "message ingested"
                );
            }
        }
        Ok(())
    }
}
