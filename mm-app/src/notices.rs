//! Chat notices sent through the gateway. Delivery failures are logged, never raised.

use mm_gateway::{Action, GatewayClient};
use std::sync::Arc;

const PREFIX: &str = "[memento]";

#[derive(Clone)]
pub struct Notifier {
    gateway: Arc<dyn GatewayClient>,
    inform_group: String,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn GatewayClient>, inform_group: impl Into<String>) -> Self {
        Self {
            gateway,
            inform_group: inform_group.into(),
        }
    }

    pub fn inform_group(&self) -> &str {
        &self.inform_group
    }

    pub fn gateway(&self) -> &Arc<dyn GatewayClient> {
        &self.gateway
    }

    /// Returns whether the gateway accepted the notice.
    #[tracing::instrument(level = "debug", skip_all, fields(group = %self.inform_group))]
    pub async fn group(&self, text: String) -> bool {
        match self
            .gateway
            .call_ok(Action::group_text(&self.inform_group, text))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%e, "group notice failed");
                false
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    pub async fn private(&self, user_id: &str, text: String) -> bool {
        if user_id.trim().is_empty() {
            tracing::debug!("no recipient configured; private notice skipped");
            return false;
        }
        match self
            .gateway
            .call_ok(Action::private_text(user_id.trim(), text))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%e, "private notice failed");
                false
            }
        }
    }
}

fn quoted_title(title: Option<&str>) -> String {
    match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => format!("\"{title}\""),
        None => "an untitled conversation".to_string(),
    }
}

pub fn new_title(sender: Option<&str>, title: &str, view_id: &str) -> String {
    let sender = sender.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("someone");
    format!("{PREFIX} {sender} archived a conversation titled \"{title}\" (id {view_id}).")
}

pub fn rename_started(requested_by: Option<&str>, current: Option<&str>) -> String {
    let who = requested_by
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("someone");
    format!("{PREFIX} {who} started renaming {}.", quoted_title(current))
}

pub fn title_busy(current: Option<&str>) -> String {
    format!(
        "{PREFIX} A title for {} is already being generated; try again later.",
        quoted_title(current)
    )
}

pub fn pushed(requested_by: &str, title: Option<&str>) -> String {
    format!("{PREFIX} {requested_by} pushed {} to you.", quoted_title(title))
}

pub fn store_unavailable(e: &dyn std::fmt::Display) -> String {
    format!("{PREFIX} Could not open the archive database: {e}")
}
