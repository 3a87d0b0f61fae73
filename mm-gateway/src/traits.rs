use crate::error::{GatewayError, Result};
use crate::types::{Action, ActionReply, ChatEvent};
use async_trait::async_trait;
use std::sync::Arc;

/// Consumer of inbound chat events. Each handler runs in its own task per event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs: "ingest", "audit".
    fn name(&self) -> &str;

    async fn handle(&self, event: Arc<ChatEvent>) -> anyhow::Result<()>;
}

/// Synchronous request/response calls against the gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Send `action` and wait for its correlated reply, whatever its status.
    async fn call(&self, action: Action) -> Result<ActionReply>;

    /// Like `call`, but a non-ok reply is an error.
    async fn call_ok(&self, action: Action) -> Result<ActionReply> {
        let name = action.name();
        let reply = self.call(action).await?;
        if reply.is_ok() {
            return Ok(reply);
        }
        Err(GatewayError::Rejected {
            action: name,
            status: reply.status.clone(),
            retcode: reply.retcode,
            message: reply.error_message().to_string(),
        })
    }
}
