use crate::traits::EventHandler;
use crate::types::ChatEvent;
use std::sync::{Arc, PoisonError, RwLock};

/// Fans inbound events out to registered handlers without blocking the caller.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        tracing::info!(handler = handler.name(), "event handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawns one task per handler and returns the number spawned. Must be
    /// called from within a tokio runtime.
    pub fn dispatch(&self, event: ChatEvent) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            tracing::debug!(post_type = %event.post_type, "no handlers registered; event dropped");
            return 0;
        }

        let event = Arc::new(event);
        for handler in &handlers {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(event).await {
                    tracing::warn!(%e, handler = handler.name(), "event handler failed");
                }
            });
        }
        handlers.len()
    }
}
