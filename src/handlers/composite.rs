use std::sync::Arc;
use async_trait::async_trait;

use crate::traits::notice_handler::{Notice, NoticeHandler};

/// Composite notice handler that fans out to multiple handlers
pub struct CompositeNoticeHandler {
    handlers: Vec<Arc<dyn NoticeHandler>>,
}

impl CompositeNoticeHandler {
    /// Create a new composite notice handler
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Add a handler to the composite
    pub fn add_handler(&mut self, handler: Arc<dyn NoticeHandler>) {
        self.handlers.push(handler);
    }

    /// Check if there are any handlers
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for CompositeNoticeHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoticeHandler for CompositeNoticeHandler {
    async fn handle_notice(&self, notice: Notice) {
        for handler in &self.handlers {
            handler.handle_notice(notice.clone()).await;
        }
    }
}
