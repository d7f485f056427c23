// src/notifications/mod.rs
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

use crate::traits::notice_handler::{Notice, NoticeHandler};

enum QueueMessage {
    Notice(Notice),
    Shutdown,
}

/// Hands notices to a handler on a dedicated task so producers never wait on display
#[derive(Clone)]
pub struct NoticeQueue {
    sender: UnboundedSender<QueueMessage>,
}

impl NoticeQueue {
    /// Create the queue and spawn its processing task
    pub fn new(handler: Arc<dyn NoticeHandler>) -> Self {
        let (sender, receiver) = unbounded_channel();
        tokio::spawn(Self::process_notices(receiver, handler));
        Self { sender }
    }

    async fn process_notices(mut receiver: UnboundedReceiver<QueueMessage>, handler: Arc<dyn NoticeHandler>) {
        while let Some(message) = receiver.recv().await {
            match message {
                QueueMessage::Notice(notice) => handler.handle_notice(notice).await,
                QueueMessage::Shutdown => {
                    debug!("notice processor shutting down");
                    break;
                }
            }
        }
    }

    /// Queue a notice (non-blocking)
    pub fn notify(&self, notice: Notice) {
        if self.sender.send(QueueMessage::Notice(notice)).is_err() {
            error!("failed to queue notice: processor stopped");
        }
    }

    /// Stop the processor after notices already queued
    pub fn shutdown(&self) {
        let _ = self.sender.send(QueueMessage::Shutdown);
    }
}
