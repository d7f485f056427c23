use async_trait::async_trait;
use tracing::{error, info};

use crate::models::keys::Topic;
use crate::store::keyed_store::KeyedStore;
use crate::store::registry::Subscription;
use crate::traits::notice_handler::{Notice, NoticeHandler, NoticeLevel};
use crate::utils::helper::truncate_string;

const MAX_DETAIL_LEN: usize = 160;

/// Console logging notice handler
pub struct ConsoleNoticeHandler;

impl ConsoleNoticeHandler {
    /// Create a new console notice handler
    pub fn new() -> Self {
        Self
    }

    fn render(notice: &Notice) -> String {
        let marker = match notice.level {
            NoticeLevel::Success => "✓",
            NoticeLevel::Info => "i",
            NoticeLevel::Error => "✗",
        };
        match &notice.detail {
            Some(detail) => format!("{marker} {}: {}", notice.title, truncate_string(detail, MAX_DETAIL_LEN)),
            None => format!("{marker} {}", notice.title),
        }
    }
}

impl Default for ConsoleNoticeHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoticeHandler for ConsoleNoticeHandler {
    async fn handle_notice(&self, notice: Notice) {
        let line = Self::render(&notice);
        match notice.level {
            NoticeLevel::Error => error!("{}", line),
            _ => info!("{}", line),
        }
    }
}

/// Log every committed change (local or remote) on the wildcard topic.
/// The returned subscription must be held for as long as logging is wanted.
pub fn log_state_changes(store: &KeyedStore) -> Subscription {
    store.subscribe(Topic::Any, |change| {
        info!(
            key = %change.key,
            revision = change.revision,
            origin = ?change.origin,
            "state changed"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_detail_when_present() {
        let notice = Notice::error("Price refresh failed", "timeout");
        assert_eq!(ConsoleNoticeHandler::render(&notice), "✗ Price refresh failed: timeout");
        assert_eq!(ConsoleNoticeHandler::render(&Notice::success("Saved")), "✓ Saved");
    }

    #[test]
    fn long_details_are_cut() {
        let line = ConsoleNoticeHandler::render(&Notice::error("Save failed", "x".repeat(500)));
        assert!(line.ends_with("..."));
        assert!(line.len() < 200);
    }

    #[test]
    fn change_logger_listens_on_wildcard() {
        let store = KeyedStore::new();
        let subscription = log_state_changes(&store);
        assert_eq!(store.registry().listener_count(Topic::Any), 1);
        drop(subscription);
        assert_eq!(store.registry().listener_count(Topic::Any), 0);
    }
}
