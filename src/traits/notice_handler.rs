use async_trait::async_trait;

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// Toast-style message produced by a user-triggered action
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub detail: Option<String>,
}

impl Notice {
    pub fn success(title: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Success, title: title.into(), detail: None }
    }

    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, title: title.into(), detail: Some(detail.into()) }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives notices for display
#[async_trait]
pub trait NoticeHandler: Send + Sync {
    async fn handle_notice(&self, notice: Notice);
}
