use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use flowgate_core::domain::instance::Priority;
use flowgate_db::DbPool;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// An in-app notification row addressed to one user.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub category: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub action_url: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        category: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            category: category.into(),
            title: title.into(),
            message: message.into(),
            priority: Priority::Medium,
            action_url: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action_url(mut self, action_url: impl Into<String>) -> Self {
        self.action_url = Some(action_url.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[async_trait::async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Persists notifications as unread rows for the in-app inbox.
pub struct SqlNotificationDispatcher {
    pool: DbPool,
}

impl SqlNotificationDispatcher {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for SqlNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotifyError> {
        let data_json = notification.data.to_string();
        sqlx::query(
            "INSERT INTO notification (id, user_id, category, title, message, priority,
                 action_url, data_json, read, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.category)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.priority.as_str())
        .bind(&notification.action_url)
        .bind(&data_json)
        .bind(notification.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Test double that records dispatched notifications and can be told to fail.
#[derive(Default)]
pub struct InMemoryNotificationDispatcher {
    sent: Mutex<Vec<Notification>>,
    fail: std::sync::atomic::AtomicBool,
}

impl InMemoryNotificationDispatcher {
    pub fn failing() -> Self {
        let dispatcher = Self::default();
        dispatcher.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        dispatcher
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for InMemoryNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Dispatch("dispatcher configured to fail".to_string()));
        }
        self.sent.lock().await.push(notification);
        Ok(())
    }
}
