//! Seams to the outside world: the screenshot extractor and the chat
//! transport that owns order channels.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snackngo_types::events::Prompt;
use snackngo_types::models::{Field, FieldValue, OrderStatus, Stage};
use uuid::Uuid;

/// Candidate values read off a screenshot, keyed by field.
pub type Candidates = BTreeMap<Field, FieldValue>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    /// The image could not be read or is not an image.
    #[error("image unavailable: {0}")]
    Image(String),
    /// The extraction service failed or answered with an error.
    #[error("extraction service error: {0}")]
    Service(String),
    /// The service answered but nothing usable could be parsed.
    #[error("no fields could be read from the screenshot")]
    NoFields,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, image_ref: &str, stage: Stage) -> Result<Candidates, ExtractionError>;
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a new channel for the order and return its identifier.
    async fn open_channel(&self, order_id: Uuid, user_id: Uuid) -> anyhow::Result<String>;

    async fn prompt_user(
        &self,
        order_id: Uuid,
        channel_id: &str,
        prompt: &Prompt,
    ) -> anyhow::Result<()>;

    async fn order_updated(
        &self,
        _order_id: Uuid,
        _channel_id: &str,
        _status: OrderStatus,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The order reached a terminal status and its channel takes no more
    /// traffic. Called after the final prompts went out.
    async fn close_channel(&self, _order_id: Uuid, _channel_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Out-of-order notice to a user, e.g. an operator broadcast. Returns
    /// whether it reached a live connection.
    async fn notify_user(&self, _user_id: Uuid, _text: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}
