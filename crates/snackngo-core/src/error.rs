use snackngo_types::models::{Field, OrderStatus};
use uuid::Uuid;

use crate::collaborators::ExtractionError;

/// Everything an order operation can fail with. Every variant names the
/// order, channel or user it concerns so the failure can be traced.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("channel {channel_id} is already bound to an order")]
    DuplicateChannel { channel_id: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("order {order_id}: cannot {action} while {from}")]
    InvalidTransition {
        order_id: Uuid,
        from: OrderStatus,
        action: String,
    },

    #[error("order {order_id}: {field} has no candidate value")]
    MissingValue { order_id: Uuid, field: Field },

    #[error("order {order_id}: invalid value for {field}: {reason}")]
    InvalidValue {
        order_id: Uuid,
        field: Field,
        reason: String,
    },

    #[error("username already taken: {username}")]
    UsernameTaken { username: String },

    #[error("user {user_id} is inactive")]
    UserInactive { user_id: Uuid },

    #[error("order {order_id}: extraction failed: {source}")]
    Extraction {
        order_id: Uuid,
        source: ExtractionError,
    },

    #[error("order {order_id}: lost update, stored version moved on")]
    ConcurrencyConflict { order_id: Uuid },

    #[error("chat transport error on order {order_id}: {reason}")]
    Transport { order_id: Uuid, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl OrderError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(order_id: Uuid, from: OrderStatus, action: impl Into<String>) -> Self {
        Self::InvalidTransition {
            order_id,
            from,
            action: action.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrderError>;
