use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    CandidateSource, CompensationCategory, Field, FieldValue, OrderStatus, UserStatus,
};

// -- JWT Claims --

/// JWT claims shared across snackngo-api (REST middleware) and snackngo-gateway
/// (WebSocket authentication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: UserResponse,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminTokenRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub status: UserStatus,
    pub sequence_number: i64,
    pub compensation_category: CompensationCategory,
    pub total_compensation_cents: i64,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetUserStatusRequest {
    pub status: UserStatus,
}

/// Account summary: total compensation plus every order the user submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub user: UserResponse,
    pub orders: Vec<OrderSummary>,
}

// -- Orders --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub channel_id: String,
    pub status: OrderStatus,
    pub compensation_cents: i64,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct StartOrderResponse {
    pub order_id: Uuid,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldView {
    pub field: Field,
    pub value: Option<FieldValue>,
    pub verified: bool,
    pub source: Option<CandidateSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel_id: String,
    pub app_used: Option<String>,
    pub status: OrderStatus,
    pub fields: Vec<FieldView>,
    pub placement_screenshot: Option<String>,
    pub completion_screenshot: Option<String>,
    pub compensation_cents: i64,
    pub rejection_reason: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderVersionResponse {
    pub version: i64,
    pub change: String,
    pub snapshot: serde_json::Value,
    pub recorded_at: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RejectOrderRequest {
    pub reason: Option<String>,
}

/// One operator edit of a field. `value` is typed the way a user would
/// reply in the channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FieldCorrection {
    Set {
        field: Field,
        value: String,
        #[serde(default)]
        verify: bool,
    },
    Verify {
        field: Field,
    },
    Clear {
        field: Field,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrectOrderRequest {
    #[serde(default)]
    pub app_used: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldCorrection>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// Active users the notice was addressed to.
    pub recipients: usize,
    /// How many of them had a live connection.
    pub delivered: usize,
}
