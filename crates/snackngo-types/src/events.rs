use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AccountResponse;
use crate::models::{CompensationCategory, Field, FieldValue, OrderStatus};

/// Structured prompts the bot sends into an order channel. The gateway
/// renders them to text; clients may also use the structure directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "prompt", rename_all = "snake_case")]
pub enum Prompt {
    /// Ask which delivery app the order was placed with.
    ChooseApp,
    SendInitialScreenshot { app: String },
    /// Ask the user to confirm or deny an extracted/proposed value.
    ConfirmField { field: Field, value: FieldValue },
    /// Ask the user to type a value the screenshot did not yield.
    EnterField { field: Field },
    ExtractionFailed { attempts_left: u32 },
    SendCompletionScreenshot,
    /// Missing-info escalation; never rejects on its own.
    Reminder { fields: Vec<Field> },
    Completed {
        compensation_cents: i64,
        category: Option<CompensationCategory>,
        raffle_stage: Option<i64>,
    },
    Rejected { reason: String },
}

/// Why a free-standing notice was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Welcome,
    Help,
    Broadcast,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A new order channel was opened for this user
    ChannelOpened { order_id: Uuid, channel_id: String },

    /// A bot prompt posted into an order channel
    Prompt {
        order_id: Uuid,
        channel_id: String,
        text: String,
        prompt: Prompt,
    },

    /// The order moved to a new status
    OrderUpdate {
        order_id: Uuid,
        channel_id: String,
        status: OrderStatus,
    },

    /// Reply to an AccountStatus command
    Account(AccountResponse),

    /// Text outside any order channel: welcome, help or an operator broadcast
    Notice { kind: NoticeKind, text: String },

    /// A command was refused
    Error {
        channel_id: Option<String>,
        message: String,
    },
}

impl GatewayEvent {
    /// Returns the channel_id if this event is scoped to an order channel.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::ChannelOpened { channel_id, .. }
            | Self::Prompt { channel_id, .. }
            | Self::OrderUpdate { channel_id, .. } => Some(channel_id),
            Self::Error { channel_id, .. } => channel_id.as_deref(),
            Self::Ready { .. } | Self::Account(_) | Self::Notice { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// "Let me submit my order": opens a new order channel
    StartOrder,

    /// Record which delivery app the order used
    SelectApp { channel_id: String, app: String },

    /// A screenshot was uploaded to storage; `image_ref` is its storage reference
    Screenshot { channel_id: String, image_ref: String },

    /// Manual value for a field
    Reply {
        channel_id: String,
        field: Field,
        value: String,
    },

    /// "Yes" on a proposed value
    Confirm { channel_id: String, field: Field },

    /// "No" on a proposed value
    Deny { channel_id: String, field: Field },

    /// Abandon the order
    Cancel { channel_id: String },

    /// Ask for total compensation and order history
    AccountStatus,

    /// "help" or "?": how to use the bot
    Help,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let raw = r#"{"type":"Confirm","data":{"channel_id":"order-upload-1","field":"restaurant_name"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            GatewayCommand::Confirm { channel_id, field } => {
                assert_eq!(channel_id, "order-upload-1");
                assert_eq!(field, Field::RestaurantName);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn status_event_is_tagged() {
        let event = GatewayEvent::OrderUpdate {
            order_id: Uuid::nil(),
            channel_id: "c".into(),
            status: OrderStatus::CollectingMissingInfo {
                resume: crate::models::Stage::Initial,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "OrderUpdate");
        assert_eq!(json["data"]["status"]["state"], "collecting_missing_info");
        assert_eq!(json["data"]["status"]["resume"], "initial");
        assert_eq!(event.channel_id(), Some("c"));
    }

    #[test]
    fn help_and_notice_wire_format() {
        let cmd: GatewayCommand = serde_json::from_str(r#"{"type":"Help"}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::Help));

        let event = GatewayEvent::Notice {
            kind: NoticeKind::Broadcast,
            text: "maintenance at noon".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Notice");
        assert_eq!(json["data"]["kind"], "broadcast");
        assert_eq!(event.channel_id(), None);
    }
}
