use snackngo_types::api::{FieldView, OrderResponse, OrderSummary};
use snackngo_types::models::{Field, OrderStatus, Stage};
use uuid::Uuid;

use crate::tracker::FieldTracker;

/// In-memory order: the persisted row with its verification flags folded
/// into a `FieldTracker`.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel_id: String,
    pub app_used: Option<String>,
    pub status: OrderStatus,
    pub fields: FieldTracker,
    pub placement_screenshot: Option<String>,
    pub completion_screenshot: Option<String>,
    pub compensation_cents: i64,
    pub compensation_awarded_at: Option<i64>,
    /// Failed extractions for the active stage.
    pub extraction_failures: u32,
    /// Set while in `collecting_missing_info`; drives reminders.
    pub missing_info_since: Option<i64>,
    pub rejection_reason: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn new(id: Uuid, user_id: Option<Uuid>, channel_id: impl Into<String>, now: i64) -> Self {
        Self {
            id,
            user_id,
            channel_id: channel_id.into(),
            app_used: None,
            status: OrderStatus::INITIAL,
            fields: FieldTracker::new(),
            placement_screenshot: None,
            completion_screenshot: None,
            compensation_cents: 0,
            compensation_awarded_at: None,
            extraction_failures: 0,
            missing_info_since: None,
            rejection_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn screenshot(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Initial => self.placement_screenshot.as_deref(),
            Stage::Completion => self.completion_screenshot.as_deref(),
        }
    }

    pub(crate) fn set_screenshot(&mut self, stage: Stage, image_ref: &str) {
        let slot = match stage {
            Stage::Initial => &mut self.placement_screenshot,
            Stage::Completion => &mut self.completion_screenshot,
        };
        *slot = Some(image_ref.to_string());
    }

    /// Cross-field invariants that a single field state cannot express.
    /// Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let initial_done = self.fields.stage_verified(Stage::Initial);
        match self.status {
            OrderStatus::Completed => {
                if !initial_done || !self.fields.stage_verified(Stage::Completion) {
                    return Err("completed with unverified fields".into());
                }
            }
            OrderStatus::AwaitingCompletionScreenshot
            | OrderStatus::VerifyingCompletionData
            | OrderStatus::CollectingMissingInfo {
                resume: Stage::Completion,
            } => {
                if !initial_done {
                    return Err(format!("{} before the initial stage is verified", self.status));
                }
            }
            _ => {}
        }

        if self.status != OrderStatus::Completed
            && (self.compensation_cents != 0 || self.compensation_awarded_at.is_some())
        {
            return Err("compensation recorded on an uncompleted order".into());
        }
        if matches!(self.status, OrderStatus::CollectingMissingInfo { .. })
            != self.missing_info_since.is_some()
        {
            return Err("missing-info timestamp out of step with status".into());
        }
        Ok(())
    }

    pub fn field_views(&self) -> Vec<FieldView> {
        self.fields
            .iter()
            .map(|(field, state)| FieldView {
                field,
                value: state.value().cloned(),
                verified: state.is_verified(),
                source: state.source(),
            })
            .collect()
    }

    pub fn to_view(&self) -> OrderResponse {
        OrderResponse {
            order_id: self.id,
            user_id: self.user_id,
            channel_id: self.channel_id.clone(),
            app_used: self.app_used.clone(),
            status: self.status,
            fields: self.field_views(),
            placement_screenshot: self.placement_screenshot.clone(),
            completion_screenshot: self.completion_screenshot.clone(),
            compensation_cents: self.compensation_cents,
            rejection_reason: self.rejection_reason.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            order_id: self.id,
            channel_id: self.channel_id.clone(),
            status: self.status,
            compensation_cents: self.compensation_cents,
            created_at: self.created_at,
        }
    }

    /// The audit snapshot stored with each version.
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.to_view()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Fields of the active stage still lacking a candidate.
    pub fn missing_fields(&self) -> Vec<Field> {
        self.status
            .stage()
            .map(|stage| self.fields.missing(stage))
            .unwrap_or_default()
    }
}
