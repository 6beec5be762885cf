//! Order lifecycle state machine.
//!
//! Every status change goes through [`next_status`], the single transition
//! table. [`OrderMachine`] applies user and extraction events to an
//! [`Order`] in memory and reports what happened as [`Effects`]; nothing here
//! touches storage or the chat transport.
//!
//! ```text
//! awaiting_app_selection
//!   └─AppSelected─► awaiting_initial_screenshot
//!                     ├─EvidenceExtracted─► verifying_initial_data ◄──┐
//!                     └─ExtractionFailed──► collecting_missing_info ──┘ MissingSupplied
//! verifying_initial_data ─StageVerified─► awaiting_completion_screenshot
//!                     ├─EvidenceExtracted─► verifying_completion_data ─Complete─► completed
//!                     └─ExtractionFailed──► collecting_missing_info
//! any non-terminal ─Reject─► rejected
//! ```

use snackngo_types::events::Prompt;
use snackngo_types::models::{CandidateSource, Field, FieldValue, OrderStatus, Stage};
use tracing::{debug, info};

use crate::collaborators::{Candidates, ExtractionError};
use crate::error::{OrderError, Result};
use crate::order::Order;
use crate::store::OrderPatch;
use crate::tracker::{FieldState, TrackerError};

/// Reason recorded when a stage exhausts its extraction attempts.
pub const UNREADABLE_SCREENSHOT: &str = "unreadable screenshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    AppSelected,
    EvidenceExtracted,
    ExtractionFailed,
    StageVerified,
    FieldMissing,
    MissingSupplied,
    Complete,
    Reject,
}

/// The transition table. `None` means the event is illegal in `from`.
/// Guards on field state are checked by the caller before asking.
pub fn next_status(from: OrderStatus, transition: Transition) -> Option<OrderStatus> {
    use OrderStatus::*;
    use Transition::*;

    match (from, transition) {
        (AwaitingAppSelection, AppSelected) => Some(AwaitingInitialScreenshot),

        (AwaitingInitialScreenshot, EvidenceExtracted) => Some(VerifyingInitialData),
        (AwaitingCompletionScreenshot, EvidenceExtracted) => Some(VerifyingCompletionData),

        (AwaitingInitialScreenshot, ExtractionFailed) => Some(CollectingMissingInfo {
            resume: Stage::Initial,
        }),
        (AwaitingCompletionScreenshot, ExtractionFailed) => Some(CollectingMissingInfo {
            resume: Stage::Completion,
        }),

        (VerifyingInitialData, StageVerified) => Some(AwaitingCompletionScreenshot),

        (VerifyingInitialData, FieldMissing) => Some(CollectingMissingInfo {
            resume: Stage::Initial,
        }),
        (VerifyingCompletionData, FieldMissing) => Some(CollectingMissingInfo {
            resume: Stage::Completion,
        }),

        (CollectingMissingInfo { resume }, MissingSupplied) => Some(OrderStatus::verifying(resume)),

        (VerifyingCompletionData, Complete) => Some(Completed),

        (from, Reject) if !from.is_terminal() => Some(Rejected),

        _ => None,
    }
}

/// What a machine call did to the order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// False for no-ops; nothing needs to be committed.
    pub changed: bool,
    /// Human-readable change log, stored with the audit snapshot.
    pub changes: Vec<String>,
    /// Prompts to post into the order channel, in order.
    pub prompts: Vec<Prompt>,
    /// The order just completed and compensation must be booked with this commit.
    pub award_due: bool,
}

impl Effects {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn change_description(&self) -> String {
        self.changes.join("; ")
    }

    fn note(&mut self, change: impl Into<String>) {
        self.changed = true;
        self.changes.push(change.into());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrderMachine {
    pub max_extraction_attempts: u32,
}

impl Default for OrderMachine {
    fn default() -> Self {
        Self {
            max_extraction_attempts: 3,
        }
    }
}

impl OrderMachine {
    pub fn new(max_extraction_attempts: u32) -> Self {
        Self {
            max_extraction_attempts: max_extraction_attempts.max(1),
        }
    }

    pub fn select_app(&self, order: &mut Order, app: &str, now: i64) -> Result<Effects> {
        let app = app.trim();
        if order.status == OrderStatus::AwaitingInitialScreenshot
            && order.app_used.as_deref() == Some(app)
        {
            return Ok(Effects::unchanged());
        }
        if app.is_empty() {
            return Err(OrderError::invalid(order.id, order.status, "select an empty app"));
        }

        let mut effects = Effects::default();
        self.transition(order, Transition::AppSelected, now, &mut effects)?;
        order.app_used = Some(app.to_string());
        effects.prompts.push(Prompt::SendInitialScreenshot {
            app: app.to_string(),
        });
        Ok(effects)
    }

    /// The stage a screenshot sent now would be evidence for.
    pub fn screenshot_stage(&self, order: &Order) -> Result<Stage> {
        match order.status {
            OrderStatus::AwaitingAppSelection | OrderStatus::Completed | OrderStatus::Rejected => {
                Err(OrderError::invalid(order.id, order.status, "accept a screenshot"))
            }
            status => status
                .stage()
                .ok_or_else(|| OrderError::invalid(order.id, status, "accept a screenshot")),
        }
    }

    /// Apply the outcome of extracting `image_ref` for `stage`.
    ///
    /// Candidates only fill fields that have none yet and only for the
    /// stage's own fields. A failed or empty extraction counts against the
    /// stage's attempt bound while the stage still lacks evidence; reaching
    /// the bound rejects the order.
    pub fn record_extraction(
        &self,
        order: &mut Order,
        stage: Stage,
        image_ref: &str,
        outcome: std::result::Result<Candidates, ExtractionError>,
        now: i64,
    ) -> Result<Effects> {
        if order.status.is_terminal() || order.status.stage() != Some(stage) {
            return Err(OrderError::invalid(
                order.id,
                order.status,
                format!("record {} evidence", stage.as_str()),
            ));
        }

        let mut effects = Effects::default();
        order.set_screenshot(stage, image_ref);
        effects.note(format!("{} screenshot {}", stage.as_str(), image_ref));

        let mut usable = 0usize;
        if let Ok(candidates) = &outcome {
            for (field, value) in candidates {
                if field.stage() != stage {
                    debug!(order_id = %order.id, field = %field, "ignoring candidate outside active stage");
                    continue;
                }
                if order.fields.has_candidate(*field) {
                    usable += 1;
                    continue;
                }
                match order
                    .fields
                    .propose(*field, value.clone(), CandidateSource::Extraction)
                {
                    Ok(_) => {
                        usable += 1;
                        effects.note(format!("extracted {}", field));
                    }
                    Err(e) => debug!(order_id = %order.id, "dropping extracted candidate: {}", e),
                }
            }
        }

        // A stage whose fields all have candidates already is only being
        // verified; an unreadable extra screenshot costs nothing there.
        let needs_evidence = order.status == OrderStatus::awaiting_screenshot(stage)
            || !order.fields.missing(stage).is_empty();

        if usable == 0 && !needs_evidence {
            debug!(order_id = %order.id, stage = stage.as_str(), "nothing new in screenshot");
        } else if usable == 0 {
            let reason = match &outcome {
                Err(e) => e.to_string(),
                Ok(_) => ExtractionError::NoFields.to_string(),
            };
            order.extraction_failures += 1;
            effects.note(format!(
                "extraction failed ({}/{}): {}",
                order.extraction_failures, self.max_extraction_attempts, reason
            ));

            if order.extraction_failures >= self.max_extraction_attempts {
                self.reject_into(order, UNREADABLE_SCREENSHOT, now, &mut effects)?;
                return Ok(effects);
            }

            effects.prompts.push(Prompt::ExtractionFailed {
                attempts_left: self.max_extraction_attempts - order.extraction_failures,
            });
            if order.status == OrderStatus::awaiting_screenshot(stage) {
                self.transition(order, Transition::ExtractionFailed, now, &mut effects)?;
            }
        } else if order.status == OrderStatus::awaiting_screenshot(stage) {
            self.transition(order, Transition::EvidenceExtracted, now, &mut effects)?;
        }

        self.settle(order, now, &mut effects)?;
        Ok(effects)
    }

    /// Record a candidate value for a field of the active stage.
    pub fn propose(
        &self,
        order: &mut Order,
        field: Field,
        value: FieldValue,
        source: CandidateSource,
        now: i64,
    ) -> Result<Effects> {
        self.require_active_field(order, field, "propose")?;

        let changed = order
            .fields
            .propose(field, value, source)
            .map_err(|e| tracker_error(order, e))?;
        if !changed {
            return Ok(Effects::unchanged());
        }

        let mut effects = Effects::default();
        effects.note(format!("proposed {}", field));
        self.settle(order, now, &mut effects)?;
        Ok(effects)
    }

    /// Human confirmation of a candidate. Confirming a field that is already
    /// verified is a no-op in every status except `rejected`.
    pub fn confirm(&self, order: &mut Order, field: Field, now: i64) -> Result<Effects> {
        if order.status != OrderStatus::Rejected && order.fields.is_verified(field) {
            return Ok(Effects::unchanged());
        }
        self.require_active_field(order, field, "confirm")?;

        order
            .fields
            .confirm(field)
            .map_err(|e| tracker_error(order, e))?;

        let mut effects = Effects::default();
        effects.note(format!("verified {}", field));
        self.settle(order, now, &mut effects)?;
        Ok(effects)
    }

    /// Human denial: drop the candidate so a new one can be supplied.
    pub fn reject_field(&self, order: &mut Order, field: Field, now: i64) -> Result<Effects> {
        self.require_active_field(order, field, "reject")?;

        if !order.fields.reject(field) {
            return Ok(Effects::unchanged());
        }

        let mut effects = Effects::default();
        effects.note(format!("cleared {}", field));
        self.settle(order, now, &mut effects)?;
        Ok(effects)
    }

    /// Explicit completion. Fires at most once; repeating it is a no-op.
    pub fn complete(&self, order: &mut Order, now: i64) -> Result<Effects> {
        if order.status == OrderStatus::Completed {
            return Ok(Effects::unchanged());
        }
        if !self.completion_guard(order) {
            return Err(OrderError::invalid(
                order.id,
                order.status,
                "complete with unverified fields",
            ));
        }

        let mut effects = Effects::default();
        self.transition(order, Transition::Complete, now, &mut effects)?;
        effects.award_due = true;
        Ok(effects)
    }

    /// Operator correction. The patch lands first, then the same guards as
    /// any user edit, so a patch that verifies a stage moves the order on.
    pub fn correct(&self, order: &mut Order, patch: &OrderPatch, now: i64) -> Result<Effects> {
        if patch.is_empty() {
            return Ok(Effects::unchanged());
        }
        patch.apply(order)?;

        let mut effects = Effects::default();
        effects.note(patch.describe());
        self.settle(order, now, &mut effects)?;
        Ok(effects)
    }

    /// Operator or user rejection of the whole order.
    pub fn reject_order(&self, order: &mut Order, reason: &str, now: i64) -> Result<Effects> {
        let mut effects = Effects::default();
        self.reject_into(order, reason, now, &mut effects)?;
        Ok(effects)
    }

    /// Prompt that moves the order forward from where it is now.
    pub fn next_prompt(&self, order: &Order) -> Option<Prompt> {
        match order.status {
            OrderStatus::AwaitingAppSelection => Some(Prompt::ChooseApp),
            OrderStatus::AwaitingInitialScreenshot => Some(Prompt::SendInitialScreenshot {
                app: order.app_used.clone().unwrap_or_default(),
            }),
            OrderStatus::AwaitingCompletionScreenshot => Some(Prompt::SendCompletionScreenshot),
            OrderStatus::VerifyingInitialData | OrderStatus::VerifyingCompletionData => {
                let stage = order.status.stage()?;
                order
                    .fields
                    .checklist(stage)
                    .into_iter()
                    .find_map(|(field, state)| match state {
                        FieldState::Proposed { value, .. } => Some(Prompt::ConfirmField {
                            field,
                            value: value.clone(),
                        }),
                        _ => None,
                    })
            }
            OrderStatus::CollectingMissingInfo { resume } => {
                match order.fields.missing(resume).first() {
                    Some(field) => Some(Prompt::EnterField { field: *field }),
                    None => Some(match resume {
                        Stage::Initial => Prompt::SendInitialScreenshot {
                            app: order.app_used.clone().unwrap_or_default(),
                        },
                        Stage::Completion => Prompt::SendCompletionScreenshot,
                    }),
                }
            }
            OrderStatus::Completed => None,
            OrderStatus::Rejected => Some(Prompt::Rejected {
                reason: order.rejection_reason.clone().unwrap_or_default(),
            }),
        }
    }

    // -- internals --

    fn transition(
        &self,
        order: &mut Order,
        transition: Transition,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let from = order.status;
        let to = next_status(from, transition).ok_or_else(|| {
            OrderError::invalid(order.id, from, format!("{:?}", transition))
        })?;

        order.status = to;
        order.updated_at = now;
        order.missing_info_since = match to {
            OrderStatus::CollectingMissingInfo { .. } => order.missing_info_since.or(Some(now)),
            _ => None,
        };

        info!(order_id = %order.id, %from, %to, "order transition {:?}", transition);
        effects.note(format!("{}: {} -> {}", transition_name(transition), from, to));
        Ok(())
    }

    /// Run the automatic guards after a field change: drop into
    /// missing-info when a required field has no candidate, return to
    /// verifying once nothing is missing, and advance a fully verified stage.
    fn settle(&self, order: &mut Order, now: i64, effects: &mut Effects) -> Result<()> {
        order.updated_at = now;
        loop {
            match order.status {
                OrderStatus::VerifyingInitialData | OrderStatus::VerifyingCompletionData => {
                    let Some(stage) = order.status.stage() else {
                        break;
                    };
                    if !order.fields.missing(stage).is_empty() {
                        self.transition(order, Transition::FieldMissing, now, effects)?;
                        continue;
                    }
                    if order.fields.stage_verified(stage) {
                        match stage {
                            Stage::Initial => {
                                self.transition(order, Transition::StageVerified, now, effects)?;
                                order.extraction_failures = 0;
                            }
                            Stage::Completion => {
                                self.transition(order, Transition::Complete, now, effects)?;
                                effects.award_due = true;
                            }
                        }
                    }
                    break;
                }
                OrderStatus::CollectingMissingInfo { resume } => {
                    if order.screenshot(resume).is_some() && order.fields.missing(resume).is_empty()
                    {
                        self.transition(order, Transition::MissingSupplied, now, effects)?;
                        continue;
                    }
                    break;
                }
                _ => break,
            }
        }

        if let Some(prompt) = self.next_prompt(order) {
            effects.prompts.push(prompt);
        }
        Ok(())
    }

    fn reject_into(
        &self,
        order: &mut Order,
        reason: &str,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let reason = match reason.trim() {
            "" => "rejected by operator",
            reason => reason,
        };
        self.transition(order, Transition::Reject, now, effects)?;
        order.rejection_reason = Some(reason.to_string());
        effects.prompts.push(Prompt::Rejected {
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn completion_guard(&self, order: &Order) -> bool {
        order.status == OrderStatus::VerifyingCompletionData
            && order.fields.stage_verified(Stage::Initial)
            && order.fields.stage_verified(Stage::Completion)
    }

    /// Field edits are only legal for the stage the order is verifying or
    /// collecting right now.
    fn require_active_field(&self, order: &Order, field: Field, action: &str) -> Result<()> {
        let editable = matches!(
            order.status,
            OrderStatus::VerifyingInitialData
                | OrderStatus::VerifyingCompletionData
                | OrderStatus::CollectingMissingInfo { .. }
        ) && order.status.stage() == Some(field.stage());

        if editable {
            Ok(())
        } else {
            Err(OrderError::invalid(
                order.id,
                order.status,
                format!("{} {}", action, field),
            ))
        }
    }
}

fn transition_name(transition: Transition) -> &'static str {
    match transition {
        Transition::AppSelected => "app_selected",
        Transition::EvidenceExtracted => "evidence_extracted",
        Transition::ExtractionFailed => "extraction_failed",
        Transition::StageVerified => "stage_verified",
        Transition::FieldMissing => "field_missing",
        Transition::MissingSupplied => "missing_supplied",
        Transition::Complete => "complete",
        Transition::Reject => "reject",
    }
}

fn tracker_error(order: &Order, err: TrackerError) -> OrderError {
    match err {
        TrackerError::MissingValue(field) => OrderError::MissingValue {
            order_id: order.id,
            field,
        },
        TrackerError::InvalidValue { field, reason } => OrderError::InvalidValue {
            order_id: order.id,
            field,
            reason,
        },
    }
}
