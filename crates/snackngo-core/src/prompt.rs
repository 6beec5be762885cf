use chrono::{DateTime, FixedOffset};
use snackngo_types::events::Prompt;
use snackngo_types::models::{CompensationCategory, Field, FieldValue};

/// Timestamps in prompts are shown in the operator's local offset using the
/// same layout manual replies are typed in.
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Sent when a user who has no orders yet connects.
pub const WELCOME_TEXT: &str = "Welcome to Snack'n'Go! Each food delivery order you submit \
    earns compensation. Start an order, tell me which delivery app you used, then send a \
    screenshot of the order confirmation and, once the food arrives, one of the delivery \
    time. Ask for \"help\" at any point.";

/// Answer to a help request.
pub const HELP_TEXT: &str = "How to submit an order:\n\
    1. Start an order. A private order channel opens for it.\n\
    2. Pick the delivery app you ordered with.\n\
    3. Upload the order confirmation screenshot and confirm or correct each value I read.\n\
    4. After delivery, upload a screenshot showing the delivery time and confirm it.\n\
    Ask for your account status to see your compensation and past orders. \
    Cancel an order channel to abandon that submission.";

pub fn format_value(value: &FieldValue, offset: FixedOffset) -> String {
    match value {
        FieldValue::Text(text) => text.clone(),
        FieldValue::Timestamp(secs) => match DateTime::from_timestamp(*secs, 0) {
            Some(dt) => dt.with_timezone(&offset).format(DISPLAY_FORMAT).to_string(),
            None => secs.to_string(),
        },
    }
}

fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

fn field_list(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| format!("*{}*", f.label()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Chat text for a structured prompt.
pub fn render(prompt: &Prompt, offset: FixedOffset) -> String {
    match prompt {
        Prompt::ChooseApp => "Which delivery app did you order with?".to_string(),
        Prompt::SendInitialScreenshot { app } => format!(
            "Great, {}! Please upload a screenshot of your order confirmation \
             showing the restaurant and delivery window.",
            app
        ),
        Prompt::ConfirmField { field, value } => format!(
            "The data extracted is:\n\n*{}*: {}\n\nIs this correct?",
            field.label(),
            format_value(value, offset)
        ),
        Prompt::EnterField { field } => match field.kind() {
            snackngo_types::models::ValueKind::Text => {
                format!("Please manually input the *{}*.", field.label())
            }
            snackngo_types::models::ValueKind::Timestamp => format!(
                "Please manually input the *{}* as YYYY-MM-DD HH:MM.",
                field.label()
            ),
        },
        Prompt::ExtractionFailed { attempts_left } => format!(
            "Sorry, I couldn't read that screenshot. You can send a clearer one \
             ({} attempt{} left) or type the details in.",
            attempts_left,
            if *attempts_left == 1 { "" } else { "s" }
        ),
        Prompt::SendCompletionScreenshot => {
            "Thanks! Once your food arrives, upload a screenshot showing the delivery time."
                .to_string()
        }
        Prompt::Reminder { fields } => format!(
            "Reminder: your order is still missing {}.",
            field_list(fields)
        ),
        Prompt::Completed {
            compensation_cents,
            category,
            raffle_stage,
        } => match (category, raffle_stage) {
            (Some(CompensationCategory::StagedRaffle), Some(stage)) => format!(
                "All done! Your order is verified and you've earned raffle entry #{}.",
                stage
            ),
            (Some(_), _) => format!(
                "All done! Your order is verified and {} was added to your account.",
                format_cents(*compensation_cents)
            ),
            (None, _) => "All done! Your order is verified.".to_string(),
        },
        Prompt::Rejected { reason } => format!("This order submission was closed: {}.", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_in_offset() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let prompt = Prompt::ConfirmField {
            field: Field::OrderPlacementTime,
            value: FieldValue::Timestamp(1_700_000_000),
        };
        let text = render(&prompt, offset);
        assert!(text.contains("*Order Placement Time*: 2023-11-14 17:13"));
    }

    #[test]
    fn submission_credit_is_shown_in_dollars() {
        let prompt = Prompt::Completed {
            compensation_cents: 505,
            category: Some(CompensationCategory::SubmissionCount),
            raffle_stage: None,
        };
        let text = render(&prompt, FixedOffset::east_opt(0).unwrap());
        assert!(text.contains("$5.05"));
    }

    #[test]
    fn help_walks_through_both_screenshots() {
        assert!(HELP_TEXT.contains("confirmation screenshot"));
        assert!(HELP_TEXT.contains("delivery time"));
        assert!(WELCOME_TEXT.contains("help"));
    }
}
