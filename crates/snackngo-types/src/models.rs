use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Returned when a persisted or user-supplied identifier does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// -- Fields --

/// Every extractable, human-verifiable order field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    RestaurantName,
    RestaurantAddress,
    OrderPlacementTime,
    EarliestEstimatedArrivalTime,
    LatestEstimatedArrivalTime,
    OrderCompletionTime,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::RestaurantName,
        Field::RestaurantAddress,
        Field::OrderPlacementTime,
        Field::EarliestEstimatedArrivalTime,
        Field::LatestEstimatedArrivalTime,
        Field::OrderCompletionTime,
    ];

    /// Column name in the `orders` table; also the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestaurantName => "restaurant_name",
            Self::RestaurantAddress => "restaurant_address",
            Self::OrderPlacementTime => "order_placement_time",
            Self::EarliestEstimatedArrivalTime => "earliest_estimated_arrival_time",
            Self::LatestEstimatedArrivalTime => "latest_estimated_arrival_time",
            Self::OrderCompletionTime => "order_completion_time",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RestaurantName => "Restaurant Name",
            Self::RestaurantAddress => "Restaurant Address",
            Self::OrderPlacementTime => "Order Placement Time",
            Self::EarliestEstimatedArrivalTime => "Earliest Estimated Arrival Time",
            Self::LatestEstimatedArrivalTime => "Latest Estimated Arrival Time",
            Self::OrderCompletionTime => "Order Completion Time",
        }
    }

    pub fn group(&self) -> FieldGroup {
        match self {
            Self::RestaurantName | Self::RestaurantAddress => FieldGroup::RestaurantIdentity,
            Self::OrderPlacementTime
            | Self::EarliestEstimatedArrivalTime
            | Self::LatestEstimatedArrivalTime => FieldGroup::PlacementTiming,
            Self::OrderCompletionTime => FieldGroup::CompletionTiming,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self.group() {
            FieldGroup::RestaurantIdentity => ValueKind::Text,
            FieldGroup::PlacementTiming | FieldGroup::CompletionTiming => ValueKind::Timestamp,
        }
    }

    pub fn stage(&self) -> Stage {
        self.group().stage()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("field", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Timestamp,
}

/// Fields are verified in groups; a group is the unit a transition guard checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    RestaurantIdentity,
    PlacementTiming,
    CompletionTiming,
}

impl FieldGroup {
    pub fn fields(&self) -> &'static [Field] {
        match self {
            Self::RestaurantIdentity => &[Field::RestaurantName, Field::RestaurantAddress],
            Self::PlacementTiming => &[
                Field::OrderPlacementTime,
                Field::EarliestEstimatedArrivalTime,
                Field::LatestEstimatedArrivalTime,
            ],
            Self::CompletionTiming => &[Field::OrderCompletionTime],
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::RestaurantIdentity | Self::PlacementTiming => Stage::Initial,
            Self::CompletionTiming => Stage::Completion,
        }
    }
}

/// The two evidence-gathering stages of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Restaurant identity and placement timing, from the placement screenshot.
    Initial,
    /// Completion timing, from the completion screenshot.
    Completion,
}

impl Stage {
    pub fn groups(&self) -> &'static [FieldGroup] {
        match self {
            Self::Initial => &[FieldGroup::RestaurantIdentity, FieldGroup::PlacementTiming],
            Self::Completion => &[FieldGroup::CompletionTiming],
        }
    }

    /// Required fields of the stage in checklist order.
    pub fn fields(self) -> impl Iterator<Item = Field> {
        self.groups()
            .iter()
            .flat_map(|group| group.fields().iter().copied())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Completion => "completion",
        }
    }
}

impl FromStr for Stage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "completion" => Ok(Self::Completion),
            other => Err(ParseEnumError::new("stage", other)),
        }
    }
}

// -- Values --

/// A field value. Text for restaurant identity, epoch seconds for timing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Timestamp(i64),
}

impl FieldValue {
    /// Empty text and non-positive timestamps count as "no value".
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Timestamp(secs) => *secs <= 0,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Timestamp(_) => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Self::Timestamp(secs) => Some(*secs),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Timestamp(secs) => match chrono::DateTime::from_timestamp(*secs, 0) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M UTC")),
                None => write!(f, "{}", secs),
            },
        }
    }
}

/// Where a candidate value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Extraction,
    Manual,
}

// -- Order status --

/// Lifecycle status of an order. `CollectingMissingInfo` remembers the
/// verifying stage it returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingAppSelection,
    AwaitingInitialScreenshot,
    VerifyingInitialData,
    AwaitingCompletionScreenshot,
    VerifyingCompletionData,
    CollectingMissingInfo { resume: Stage },
    Completed,
    Rejected,
}

impl OrderStatus {
    pub const INITIAL: OrderStatus = OrderStatus::AwaitingAppSelection;

    /// Value of the `orders.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAppSelection => "awaiting_app_selection",
            Self::AwaitingInitialScreenshot => "awaiting_initial_screenshot",
            Self::VerifyingInitialData => "verifying_initial_data",
            Self::AwaitingCompletionScreenshot => "awaiting_completion_screenshot",
            Self::VerifyingCompletionData => "verifying_completion_data",
            Self::CollectingMissingInfo { .. } => "collecting_missing_info",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    /// The stage whose evidence the order is currently gathering, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::AwaitingInitialScreenshot | Self::VerifyingInitialData => Some(Stage::Initial),
            Self::AwaitingCompletionScreenshot | Self::VerifyingCompletionData => {
                Some(Stage::Completion)
            }
            Self::CollectingMissingInfo { resume } => Some(*resume),
            Self::AwaitingAppSelection | Self::Completed | Self::Rejected => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    pub fn verifying(stage: Stage) -> Self {
        match stage {
            Stage::Initial => Self::VerifyingInitialData,
            Stage::Completion => Self::VerifyingCompletionData,
        }
    }

    pub fn awaiting_screenshot(stage: Stage) -> Self {
        match stage {
            Stage::Initial => Self::AwaitingInitialScreenshot,
            Stage::Completion => Self::AwaitingCompletionScreenshot,
        }
    }

    /// Rebuild a status from its persisted columns.
    pub fn from_columns(status: &str, resume: Option<&str>) -> Result<Self, ParseEnumError> {
        Ok(match status {
            "awaiting_app_selection" => Self::AwaitingAppSelection,
            "awaiting_initial_screenshot" => Self::AwaitingInitialScreenshot,
            "verifying_initial_data" => Self::VerifyingInitialData,
            "awaiting_completion_screenshot" => Self::AwaitingCompletionScreenshot,
            "verifying_completion_data" => Self::VerifyingCompletionData,
            "collecting_missing_info" => {
                let resume = resume.ok_or_else(|| ParseEnumError::new("resume stage", "NULL"))?;
                Self::CollectingMissingInfo {
                    resume: resume.parse()?,
                }
            }
            "completed" => Self::Completed,
            "rejected" => Self::Rejected,
            other => return Err(ParseEnumError::new("order status", other)),
        })
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectingMissingInfo { resume } => {
                write!(f, "collecting_missing_info({})", resume.as_str())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

// -- Users --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for UserStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(ParseEnumError::new("user status", other)),
        }
    }
}

/// Reward scheme a user is assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationCategory {
    /// Odd sequence numbers: raffle entries staged by completed-order count.
    StagedRaffle,
    /// Even sequence numbers: a fixed credit per completed submission.
    SubmissionCount,
}

impl CompensationCategory {
    /// Odd sequence → staged raffle, even → per-submission credit.
    pub fn for_sequence(sequence_number: i64) -> Self {
        if sequence_number % 2 != 0 {
            Self::StagedRaffle
        } else {
            Self::SubmissionCount
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StagedRaffle => "staged_raffle",
            Self::SubmissionCount => "submission_count",
        }
    }
}

impl FromStr for CompensationCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged_raffle" => Ok(Self::StagedRaffle),
            "submission_count" => Ok(Self::SubmissionCount),
            other => Err(ParseEnumError::new("compensation category", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_columns_roundtrip() {
        let statuses = [
            OrderStatus::AwaitingAppSelection,
            OrderStatus::VerifyingCompletionData,
            OrderStatus::CollectingMissingInfo {
                resume: Stage::Completion,
            },
            OrderStatus::Rejected,
        ];
        for status in statuses {
            let resume = status.stage().map(|s| s.as_str());
            assert_eq!(OrderStatus::from_columns(status.as_str(), resume).unwrap(), status);
        }
    }

    #[test]
    fn collecting_without_resume_is_corrupt() {
        assert!(OrderStatus::from_columns("collecting_missing_info", None).is_err());
        assert!(OrderStatus::from_columns("shipped", None).is_err());
    }

    #[test]
    fn stage_checklist_order() {
        let initial: Vec<Field> = Stage::Initial.fields().collect();
        assert_eq!(
            initial,
            vec![
                Field::RestaurantName,
                Field::RestaurantAddress,
                Field::OrderPlacementTime,
                Field::EarliestEstimatedArrivalTime,
                Field::LatestEstimatedArrivalTime,
            ]
        );
        let completion: Vec<Field> = Stage::Completion.fields().collect();
        assert_eq!(completion, vec![Field::OrderCompletionTime]);
    }

    #[test]
    fn category_follows_sequence_parity() {
        assert_eq!(CompensationCategory::for_sequence(3), CompensationCategory::StagedRaffle);
        assert_eq!(CompensationCategory::for_sequence(4), CompensationCategory::SubmissionCount);
        assert_eq!(CompensationCategory::for_sequence(1), CompensationCategory::StagedRaffle);
    }

    #[test]
    fn empty_values() {
        assert!(FieldValue::Text("   ".into()).is_empty());
        assert!(FieldValue::Timestamp(0).is_empty());
        assert!(!FieldValue::Text("Cafe A".into()).is_empty());
        assert!(!FieldValue::Timestamp(1_700_000_000).is_empty());
    }

    #[test]
    fn field_parses_from_column_name() {
        assert_eq!("order_completion_time".parse::<Field>().unwrap(), Field::OrderCompletionTime);
        assert!("delivery_fee".parse::<Field>().is_err());
    }
}
