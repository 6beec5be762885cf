/// Database row types — these map directly to SQLite rows.
/// Distinct from the domain types in snackngo-core to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub total_compensation: i64,
    pub status: String,
    pub sequence_number: i64,
    pub compensation_category: String,
    pub created_at: i64,
}

/// One `orders` row. Field values and their `is_*_verified` flags are kept
/// side by side exactly as the persisted schema declares them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderRow {
    pub order_id: String,
    pub user_id: Option<String>,
    pub channel_id: String,
    pub compensation: i64,
    pub app_used: Option<String>,
    pub status: String,
    pub resume_stage: Option<String>,

    pub restaurant_name: Option<String>,
    pub is_restaurant_name_verified: bool,
    pub restaurant_address: Option<String>,
    pub is_restaurant_address_verified: bool,
    pub order_placement_time: Option<i64>,
    pub is_order_placement_time_verified: bool,
    pub earliest_estimated_arrival_time: Option<i64>,
    pub is_earliest_estimated_arrival_time_verified: bool,
    pub latest_estimated_arrival_time: Option<i64>,
    pub is_latest_estimated_arrival_time_verified: bool,
    pub order_completion_time: Option<i64>,
    pub is_order_completion_time_verified: bool,

    pub placement_screenshot_path: Option<String>,
    pub completion_screenshot_path: Option<String>,
    /// JSON object: field name -> candidate source.
    pub field_sources: String,
    pub extraction_failures: i64,
    pub missing_info_since: Option<i64>,
    pub rejection_reason: Option<String>,
    pub compensation_awarded_at: Option<i64>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct OrderVersionRow {
    pub order_id: String,
    pub version: i64,
    pub change: String,
    pub snapshot: String,
    pub recorded_at: i64,
}

pub struct RaffleEntryRow {
    pub order_id: String,
    pub user_id: Option<String>,
    pub stage: i64,
    pub created_at: i64,
}

/// Compensation to book in the same transaction as an order commit.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardRow {
    pub user_id: String,
    pub amount: i64,
    /// Staged-raffle users also get a raffle entry.
    pub raffle_entry: bool,
}

/// Result of an optimistic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed { raffle_stage: Option<i64> },
    /// The stored version no longer matched the expected one; nothing was written.
    VersionConflict { stored: Option<i64> },
}
