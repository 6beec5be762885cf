use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::compensation::CompensationRule;

/// Tunables for the order engine. The server fills these from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_extraction_attempts: u32,
    pub max_commit_retries: u32,
    pub reminder_delay: Duration,
    pub max_reminders: u32,
    /// Offset manual times are typed in and prompts are rendered in.
    pub utc_offset: FixedOffset,
    pub compensation: CompensationRule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_extraction_attempts: 3,
            max_commit_retries: 3,
            reminder_delay: Duration::from_secs(15 * 60),
            max_reminders: 2,
            utc_offset: Utc.fix(),
            compensation: CompensationRule::default(),
        }
    }
}

impl EngineConfig {
    /// Offset from minutes east of UTC; out-of-range values fall back to UTC.
    pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
        FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }
}
