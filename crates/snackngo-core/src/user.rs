use anyhow::{Context, anyhow};
use snackngo_db::models::UserRow;
use snackngo_types::api::UserResponse;
use snackngo_types::models::{CompensationCategory, UserStatus};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub total_compensation_cents: i64,
    pub status: UserStatus,
    pub sequence_number: i64,
    pub compensation_category: CompensationCategory,
    pub created_at: i64,
}

impl User {
    pub fn from_row(row: UserRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).with_context(|| format!("bad user id {}", row.id))?,
            status: row.status.parse().map_err(|e| anyhow!("user {}: {}", row.id, e))?,
            compensation_category: row
                .compensation_category
                .parse()
                .map_err(|e| anyhow!("user {}: {}", row.id, e))?,
            username: row.username,
            email: row.email,
            total_compensation_cents: row.total_compensation,
            sequence_number: row.sequence_number,
            created_at: row.created_at,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            status: self.status,
            sequence_number: self.sequence_number,
            compensation_category: self.compensation_category,
            total_compensation_cents: self.total_compensation_cents,
            created_at: self.created_at,
        }
    }
}
