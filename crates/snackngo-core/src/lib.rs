pub mod collaborators;
pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod lifecycle;
pub mod order;
pub mod prompt;
pub mod reminders;
pub mod store;
pub mod tracker;
pub mod user;

pub use engine::OrderEngine;
pub use error::{OrderError, Result};
pub use order::Order;
pub use store::OrderStore;
pub use user::User;

/// Current time as epoch seconds. All persisted timestamps use this scale.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
