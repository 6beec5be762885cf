//! Typed access to orders and users on top of `snackngo-db`.
//!
//! All SQLite work runs on the blocking pool. Every order write is an
//! optimistic commit against the version the caller loaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use snackngo_db::Database;
use snackngo_db::models::{CommitOutcome, OrderRow, OrderVersionRow};
use snackngo_types::api::OrderVersionResponse;
use snackngo_types::models::{
    CandidateSource, Field, FieldValue, OrderStatus, Stage, UserStatus,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compensation::Award;
use crate::error::{OrderError, Result};
use crate::order::Order;
use crate::tracker::TrackerError;
use crate::unix_now;
use crate::user::User;

/// A field-level edit applied by [`OrderStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    Propose {
        value: FieldValue,
        source: CandidateSource,
    },
    Verify,
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPatch {
    pub app_used: Option<String>,
    pub fields: Vec<(Field, FieldPatch)>,
}

impl OrderPatch {
    pub fn field(mut self, field: Field, patch: FieldPatch) -> Self {
        self.fields.push((field, patch));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.app_used.is_none() && self.fields.is_empty()
    }

    /// Apply the edits to `order` in memory. Refused on terminal orders,
    /// for an empty app, and when a field would be verified without a value.
    pub fn apply(&self, order: &mut Order) -> Result<()> {
        if order.status.is_terminal() {
            return Err(OrderError::invalid(order.id, order.status, "update a closed order"));
        }

        if let Some(app) = &self.app_used {
            if app.trim().is_empty() {
                return Err(OrderError::invalid(order.id, order.status, "set an empty app"));
            }
            order.app_used = Some(app.trim().to_string());
        }

        for (field, edit) in &self.fields {
            match edit {
                FieldPatch::Propose { value, source } => {
                    order
                        .fields
                        .propose(*field, value.clone(), *source)
                        .map_err(|e| patch_error(order, e))?;
                }
                FieldPatch::Verify => {
                    order.fields.confirm(*field).map_err(|e| match e {
                        TrackerError::MissingValue(field) => OrderError::invalid(
                            order.id,
                            order.status,
                            format!("verify {} without a value", field),
                        ),
                        other => patch_error(order, other),
                    })?;
                }
                FieldPatch::Clear => {
                    order.fields.reject(*field);
                }
            }
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(field, patch)| match patch {
                FieldPatch::Propose { .. } => format!("proposed {}", field),
                FieldPatch::Verify => format!("verified {}", field),
                FieldPatch::Clear => format!("cleared {}", field),
            })
            .collect();
        if let Some(app) = &self.app_used {
            parts.insert(0, format!("app_used={}", app));
        }
        format!("patch: {}", parts.join(", "))
    }
}

#[derive(Clone)]
pub struct OrderStore {
    db: Arc<Database>,
}

impl OrderStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
            .map_err(OrderError::Storage)
    }

    // -- Users --

    pub async fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let id = Uuid::new_v4();
        let (name, mail) = (username.to_string(), email.to_string());
        let row = self
            .blocking(move |db| db.create_user(&id.to_string(), &name, &mail, unix_now()))
            .await?;
        match row {
            Some(row) => Ok(User::from_row(row)?),
            None => Err(OrderError::UsernameTaken {
                username: username.to_string(),
            }),
        }
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User> {
        let row = self
            .blocking(move |db| db.get_user_by_id(&id.to_string()))
            .await?
            .ok_or_else(|| OrderError::not_found("user", id))?;
        Ok(User::from_row(row)?)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User> {
        let name = username.to_string();
        let row = self
            .blocking(move |db| db.get_user_by_username(&name))
            .await?
            .ok_or_else(|| OrderError::not_found("user", username))?;
        Ok(User::from_row(row)?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = self.blocking(|db| db.list_users()).await?;
        Ok(rows.into_iter().map(User::from_row).collect::<anyhow::Result<_>>()?)
    }

    pub async fn set_user_status(&self, id: Uuid, status: UserStatus) -> Result<User> {
        let found = self
            .blocking(move |db| db.set_user_status(&id.to_string(), status.as_str()))
            .await?;
        if !found {
            return Err(OrderError::not_found("user", id));
        }
        self.get_user(id).await
    }

    // -- Orders --

    /// New order in the initial status bound to `channel_id`.
    pub async fn create(&self, user_id: Option<Uuid>, channel_id: &str) -> Result<Order> {
        let order = Order::new(Uuid::new_v4(), user_id, channel_id, unix_now());
        self.insert(&order).await?;
        Ok(order)
    }

    pub async fn insert(&self, order: &Order) -> Result<()> {
        let row = to_row(order);
        let snapshot = order.snapshot_json();
        let inserted = self
            .blocking(move |db| db.insert_order(&row, "created", &snapshot))
            .await?;
        if !inserted {
            return Err(OrderError::DuplicateChannel {
                channel_id: order.channel_id.clone(),
            });
        }
        debug!(order_id = %order.id, channel_id = %order.channel_id, "order created");
        Ok(())
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order> {
        let row = self
            .blocking(move |db| db.get_order(&order_id.to_string()))
            .await?
            .ok_or_else(|| OrderError::not_found("order", order_id))?;
        Ok(from_row(row)?)
    }

    pub async fn get_by_channel(&self, channel_id: &str) -> Result<Order> {
        let channel = channel_id.to_string();
        let row = self
            .blocking(move |db| db.get_order_by_channel(&channel))
            .await?
            .ok_or_else(|| OrderError::not_found("channel", channel_id))?;
        Ok(from_row(row)?)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let rows = self
            .blocking(move |db| db.list_orders_for_user(&user_id.to_string()))
            .await?;
        Ok(rows.into_iter().map(from_row).collect::<anyhow::Result<_>>()?)
    }

    pub async fn in_status(&self, status: &'static str) -> Result<Vec<Order>> {
        let rows = self.blocking(move |db| db.list_orders_in_status(status)).await?;
        Ok(rows.into_iter().map(from_row).collect::<anyhow::Result<_>>()?)
    }

    /// Apply a partial field update outside the lifecycle flow. The status
    /// is left alone; the engine's correction path settles it.
    ///
    /// Refused on terminal orders, when a field would be verified without a
    /// value, or when the result breaks an order invariant.
    pub async fn update(&self, order_id: Uuid, patch: OrderPatch) -> Result<Order> {
        let mut order = self.get(order_id).await?;
        patch.apply(&mut order)?;
        order.updated_at = unix_now();
        self.commit(&mut order, &patch.describe(), None).await?;
        Ok(order)
    }

    /// Write `order` if nobody else committed since it was loaded. Bumps the
    /// version on success and returns the raffle stage when an entry was
    /// recorded with the award.
    pub async fn commit(
        &self,
        order: &mut Order,
        change: &str,
        award: Option<&Award>,
    ) -> Result<Option<i64>> {
        order
            .check_invariants()
            .map_err(|reason| OrderError::invalid(order.id, order.status, reason))?;

        let expected = order.version;
        order.version = expected + 1;

        let row = to_row(order);
        let snapshot = order.snapshot_json();
        let change = change.to_string();
        let award_row = award.map(Award::to_row);

        let outcome = self
            .blocking(move |db| {
                db.commit_order(&row, expected, &change, &snapshot, award_row.as_ref())
            })
            .await;

        match outcome {
            Ok(CommitOutcome::Committed { raffle_stage }) => Ok(raffle_stage),
            Ok(CommitOutcome::VersionConflict { stored }) => {
                order.version = expected;
                match stored {
                    Some(stored) => {
                        warn!(order_id = %order.id, expected, stored, "order commit lost a race");
                        Err(OrderError::ConcurrencyConflict { order_id: order.id })
                    }
                    None => Err(OrderError::not_found("order", order.id)),
                }
            }
            Err(e) => {
                order.version = expected;
                Err(e)
            }
        }
    }

    pub async fn history(&self, order_id: Uuid) -> Result<Vec<OrderVersionResponse>> {
        let rows = self
            .blocking(move |db| db.order_history(&order_id.to_string()))
            .await?;
        if rows.is_empty() {
            return Err(OrderError::not_found("order", order_id));
        }
        Ok(rows.into_iter().map(version_response).collect())
    }

    /// Raffle stages a user has earned, lowest first.
    pub async fn raffle_stages(&self, user_id: Uuid) -> Result<Vec<i64>> {
        let rows = self
            .blocking(move |db| db.raffle_entries_for_user(&user_id.to_string()))
            .await?;
        Ok(rows.into_iter().map(|r| r.stage).collect())
    }
}

fn patch_error(order: &Order, err: TrackerError) -> OrderError {
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

fn version_response(row: OrderVersionRow) -> OrderVersionResponse {
    OrderVersionResponse {
        version: row.version,
        snapshot: serde_json::from_str(&row.snapshot).unwrap_or(serde_json::Value::Null),
        change: row.change,
        recorded_at: row.recorded_at,
    }
}

// -- Row mapping --

fn text(value: Option<&FieldValue>) -> Option<String> {
    value.and_then(|v| v.as_text()).map(str::to_string)
}

fn timestamp(value: Option<&FieldValue>) -> Option<i64> {
    value.and_then(|v| v.as_timestamp())
}

pub(crate) fn to_row(order: &Order) -> OrderRow {
    let fields = &order.fields;
    let sources: BTreeMap<Field, CandidateSource> = fields
        .iter()
        .filter_map(|(field, state)| state.source().map(|s| (field, s)))
        .collect();

    OrderRow {
        order_id: order.id.to_string(),
        user_id: order.user_id.map(|id| id.to_string()),
        channel_id: order.channel_id.clone(),
        compensation: order.compensation_cents,
        app_used: order.app_used.clone(),
        status: order.status.as_str().to_string(),
        resume_stage: match order.status {
            OrderStatus::CollectingMissingInfo { resume } => Some(resume.as_str().to_string()),
            _ => None,
        },

        restaurant_name: text(fields.value(Field::RestaurantName)),
        is_restaurant_name_verified: fields.is_verified(Field::RestaurantName),
        restaurant_address: text(fields.value(Field::RestaurantAddress)),
        is_restaurant_address_verified: fields.is_verified(Field::RestaurantAddress),
        order_placement_time: timestamp(fields.value(Field::OrderPlacementTime)),
        is_order_placement_time_verified: fields.is_verified(Field::OrderPlacementTime),
        earliest_estimated_arrival_time: timestamp(fields.value(Field::EarliestEstimatedArrivalTime)),
        is_earliest_estimated_arrival_time_verified: fields
            .is_verified(Field::EarliestEstimatedArrivalTime),
        latest_estimated_arrival_time: timestamp(fields.value(Field::LatestEstimatedArrivalTime)),
        is_latest_estimated_arrival_time_verified: fields
            .is_verified(Field::LatestEstimatedArrivalTime),
        order_completion_time: timestamp(fields.value(Field::OrderCompletionTime)),
        is_order_completion_time_verified: fields.is_verified(Field::OrderCompletionTime),

        placement_screenshot_path: order.screenshot(Stage::Initial).map(str::to_string),
        completion_screenshot_path: order.screenshot(Stage::Completion).map(str::to_string),
        field_sources: serde_json::to_string(&sources).unwrap_or_else(|_| "{}".to_string()),
        extraction_failures: i64::from(order.extraction_failures),
        missing_info_since: order.missing_info_since,
        rejection_reason: order.rejection_reason.clone(),
        compensation_awarded_at: order.compensation_awarded_at,
        version: order.version,
        created_at: order.created_at,
        updated_at: order.updated_at,
    }
}

pub(crate) fn from_row(row: OrderRow) -> anyhow::Result<Order> {
    let id = Uuid::parse_str(&row.order_id).with_context(|| format!("bad order id {}", row.order_id))?;
    let user_id = row
        .user_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .with_context(|| format!("order {}: bad user id", id))?;
    let status = OrderStatus::from_columns(&row.status, row.resume_stage.as_deref())
        .map_err(|e| anyhow!("order {}: {}", id, e))?;
    let sources: BTreeMap<Field, CandidateSource> = serde_json::from_str(&row.field_sources)
        .with_context(|| format!("order {}: bad field_sources", id))?;

    let columns: [(Field, Option<FieldValue>, bool); 6] = [
        (
            Field::RestaurantName,
            row.restaurant_name.clone().map(FieldValue::Text),
            row.is_restaurant_name_verified,
        ),
        (
            Field::RestaurantAddress,
            row.restaurant_address.clone().map(FieldValue::Text),
            row.is_restaurant_address_verified,
        ),
        (
            Field::OrderPlacementTime,
            row.order_placement_time.map(FieldValue::Timestamp),
            row.is_order_placement_time_verified,
        ),
        (
            Field::EarliestEstimatedArrivalTime,
            row.earliest_estimated_arrival_time.map(FieldValue::Timestamp),
            row.is_earliest_estimated_arrival_time_verified,
        ),
        (
            Field::LatestEstimatedArrivalTime,
            row.latest_estimated_arrival_time.map(FieldValue::Timestamp),
            row.is_latest_estimated_arrival_time_verified,
        ),
        (
            Field::OrderCompletionTime,
            row.order_completion_time.map(FieldValue::Timestamp),
            row.is_order_completion_time_verified,
        ),
    ];

    let mut order = Order::new(id, user_id, row.channel_id, row.created_at);
    for (field, value, verified) in columns {
        let source = sources.get(&field).copied().unwrap_or(CandidateSource::Extraction);
        order
            .fields
            .restore(field, value, verified, source)
            .map_err(|e| anyhow!("order {}: {}", id, e))?;
    }

    order.app_used = row.app_used;
    order.status = status;
    order.placement_screenshot = row.placement_screenshot_path;
    order.completion_screenshot = row.completion_screenshot_path;
    order.compensation_cents = row.compensation;
    order.compensation_awarded_at = row.compensation_awarded_at;
    order.extraction_failures = u32::try_from(row.extraction_failures).unwrap_or(0);
    order.missing_info_since = row.missing_info_since;
    order.rejection_reason = row.rejection_reason;
    order.version = row.version;
    order.updated_at = row.updated_at;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> OrderStore {
        OrderStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn manual(value: FieldValue) -> FieldPatch {
        FieldPatch::Propose {
            value,
            source: CandidateSource::Manual,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_by_channel() {
        let store = store();
        let user = store.create_user("amy", "amy@example.com").await.unwrap();
        let order = store.create(Some(user.id), "C1").await.unwrap();

        let fetched = store.get_by_channel("C1").await.unwrap();
        assert_eq!(fetched, order);
        assert_eq!(fetched.status, OrderStatus::AwaitingAppSelection);
        assert!(fetched.fields.iter().all(|(_, s)| s.value().is_none()));
    }

    #[tokio::test]
    async fn duplicate_channel_is_refused() {
        let store = store();
        store.create(None, "C1").await.unwrap();
        let err = store.create(None, "C1").await.unwrap_err();
        assert!(matches!(err, OrderError::DuplicateChannel { channel_id } if channel_id == "C1"));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = store();
        assert!(matches!(
            store.get(Uuid::new_v4()).await.unwrap_err(),
            OrderError::NotFound { .. }
        ));
        assert!(matches!(
            store.get_by_channel("nope").await.unwrap_err(),
            OrderError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn update_persists_field_states_and_versions() {
        let store = store();
        let order = store.create(None, "C1").await.unwrap();

        let patch = OrderPatch::default()
            .field(
                Field::RestaurantName,
                manual(FieldValue::Text("Cafe A".into())),
            )
            .field(Field::RestaurantName, FieldPatch::Verify)
            .field(
                Field::OrderPlacementTime,
                manual(FieldValue::Timestamp(1_700_000_000)),
            );
        let updated = store.update(order.id, patch).await.unwrap();
        assert_eq!(updated.version, 2);

        let stored = store.get(order.id).await.unwrap();
        assert!(stored.fields.is_verified(Field::RestaurantName));
        assert_eq!(
            stored.fields.value(Field::OrderPlacementTime),
            Some(&FieldValue::Timestamp(1_700_000_000))
        );
        assert!(!stored.fields.is_verified(Field::OrderPlacementTime));
        assert_eq!(
            stored.fields.state(Field::RestaurantName).source(),
            Some(CandidateSource::Manual)
        );

        let history = store.history(order.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change, "created");
        assert_eq!(history[1].version, 2);
    }

    #[tokio::test]
    async fn verify_without_value_is_an_invalid_transition() {
        let store = store();
        let order = store.create(None, "C1").await.unwrap();
        let patch = OrderPatch::default().field(Field::RestaurantAddress, FieldPatch::Verify);
        let err = store.update(order.id, patch).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(store.get(order.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn closed_orders_refuse_updates() {
        let store = store();
        let mut order = store.create(None, "C1").await.unwrap();
        order.status = OrderStatus::Rejected;
        order.rejection_reason = Some("test".into());
        store.commit(&mut order, "rejected", None).await.unwrap();

        let patch = OrderPatch::default().field(
            Field::RestaurantName,
            manual(FieldValue::Text("Cafe A".into())),
        );
        let err = store.update(order.id, patch).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stale_commit_is_a_conflict() {
        let store = store();
        let order = store.create(None, "C1").await.unwrap();

        let mut first = order.clone();
        let mut second = order.clone();
        first.app_used = Some("uber_eats".into());
        store.commit(&mut first, "app", None).await.unwrap();

        second.app_used = Some("doordash".into());
        let err = store.commit(&mut second, "app", None).await.unwrap_err();
        assert!(matches!(err, OrderError::ConcurrencyConflict { .. }));
        assert_eq!(second.version, 1);
        assert_eq!(
            store.get(order.id).await.unwrap().app_used.as_deref(),
            Some("uber_eats")
        );
    }

    #[tokio::test]
    async fn collecting_status_keeps_its_resume_stage() {
        let store = store();
        let mut order = store.create(None, "C1").await.unwrap();
        order.app_used = Some("grubhub".into());
        order.placement_screenshot = Some("a.png".into());
        order.status = OrderStatus::CollectingMissingInfo {
            resume: Stage::Initial,
        };
        order.missing_info_since = Some(10);
        order.extraction_failures = 1;
        store.commit(&mut order, "extraction failed", None).await.unwrap();

        let stored = store.get(order.id).await.unwrap();
        assert_eq!(stored, order);
        let collecting = store.in_status("collecting_missing_info").await.unwrap();
        assert_eq!(collecting.len(), 1);
    }

    #[tokio::test]
    async fn usernames_are_unique() {
        let store = store();
        store.create_user("amy", "a@example.com").await.unwrap();
        let err = store.create_user("amy", "b@example.com").await.unwrap_err();
        assert!(matches!(err, OrderError::UsernameTaken { .. }));
    }
}
