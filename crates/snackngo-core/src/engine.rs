//! The order engine: serializes events per order, runs them through the
//! lifecycle machine, commits the result and talks to the chat transport.

use std::collections::HashMap;
use std::sync::Arc;

use snackngo_types::api::{AccountResponse, OrderVersionResponse};
use snackngo_types::events::Prompt;
use snackngo_types::models::{CandidateSource, Field, OrderStatus, UserStatus};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{ChatTransport, Extractor};
use crate::compensation::Award;
use crate::config::EngineConfig;
use crate::error::{OrderError, Result};
use crate::input::parse_field_value;
use crate::lifecycle::{Effects, OrderMachine};
use crate::order::Order;
use crate::reminders::Reminders;
use crate::store::{OrderPatch, OrderStore};
use crate::unix_now;
use crate::user::User;

/// Reason recorded when the owner abandons an order.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Clone)]
pub struct OrderEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: OrderStore,
    extractor: Arc<dyn Extractor>,
    chat: Arc<dyn ChatTransport>,
    machine: OrderMachine,
    config: EngineConfig,
    /// One lock per order; different orders never wait on each other.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    reminders: Reminders,
}

impl OrderEngine {
    pub fn new(
        store: OrderStore,
        extractor: Arc<dyn Extractor>,
        chat: Arc<dyn ChatTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                extractor,
                chat,
                machine: OrderMachine::new(config.max_extraction_attempts),
                config,
                locks: Mutex::new(HashMap::new()),
                reminders: Reminders::new(),
            }),
        }
    }

    pub fn store(&self) -> &OrderStore {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -- Users --

    pub async fn register_user(&self, username: &str, email: &str) -> Result<User> {
        let user = self.inner.store.create_user(username, email).await?;
        info!(
            user_id = %user.id,
            sequence = user.sequence_number,
            category = user.compensation_category.as_str(),
            "registered {}",
            user.username
        );
        Ok(user)
    }

    pub async fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<User> {
        let user = self.inner.store.set_user_status(user_id, status).await?;
        info!(user_id = %user_id, "user status set to {}", status.as_str());
        Ok(user)
    }

    /// Total compensation, category and every order of the user.
    pub async fn account(&self, user_id: Uuid) -> Result<AccountResponse> {
        let user = self.inner.store.get_user(user_id).await?;
        let orders = self.inner.store.list_for_user(user_id).await?;
        Ok(AccountResponse {
            user: user.to_response(),
            orders: orders.iter().map(Order::summary).collect(),
        })
    }

    /// Operator notice to every active user. Returns how many users it was
    /// addressed to and how many had a live connection.
    pub async fn broadcast(&self, message: &str) -> Result<(usize, usize)> {
        let recipients: Vec<User> = self
            .inner
            .store
            .list_users()
            .await?
            .into_iter()
            .filter(User::is_active)
            .collect();

        let mut delivered = 0;
        for user in &recipients {
            match self.inner.chat.notify_user(user.id, message).await {
                Ok(true) => delivered += 1,
                Ok(false) => debug!(user_id = %user.id, "broadcast skipped offline user"),
                Err(e) => warn!(user_id = %user.id, "broadcast delivery failed: {}", e),
            }
        }
        info!(recipients = recipients.len(), delivered, "broadcast sent");
        Ok((recipients.len(), delivered))
    }

    // -- Orders --

    /// Open a channel for a new submission and ask for the delivery app.
    pub async fn start_order(&self, user_id: Uuid) -> Result<Order> {
        let user = self.inner.store.get_user(user_id).await?;
        if !user.is_active() {
            return Err(OrderError::UserInactive { user_id });
        }

        let order_id = Uuid::new_v4();
        let channel_id = self
            .inner
            .chat
            .open_channel(order_id, user_id)
            .await
            .map_err(|e| OrderError::Transport {
                order_id,
                reason: e.to_string(),
            })?;

        let order = Order::new(order_id, Some(user_id), channel_id, unix_now());
        self.inner.store.insert(&order).await?;
        info!(order_id = %order.id, channel_id = %order.channel_id, "{} started an order", user.username);

        self.send_prompt(&order, &Prompt::ChooseApp).await;
        Ok(order)
    }

    pub async fn order(&self, order_id: Uuid) -> Result<Order> {
        self.inner.store.get(order_id).await
    }

    pub async fn order_for_channel(&self, channel_id: &str) -> Result<Order> {
        self.inner.store.get_by_channel(channel_id).await
    }

    pub async fn history(&self, order_id: Uuid) -> Result<Vec<OrderVersionResponse>> {
        self.inner.store.history(order_id).await
    }

    pub async fn select_app(&self, channel_id: &str, app: &str) -> Result<Order> {
        let order_id = self.resolve(channel_id).await?;
        let app = app.to_string();
        self.transition(order_id, "select app", move |m, order, now| {
            m.select_app(order, &app, now)
        })
        .await
    }

    /// A screenshot arrived in the channel. Extraction runs before the order
    /// lock is taken; its result is applied only if the order is still
    /// waiting on evidence for the same stage.
    pub async fn screenshot_received(&self, channel_id: &str, image_ref: &str) -> Result<Order> {
        let order = self.inner.store.get_by_channel(channel_id).await?;
        let stage = self.inner.machine.screenshot_stage(&order)?;

        let outcome = self.inner.extractor.extract(image_ref, stage).await;
        match &outcome {
            Ok(candidates) => debug!(
                order_id = %order.id,
                stage = stage.as_str(),
                "extracted {} candidate(s)",
                candidates.len()
            ),
            Err(e) => warn!(order_id = %order.id, stage = stage.as_str(), "{}", e),
        }

        let image_ref = image_ref.to_string();
        self.transition(order.id, "record screenshot", move |m, order, now| {
            m.record_extraction(order, stage, &image_ref, outcome.clone(), now)
        })
        .await
    }

    /// A typed value for a field.
    pub async fn user_reply(&self, channel_id: &str, field: Field, raw: &str) -> Result<Order> {
        let order_id = self.resolve(channel_id).await?;
        let value = parse_field_value(field, raw, self.inner.config.utc_offset).map_err(|reason| {
            OrderError::InvalidValue {
                order_id,
                field,
                reason,
            }
        })?;

        self.transition(order_id, "propose", move |m, order, now| {
            m.propose(order, field, value.clone(), CandidateSource::Manual, now)
        })
        .await
    }

    pub async fn confirm_field(&self, channel_id: &str, field: Field) -> Result<Order> {
        let order_id = self.resolve(channel_id).await?;
        self.transition(order_id, "confirm", move |m, order, now| {
            m.confirm(order, field, now)
        })
        .await
    }

    pub async fn reject_field(&self, channel_id: &str, field: Field) -> Result<Order> {
        let order_id = self.resolve(channel_id).await?;
        self.transition(order_id, "reject field", move |m, order, now| {
            m.reject_field(order, field, now)
        })
        .await
    }

    pub async fn complete(&self, order_id: Uuid) -> Result<Order> {
        self.transition(order_id, "complete", |m, order, now| m.complete(order, now))
            .await
    }

    /// Operator or owner rejection. Serialized with every other event on the
    /// order, so no field change can land after it.
    pub async fn force_reject(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let reason = reason.to_string();
        self.transition(order_id, "reject", move |m, order, now| {
            m.reject_order(order, &reason, now)
        })
        .await
    }

    pub async fn cancel(&self, channel_id: &str) -> Result<Order> {
        let order_id = self.resolve(channel_id).await?;
        self.force_reject(order_id, CANCELLED_BY_USER).await
    }

    /// Operator field correction, serialized like any other event. The
    /// order settles afterwards, so a correction can advance or complete it.
    pub async fn correct_fields(&self, order_id: Uuid, patch: OrderPatch) -> Result<Order> {
        let order = self
            .transition(order_id, "correct fields", move |m, order, now| {
                m.correct(order, &patch, now)
            })
            .await?;
        info!(order_id = %order_id, version = order.version, "fields corrected");
        Ok(order)
    }

    /// Re-arm reminders for orders that were waiting on missing info when
    /// the service last stopped. Returns how many were armed.
    pub async fn resume_reminders(&self) -> Result<usize> {
        let waiting = self.inner.store.in_status("collecting_missing_info").await?;
        let count = waiting.len();
        for order in waiting {
            self.schedule_reminders(&order).await;
        }
        if count > 0 {
            info!("resumed reminders for {} order(s)", count);
        }
        Ok(count)
    }

    pub async fn shutdown(&self) {
        self.inner.reminders.cancel_all().await;
    }

    // -- internals --

    async fn resolve(&self, channel_id: &str) -> Result<Uuid> {
        Ok(self.inner.store.get_by_channel(channel_id).await?.id)
    }

    async fn lock_for(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .await
            .entry(order_id)
            .or_default()
            .clone()
    }

    /// Drop the order's lock entry once nobody else holds or waits on it.
    /// Callers clone the entry under the map lock, so the count is exact.
    async fn release_lock(&self, order_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&order_id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.inner.locks.lock().await.len()
    }

    async fn transition<F>(&self, order_id: Uuid, action: &'static str, apply: F) -> Result<Order>
    where
        F: Fn(&OrderMachine, &mut Order, i64) -> Result<Effects> + Send,
    {
        let lock = self.lock_for(order_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_and_commit(order_id, action, apply).await
        };
        self.release_lock(order_id, lock).await;
        result
    }

    /// Load, apply, commit. A lost update re-runs `apply` against the fresh
    /// row up to `max_commit_retries` times. Runs under the order lock.
    async fn apply_and_commit<F>(
        &self,
        order_id: Uuid,
        action: &'static str,
        apply: F,
    ) -> Result<Order>
    where
        F: Fn(&OrderMachine, &mut Order, i64) -> Result<Effects> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut order = self.inner.store.get(order_id).await?;
            let before = order.status;
            let now = unix_now();

            let effects = match apply(&self.inner.machine, &mut order, now) {
                Ok(effects) => effects,
                Err(e) => {
                    warn!(order_id = %order_id, "{} refused: {}", action, e);
                    return Err(e);
                }
            };
            if !effects.changed {
                debug!(order_id = %order_id, "{} was a no-op", action);
                return Ok(order);
            }

            let award = if effects.award_due {
                self.award_for(&mut order, now).await?
            } else {
                None
            };

            match self
                .inner
                .store
                .commit(&mut order, &effects.change_description(), award.as_ref())
                .await
            {
                Ok(raffle_stage) => {
                    self.after_commit(&order, before, &effects, award.as_ref(), raffle_stage)
                        .await;
                    return Ok(order);
                }
                Err(OrderError::ConcurrencyConflict { .. })
                    if attempt < self.inner.config.max_commit_retries =>
                {
                    attempt += 1;
                    warn!(order_id = %order_id, attempt, "{} lost a race, retrying", action);
                }
                Err(e) => {
                    if matches!(e, OrderError::Storage(_)) {
                        error!(order_id = %order_id, "{} failed: {}", action, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn award_for(&self, order: &mut Order, now: i64) -> Result<Option<Award>> {
        let user = match order.user_id {
            Some(user_id) => match self.inner.store.get_user(user_id).await {
                Ok(user) => Some(user),
                Err(OrderError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let award = self.inner.config.compensation.award(order, user.as_ref(), now);
        if award.is_none() {
            info!(order_id = %order.id, "completed without an owner to award");
        }
        Ok(award)
    }

    async fn after_commit(
        &self,
        order: &Order,
        before: OrderStatus,
        effects: &Effects,
        award: Option<&Award>,
        raffle_stage: Option<i64>,
    ) {
        debug!(order_id = %order.id, version = order.version, "{}", effects.change_description());

        if order.status != before {
            if let Err(e) = self
                .inner
                .chat
                .order_updated(order.id, &order.channel_id, order.status)
                .await
            {
                warn!(order_id = %order.id, "status notification failed: {}", e);
            }
        }

        for prompt in &effects.prompts {
            self.send_prompt(order, prompt).await;
        }

        if effects.award_due {
            info!(
                order_id = %order.id,
                cents = order.compensation_cents,
                raffle_stage,
                "order completed"
            );
            let prompt = Prompt::Completed {
                compensation_cents: order.compensation_cents,
                category: award.map(|a| a.category),
                raffle_stage,
            };
            self.send_prompt(order, &prompt).await;
        }

        match order.status {
            OrderStatus::CollectingMissingInfo { .. } => self.schedule_reminders(order).await,
            _ => self.inner.reminders.cancel(order.id).await,
        }

        if order.status == OrderStatus::Rejected {
            info!(
                order_id = %order.id,
                reason = order.rejection_reason.as_deref().unwrap_or_default(),
                "order rejected"
            );
        }

        if order.status.is_terminal() {
            if let Err(e) = self.inner.chat.close_channel(order.id, &order.channel_id).await {
                warn!(order_id = %order.id, channel_id = %order.channel_id, "channel close failed: {}", e);
            }
        }
    }

    async fn send_prompt(&self, order: &Order, prompt: &Prompt) {
        if let Err(e) = self
            .inner
            .chat
            .prompt_user(order.id, &order.channel_id, prompt)
            .await
        {
            warn!(order_id = %order.id, channel_id = %order.channel_id, "prompt delivery failed: {}", e);
        }
    }

    /// Arm reminders for the order's current missing-info episode. The
    /// bound covers the whole episode, however often it is re-armed.
    async fn schedule_reminders(&self, order: &Order) {
        let max = self.inner.config.max_reminders;
        let Some(since) = order.missing_info_since else {
            return;
        };
        let order_id = order.id;
        let Some(armed) = self.inner.reminders.arm(order_id, since, max).await else {
            return;
        };

        let engine = self.clone();
        let delay = self.inner.config.reminder_delay;
        let token = armed.token;
        tokio::spawn(async move {
            for sent in armed.sent + 1..=max {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match engine.remind(order_id).await {
                    Ok(true) => {
                        engine.inner.reminders.record_sent(order_id, &token).await;
                        debug!(order_id = %order_id, "reminder {}/{} sent", sent, max);
                    }
                    Ok(false) => break,
                    Err(e) => {
                        warn!(order_id = %order_id, "reminder failed: {}", e);
                        break;
                    }
                }
            }
            engine.inner.reminders.finished(order_id, &token).await;
        });
    }

    /// Post a missing-info reminder if the order is still waiting. Never
    /// changes the order.
    async fn remind(&self, order_id: Uuid) -> Result<bool> {
        let order = self.inner.store.get(order_id).await?;
        if !matches!(order.status, OrderStatus::CollectingMissingInfo { .. }) {
            return Ok(false);
        }
        let prompt = Prompt::Reminder {
            fields: order.missing_fields(),
        };
        self.send_prompt(&order, &prompt).await;
        Ok(true)
    }
}
