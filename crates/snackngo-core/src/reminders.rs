use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One missing-info episode of an order, identified by when it began.
struct Episode {
    since: i64,
    sent: u32,
    /// The running schedule, if any.
    token: Option<CancellationToken>,
}

/// A schedule handed out by [`Reminders::arm`].
#[derive(Debug, Clone)]
pub struct Armed {
    pub token: CancellationToken,
    /// Reminders already sent in this episode.
    pub sent: u32,
}

/// Pending missing-info reminders, one episode per order. The count of
/// reminders sent outlives each schedule so re-arming never resets the bound.
#[derive(Default)]
pub struct Reminders {
    episodes: RwLock<HashMap<Uuid, Episode>>,
}

impl Reminders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reminder schedule for the episode that began at `since`.
    /// Returns `None` when one is already running or the episode has used
    /// up its `max` reminders. A different `since` starts a new episode.
    pub async fn arm(&self, order_id: Uuid, since: i64, max: u32) -> Option<Armed> {
        let mut episodes = self.episodes.write().await;
        let episode = episodes.entry(order_id).or_insert(Episode {
            since,
            sent: 0,
            token: None,
        });
        if episode.since != since {
            if let Some(token) = episode.token.take() {
                token.cancel();
            }
            *episode = Episode {
                since,
                sent: 0,
                token: None,
            };
        }
        if episode.token.is_some() || episode.sent >= max {
            return None;
        }

        let token = CancellationToken::new();
        episode.token = Some(token.clone());
        Some(Armed {
            token,
            sent: episode.sent,
        })
    }

    /// Count a reminder that went out under `token`.
    pub async fn record_sent(&self, order_id: Uuid, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        if let Some(episode) = self.episodes.write().await.get_mut(&order_id) {
            episode.sent += 1;
        }
    }

    /// End the episode: the order left missing-info or was closed.
    pub async fn cancel(&self, order_id: Uuid) {
        if let Some(token) = self
            .episodes
            .write()
            .await
            .remove(&order_id)
            .and_then(|e| e.token)
        {
            token.cancel();
        }
    }

    /// The schedule ran out. The episode and its count stay until cancelled.
    /// A cancelled schedule was already removed and may have been replaced,
    /// so it leaves the map alone.
    pub async fn finished(&self, order_id: Uuid, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        if let Some(episode) = self.episodes.write().await.get_mut(&order_id) {
            episode.token = None;
        }
    }

    pub async fn is_armed(&self, order_id: Uuid) -> bool {
        self.episodes
            .read()
            .await
            .get(&order_id)
            .is_some_and(|e| e.token.is_some())
    }

    /// Cancel every pending reminder. Used on shutdown.
    pub async fn cancel_all(&self) {
        for (_, episode) in self.episodes.write().await.drain() {
            if let Some(token) = episode.token {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINCE: i64 = 1_700_000_000;

    #[tokio::test]
    async fn arm_is_idempotent_until_cancelled() {
        let reminders = Reminders::new();
        let id = Uuid::new_v4();

        let armed = reminders.arm(id, SINCE, 3).await.unwrap();
        assert_eq!(armed.sent, 0);
        assert!(reminders.arm(id, SINCE, 3).await.is_none());

        reminders.cancel(id).await;
        assert!(armed.token.is_cancelled());
        assert!(!reminders.is_armed(id).await);
        assert!(reminders.arm(id, SINCE, 3).await.is_some());
    }

    #[tokio::test]
    async fn rearming_keeps_the_episode_count() {
        let reminders = Reminders::new();
        let id = Uuid::new_v4();

        let armed = reminders.arm(id, SINCE, 2).await.unwrap();
        reminders.record_sent(id, &armed.token).await;
        reminders.finished(id, &armed.token).await;

        let again = reminders.arm(id, SINCE, 2).await.unwrap();
        assert_eq!(again.sent, 1);
        reminders.record_sent(id, &again.token).await;
        reminders.finished(id, &again.token).await;
        assert!(reminders.arm(id, SINCE, 2).await.is_none());

        // A new episode starts from zero.
        let fresh = reminders.arm(id, SINCE + 60, 2).await.unwrap();
        assert_eq!(fresh.sent, 0);
    }
}
