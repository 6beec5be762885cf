use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::FixedOffset;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use snackngo_core::collaborators::ChatTransport;
use snackngo_core::prompt;
use snackngo_types::events::{GatewayEvent, NoticeKind, Prompt};
use snackngo_types::models::OrderStatus;

/// Order channel binding: which order a channel belongs to and who may talk in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub order_id: Uuid,
    pub user_id: Uuid,
}

/// Routes order-channel traffic to connected clients.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,

    /// Order channels: channel_id -> binding
    channels: RwLock<HashMap<String, ChannelBinding>>,

    /// Offset prompt times are rendered in
    utc_offset: FixedOffset,
}

impl Dispatcher {
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                user_channels: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                utc_offset,
            }),
        }
    }

    /// Channel name for an order. Order ids are unique, so names are too.
    pub fn channel_name(order_id: Uuid) -> String {
        format!("order-upload-{}", order_id.simple())
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    /// A newer connection replaces the older one.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user targeted channel, but only if conn_id matches.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if channels
            .get(&user_id)
            .is_some_and(|(stored, _)| *stored == conn_id)
        {
            channels.remove(&user_id);
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.user_channels.read().await.contains_key(&user_id)
    }

    /// Send a targeted event to a specific user. Returns false when the user
    /// has no live connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.user_channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Bind an existing order channel, e.g. when its owner reconnects after a restart.
    pub async fn bind_channel(&self, channel_id: String, order_id: Uuid, user_id: Uuid) {
        self.inner
            .channels
            .write()
            .await
            .insert(channel_id, ChannelBinding { order_id, user_id });
    }

    pub async fn unbind_channel(&self, channel_id: &str) {
        self.inner.channels.write().await.remove(channel_id);
    }

    pub async fn binding(&self, channel_id: &str) -> Option<ChannelBinding> {
        self.inner.channels.read().await.get(channel_id).copied()
    }

    async fn send_in_channel(&self, channel_id: &str, event: GatewayEvent) -> anyhow::Result<()> {
        let binding = self
            .binding(channel_id)
            .await
            .ok_or_else(|| anyhow!("channel {channel_id} is not bound"))?;
        if !self.send_to_user(binding.user_id, event).await {
            debug!(channel_id, user_id = %binding.user_id, "owner offline, event dropped");
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for Dispatcher {
    async fn open_channel(&self, order_id: Uuid, user_id: Uuid) -> anyhow::Result<String> {
        let channel_id = Self::channel_name(order_id);
        self.bind_channel(channel_id.clone(), order_id, user_id).await;
        self.send_to_user(
            user_id,
            GatewayEvent::ChannelOpened {
                order_id,
                channel_id: channel_id.clone(),
            },
        )
        .await;
        Ok(channel_id)
    }

    async fn prompt_user(
        &self,
        order_id: Uuid,
        channel_id: &str,
        prompt: &Prompt,
    ) -> anyhow::Result<()> {
        let event = GatewayEvent::Prompt {
            order_id,
            channel_id: channel_id.to_string(),
            text: prompt::render(prompt, self.inner.utc_offset),
            prompt: prompt.clone(),
        };
        self.send_in_channel(channel_id, event).await
    }

    async fn order_updated(
        &self,
        order_id: Uuid,
        channel_id: &str,
        status: OrderStatus,
    ) -> anyhow::Result<()> {
        let event = GatewayEvent::OrderUpdate {
            order_id,
            channel_id: channel_id.to_string(),
            status,
        };
        self.send_in_channel(channel_id, event).await
    }

    async fn close_channel(&self, order_id: Uuid, channel_id: &str) -> anyhow::Result<()> {
        self.unbind_channel(channel_id).await;
        debug!(%order_id, channel_id, "order channel closed");
        Ok(())
    }

    async fn notify_user(&self, user_id: Uuid, text: &str) -> anyhow::Result<bool> {
        let event = GatewayEvent::Notice {
            kind: NoticeKind::Broadcast,
            text: text.to_string(),
        };
        Ok(self.send_to_user(user_id, event).await)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Offset, Utc};

    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Utc.fix())
    }

    #[tokio::test]
    async fn open_channel_notifies_owner_and_routes_prompts() {
        let dispatcher = dispatcher();
        let user_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let (_, mut rx) = dispatcher.register_user_channel(user_id).await;

        let channel_id = dispatcher.open_channel(order_id, user_id).await.unwrap();
        assert!(channel_id.starts_with("order-upload-"));
        match rx.recv().await.unwrap() {
            GatewayEvent::ChannelOpened { order_id: id, channel_id: ch } => {
                assert_eq!(id, order_id);
                assert_eq!(ch, channel_id);
            }
            other => panic!("unexpected event {:?}", other),
        }

        dispatcher
            .prompt_user(order_id, &channel_id, &Prompt::ChooseApp)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            GatewayEvent::Prompt { text, prompt, .. } => {
                assert_eq!(prompt, Prompt::ChooseApp);
                assert!(!text.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn unbound_channel_is_an_error() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .prompt_user(Uuid::new_v4(), "order-upload-missing", &Prompt::ChooseApp)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn offline_owner_is_not_an_error() {
        let dispatcher = dispatcher();
        let channel_id = dispatcher
            .open_channel(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        dispatcher
            .prompt_user(Uuid::new_v4(), &channel_id, &Prompt::SendCompletionScreenshot)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_connection_does_not_unregister_newer_one() {
        let dispatcher = dispatcher();
        let user_id = Uuid::new_v4();
        let (old_conn, _old_rx) = dispatcher.register_user_channel(user_id).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(user_id).await;

        dispatcher.unregister_user_channel(user_id, old_conn).await;
        assert!(dispatcher.is_connected(user_id).await);

        let event = GatewayEvent::Error {
            channel_id: None,
            message: "x".into(),
        };
        assert!(dispatcher.send_to_user(user_id, event).await);
        assert!(new_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_channel_takes_no_more_prompts() {
        let dispatcher = dispatcher();
        let user_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let channel_id = dispatcher.open_channel(order_id, user_id).await.unwrap();

        dispatcher.close_channel(order_id, &channel_id).await.unwrap();
        assert!(dispatcher.binding(&channel_id).await.is_none());
        assert!(dispatcher
            .prompt_user(order_id, &channel_id, &Prompt::ChooseApp)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn notices_reach_only_connected_users() {
        let dispatcher = dispatcher();
        let online = Uuid::new_v4();
        let (_, mut rx) = dispatcher.register_user_channel(online).await;

        assert!(dispatcher.notify_user(online, "maintenance at noon").await.unwrap());
        assert!(!dispatcher.notify_user(Uuid::new_v4(), "maintenance at noon").await.unwrap());
        match rx.recv().await.unwrap() {
            GatewayEvent::Notice { kind, text } => {
                assert_eq!(kind, NoticeKind::Broadcast);
                assert_eq!(text, "maintenance at noon");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
