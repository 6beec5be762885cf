use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use snackngo_core::prompt::{HELP_TEXT, WELCOME_TEXT};
use snackngo_core::{OrderEngine, OrderError};
use snackngo_types::api::AccountResponse;
use snackngo_types::events::{GatewayCommand, GatewayEvent, NoticeKind};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time a client has to send Identify after connecting.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

fn encode(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("failed to encode gateway event: {}", e);
            None
        }
    }
}

/// Handle a single WebSocket connection: Identify handshake, then the
/// command loop for the identified user.
pub async fn handle_connection(
    socket: WebSocket,
    engine: OrderEngine,
    dispatcher: Dispatcher,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    // The token may outlive the account.
    let account = match engine.account(user_id).await {
        Ok(account) => account,
        Err(e) => {
            warn!("{} ({}) refused at gateway: {}", username, user_id, e);
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    for event in opening_events(user_id, &username, &account) {
        let Some(msg) = encode(&event) else { return };
        if sender.send(msg).await.is_err() {
            return;
        }
    }

    rebind_open_orders(&dispatcher, user_id, &account).await;

    run_connection_loop(sender, receiver, engine, dispatcher, user_id, username).await;
}

/// Ready, plus the welcome notice for a user who has not submitted anything yet.
fn opening_events(
    user_id: Uuid,
    username: &str,
    account: &AccountResponse,
) -> Vec<GatewayEvent> {
    let mut events = vec![GatewayEvent::Ready {
        user_id,
        username: username.to_string(),
    }];
    if account.orders.is_empty() {
        events.push(GatewayEvent::Notice {
            kind: NoticeKind::Welcome,
            text: WELCOME_TEXT.to_string(),
        });
    }
    events
}

/// Bindings do not survive a restart; bind the user's open order channels again.
async fn rebind_open_orders(dispatcher: &Dispatcher, user_id: Uuid, account: &AccountResponse) {
    for order in account.orders.iter().filter(|o| !o.status.is_terminal()) {
        dispatcher
            .bind_channel(order.channel_id.clone(), order.order_id, user_id)
            .await;
    }
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    engine: OrderEngine,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let Some(event) = result else { break };
                    let Some(msg) = encode(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => run_command(&engine, &dispatcher_recv, user_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use snackngo_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Run one client command. Screenshots run on their own task: extraction can
/// take seconds and must not hold up a Cancel sent meanwhile. Everything else
/// runs in arrival order.
async fn run_command(engine: &OrderEngine, dispatcher: &Dispatcher, user_id: Uuid, cmd: GatewayCommand) {
    if matches!(cmd, GatewayCommand::Screenshot { .. }) {
        let engine = engine.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { report(&engine, &dispatcher, user_id, cmd).await });
    } else {
        report(engine, dispatcher, user_id, cmd).await;
    }
}

/// Handle a command and send any refusal back to the user.
async fn report(engine: &OrderEngine, dispatcher: &Dispatcher, user_id: Uuid, cmd: GatewayCommand) {
    let channel_id = command_channel(&cmd).map(str::to_string);
    if let Err(e) = handle_command(engine, dispatcher, user_id, cmd).await {
        warn!(%user_id, channel_id = channel_id.as_deref().unwrap_or("-"), "command refused: {}", e);
        dispatcher
            .send_to_user(
                user_id,
                GatewayEvent::Error {
                    channel_id,
                    message: e.to_string(),
                },
            )
            .await;
    }
}

fn command_channel(cmd: &GatewayCommand) -> Option<&str> {
    match cmd {
        GatewayCommand::SelectApp { channel_id, .. }
        | GatewayCommand::Screenshot { channel_id, .. }
        | GatewayCommand::Reply { channel_id, .. }
        | GatewayCommand::Confirm { channel_id, .. }
        | GatewayCommand::Deny { channel_id, .. }
        | GatewayCommand::Cancel { channel_id } => Some(channel_id),
        GatewayCommand::Identify { .. }
        | GatewayCommand::StartOrder
        | GatewayCommand::AccountStatus
        | GatewayCommand::Help => None,
    }
}

/// Only the order's owner may act in its channel. Other users get the same
/// answer as for a channel that does not exist.
async fn require_owner(engine: &OrderEngine, user_id: Uuid, channel_id: &str) -> Result<(), OrderError> {
    let order = engine.order_for_channel(channel_id).await?;
    if order.user_id != Some(user_id) {
        return Err(OrderError::not_found("order", channel_id));
    }
    Ok(())
}

async fn handle_command(
    engine: &OrderEngine,
    dispatcher: &Dispatcher,
    user_id: Uuid,
    cmd: GatewayCommand,
) -> Result<(), OrderError> {
    if let Some(channel_id) = command_channel(&cmd) {
        require_owner(engine, user_id, channel_id).await?;
    }

    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::StartOrder => {
            engine.start_order(user_id).await?;
        }

        GatewayCommand::SelectApp { channel_id, app } => {
            engine.select_app(&channel_id, &app).await?;
        }

        GatewayCommand::Screenshot { channel_id, image_ref } => {
            engine.screenshot_received(&channel_id, &image_ref).await?;
        }

        GatewayCommand::Reply {
            channel_id,
            field,
            value,
        } => {
            engine.user_reply(&channel_id, field, &value).await?;
        }

        GatewayCommand::Confirm { channel_id, field } => {
            engine.confirm_field(&channel_id, field).await?;
        }

        GatewayCommand::Deny { channel_id, field } => {
            engine.reject_field(&channel_id, field).await?;
        }

        // The engine closes the channel once the rejection went out.
        GatewayCommand::Cancel { channel_id } => {
            engine.cancel(&channel_id).await?;
        }

        GatewayCommand::AccountStatus => {
            let account = engine.account(user_id).await?;
            dispatcher
                .send_to_user(user_id, GatewayEvent::Account(account))
                .await;
        }

        GatewayCommand::Help => {
            let notice = GatewayEvent::Notice {
                kind: NoticeKind::Help,
                text: HELP_TEXT.to_string(),
            };
            dispatcher.send_to_user(user_id, notice).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Offset, Utc};
    use tokio::sync::mpsc::UnboundedReceiver;

    use snackngo_core::OrderStore;
    use snackngo_core::collaborators::{Candidates, ExtractionError, Extractor};
    use snackngo_core::config::EngineConfig;
    use snackngo_db::Database;
    use snackngo_types::events::Prompt;
    use snackngo_types::models::{Field, FieldValue, OrderStatus, Stage};

    use super::*;

    struct ConfirmationReader;

    #[async_trait]
    impl Extractor for ConfirmationReader {
        async fn extract(&self, _: &str, stage: Stage) -> Result<Candidates, ExtractionError> {
            match stage {
                Stage::Initial => Ok(Candidates::from([
                    (Field::RestaurantName, FieldValue::Text("Cafe A".into())),
                    (Field::RestaurantAddress, FieldValue::Text("1 Main St".into())),
                    (Field::OrderPlacementTime, FieldValue::Timestamp(1_700_000_000)),
                    (Field::EarliestEstimatedArrivalTime, FieldValue::Timestamp(1_700_001_200)),
                    (Field::LatestEstimatedArrivalTime, FieldValue::Timestamp(1_700_002_400)),
                ])),
                Stage::Completion => Err(ExtractionError::NoFields),
            }
        }
    }

    fn setup() -> (OrderEngine, Dispatcher) {
        let dispatcher = Dispatcher::new(Utc.fix());
        let engine = OrderEngine::new(
            OrderStore::new(Arc::new(Database::open_in_memory().unwrap())),
            Arc::new(ConfirmationReader),
            Arc::new(dispatcher.clone()),
            EngineConfig::default(),
        );
        (engine, dispatcher)
    }

    async fn connect(
        engine: &OrderEngine,
        dispatcher: &Dispatcher,
        name: &str,
    ) -> (Uuid, UnboundedReceiver<GatewayEvent>) {
        let user = engine
            .register_user(name, &format!("{}@example.com", name))
            .await
            .unwrap();
        let (_, rx) = dispatcher.register_user_channel(user.id).await;
        (user.id, rx)
    }

    /// Drain events until one matches, failing after a second of silence.
    async fn wait_for(
        rx: &mut UnboundedReceiver<GatewayEvent>,
        wanted: impl Fn(&GatewayEvent) -> bool,
    ) -> GatewayEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("no matching event")
                .expect("channel closed");
            if wanted(&event) {
                return event;
            }
        }
    }

    async fn start(
        engine: &OrderEngine,
        dispatcher: &Dispatcher,
        user_id: Uuid,
        rx: &mut UnboundedReceiver<GatewayEvent>,
    ) -> String {
        handle_command(engine, dispatcher, user_id, GatewayCommand::StartOrder)
            .await
            .unwrap();
        match wait_for(rx, |e| matches!(e, GatewayEvent::ChannelOpened { .. })).await {
            GatewayEvent::ChannelOpened { channel_id, .. } => channel_id,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn start_order_opens_a_channel_and_asks_for_the_app() {
        let (engine, dispatcher) = setup();
        let (user_id, mut rx) = connect(&engine, &dispatcher, "amy").await;

        let channel_id = start(&engine, &dispatcher, user_id, &mut rx).await;
        assert_eq!(dispatcher.binding(&channel_id).await.map(|b| b.user_id), Some(user_id));
        match rx.recv().await.unwrap() {
            GatewayEvent::Prompt { channel_id: ch, prompt, .. } => {
                assert_eq!(ch, channel_id);
                assert_eq!(prompt, Prompt::ChooseApp);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn strangers_are_told_the_channel_does_not_exist() {
        let (engine, dispatcher) = setup();
        let (amy, mut amy_rx) = connect(&engine, &dispatcher, "amy").await;
        let (bob, mut bob_rx) = connect(&engine, &dispatcher, "bob").await;
        let channel_id = start(&engine, &dispatcher, amy, &mut amy_rx).await;

        let cmd = GatewayCommand::Cancel {
            channel_id: channel_id.clone(),
        };
        report(&engine, &dispatcher, bob, cmd).await;

        match bob_rx.recv().await.unwrap() {
            GatewayEvent::Error { channel_id: ch, message } => {
                assert_eq!(ch.as_deref(), Some(channel_id.as_str()));
                assert!(message.contains("not found"), "{message}");
            }
            other => panic!("unexpected event {:?}", other),
        }
        let order = engine.order_for_channel(&channel_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::AwaitingAppSelection);
    }

    #[tokio::test]
    async fn screenshot_runs_in_the_background_and_asks_to_confirm() {
        let (engine, dispatcher) = setup();
        let (user_id, mut rx) = connect(&engine, &dispatcher, "amy").await;
        let channel_id = start(&engine, &dispatcher, user_id, &mut rx).await;
        let select = GatewayCommand::SelectApp {
            channel_id: channel_id.clone(),
            app: "uber_eats".into(),
        };
        run_command(&engine, &dispatcher, user_id, select).await;

        let shot = GatewayCommand::Screenshot {
            channel_id: channel_id.clone(),
            image_ref: "a.png".into(),
        };
        run_command(&engine, &dispatcher, user_id, shot).await;

        let event = wait_for(&mut rx, |e| {
            matches!(e, GatewayEvent::Prompt { prompt: Prompt::ConfirmField { .. }, .. })
        })
        .await;
        assert_eq!(event.channel_id(), Some(channel_id.as_str()));
        let order = engine.order_for_channel(&channel_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::VerifyingInitialData);
    }

    #[tokio::test]
    async fn cancel_rejects_and_closes_the_channel() {
        let (engine, dispatcher) = setup();
        let (user_id, mut rx) = connect(&engine, &dispatcher, "amy").await;
        let channel_id = start(&engine, &dispatcher, user_id, &mut rx).await;

        let cmd = GatewayCommand::Cancel {
            channel_id: channel_id.clone(),
        };
        handle_command(&engine, &dispatcher, user_id, cmd).await.unwrap();

        wait_for(&mut rx, |e| {
            matches!(e, GatewayEvent::Prompt { prompt: Prompt::Rejected { .. }, .. })
        })
        .await;
        assert!(dispatcher.binding(&channel_id).await.is_none());

        let again = GatewayCommand::Cancel { channel_id };
        let err = handle_command(&engine, &dispatcher, user_id, again).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn account_and_help_answer_the_sender() {
        let (engine, dispatcher) = setup();
        let (user_id, mut rx) = connect(&engine, &dispatcher, "amy").await;
        start(&engine, &dispatcher, user_id, &mut rx).await;

        handle_command(&engine, &dispatcher, user_id, GatewayCommand::AccountStatus)
            .await
            .unwrap();
        match wait_for(&mut rx, |e| matches!(e, GatewayEvent::Account(_))).await {
            GatewayEvent::Account(account) => assert_eq!(account.orders.len(), 1),
            _ => unreachable!(),
        }

        handle_command(&engine, &dispatcher, user_id, GatewayCommand::Help)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            GatewayEvent::Notice { kind, text } => {
                assert_eq!(kind, NoticeKind::Help);
                assert_eq!(text, HELP_TEXT);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn newcomers_are_welcomed_and_open_orders_rebound() {
        let (engine, dispatcher) = setup();
        let (user_id, mut rx) = connect(&engine, &dispatcher, "amy").await;

        let account = engine.account(user_id).await.unwrap();
        let events = opening_events(user_id, "amy", &account);
        assert!(matches!(events[0], GatewayEvent::Ready { .. }));
        assert!(matches!(
            events.get(1),
            Some(GatewayEvent::Notice { kind: NoticeKind::Welcome, .. })
        ));

        let open = start(&engine, &dispatcher, user_id, &mut rx).await;
        let closed = start(&engine, &dispatcher, user_id, &mut rx).await;
        engine.cancel(&closed).await.unwrap();

        let account = engine.account(user_id).await.unwrap();
        assert_eq!(opening_events(user_id, "amy", &account).len(), 1);

        // A fresh dispatcher stands in for a restarted server.
        let restarted = Dispatcher::new(Utc.fix());
        rebind_open_orders(&restarted, user_id, &account).await;
        assert!(restarted.binding(&open).await.is_some());
        assert!(restarted.binding(&closed).await.is_none());
    }
}
