use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_types::api::Session;
use parley_types::events::{BusEvent, GatewayCommand, GatewayEvent, SubscriptionRequest};

use crate::bus::EventBus;
use crate::filter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    AuthenticationLost,
    Shutdown,
    HeartbeatTimeout,
}

/// Open a bus subscription for `request` and yield only the events that
/// `requester` may see. The listener is registered before this returns and
/// is cancelled when the stream is dropped.
pub fn authorized_events(
    bus: &EventBus,
    request: SubscriptionRequest,
    requester: Option<Uuid>,
) -> impl Stream<Item = BusEvent> + Send + use<> {
    let mut subscription = bus.subscribe(request.topic());
    async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            if filter::admits(&request, &event, requester) {
                yield event;
            } else {
                trace!(topic = %subscription.topic(), "Event filtered out for {:?}", requester);
            }
        }
    }
}

/// Serve one gateway connection until the client leaves, its session
/// expires, or the server shuts down. `session` is `None` for anonymous
/// connections; those may subscribe but every event is filtered out.
pub async fn handle_connection(
    socket: WebSocket,
    bus: EventBus,
    session: Option<Session>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = session.as_ref().map(|s| s.user_id);

    match &session {
        Some(s) => info!("{} connected to gateway", s.user_id),
        None => info!("Anonymous client connected to gateway"),
    }

    if send_event(&mut sender, &GatewayEvent::Ready { user_id }).await.is_err() {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let expires_in = session
        .as_ref()
        .map(|s| (s.expires_at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward subscription output -> client, with heartbeat and session expiry
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        let expiry = async move {
            match expires_in {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let reason = loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    let Some(event) = outgoing else {
                        break CloseReason::ClientDisconnect;
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break CloseReason::ClientDisconnect;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break CloseReason::HeartbeatTimeout;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break CloseReason::ClientDisconnect;
                    }
                }
                _ = &mut expiry => break CloseReason::AuthenticationLost,
                _ = shutdown.changed() => break CloseReason::Shutdown,
            }
        };

        if reason != CloseReason::ClientDisconnect {
            let _ = sender.send(Message::Close(None)).await;
        }
        reason
    });

    // Read commands from client; subscriptions live as long as this task
    let mut recv_task = tokio::spawn(async move {
        let mut subscriptions = Subscriptions::new(bus, user_id, out_tx);
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => subscriptions.handle(cmd),
                    Err(e) => {
                        warn!(
                            "{:?} bad command: {} -- raw: {}",
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

    // Wait for either task to finish
    let reason = tokio::select! {
        result = &mut send_task => {
            recv_task.abort();
            result.unwrap_or(CloseReason::ClientDisconnect)
        }
        _ = &mut recv_task => {
            send_task.abort();
            CloseReason::ClientDisconnect
        }
    };

    info!("{:?} disconnected from gateway ({:?})", user_id, reason);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            // Drop the one event rather than the connection
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

/// The subscriptions of one connection, keyed by client-chosen id. Each runs
/// as its own forwarding task; dropping this aborts them all, which cancels
/// their bus listeners.
pub struct Subscriptions {
    bus: EventBus,
    requester: Option<Uuid>,
    out: mpsc::UnboundedSender<GatewayEvent>,
    active: HashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    pub fn new(
        bus: EventBus,
        requester: Option<Uuid>,
        out: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        Self {
            bus,
            requester,
            out,
            active: HashMap::new(),
        }
    }

    pub fn handle(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Subscribe { id, subscription } => self.subscribe(id, subscription),
            GatewayCommand::Unsubscribe { id } => self.unsubscribe(id),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn subscribe(&mut self, id: String, request: SubscriptionRequest) {
        self.active.retain(|_, task| !task.is_finished());
        if self.active.contains_key(&id) {
            let _ = self.out.send(GatewayEvent::SubscriptionError {
                id,
                reason: "Subscription id already in use".into(),
            });
            return;
        }

        debug!("{:?} subscribing to {} as {}", self.requester, request.topic(), id);
        let events = authorized_events(&self.bus, request, self.requester);
        let out = self.out.clone();
        let subscription_id = id.clone();
        let task = tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                let forwarded = GatewayEvent::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                };
                if out.send(forwarded).is_err() {
                    break;
                }
            }
        });
        self.active.insert(id, task);
    }

    fn unsubscribe(&mut self, id: String) {
        match self.active.remove(&id) {
            Some(task) => {
                task.abort();
                let _ = self.out.send(GatewayEvent::Complete { id });
            }
            None => {
                let _ = self.out.send(GatewayEvent::SubscriptionError {
                    id,
                    reason: "Unknown subscription".into(),
                });
            }
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (_, task) in self.active.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::events::{ConversationPayload, MessageSentPayload, Topic};
    use parley_types::models::{ConversationView, MessageView, ParticipantView, UserSummary};

    fn participant(user_id: Uuid) -> ParticipantView {
        ParticipantView {
            id: Uuid::new_v4(),
            user: UserSummary {
                id: user_id,
                username: None,
            },
            has_seen_latest_message: false,
        }
    }

    fn created_for(members: &[Uuid]) -> BusEvent {
        let now = Utc::now();
        BusEvent::ConversationCreated(ConversationPayload {
            conversation: ConversationView {
                id: Uuid::new_v4(),
                created_at: now,
                updated_at: now,
                latest_message_id: None,
                latest_message: None,
                participants: members.iter().copied().map(participant).collect(),
            },
        })
    }

    fn sent_in(conversation_id: Uuid, members: &[Uuid]) -> BusEvent {
        BusEvent::MessageSent(MessageSentPayload {
            conversation_id,
            message: MessageView {
                id: Uuid::new_v4(),
                conversation_id,
                sender: UserSummary {
                    id: members[0],
                    username: None,
                },
                body: "hi".into(),
                created_at: Utc::now(),
            },
            participants: members.iter().copied().map(participant).collect(),
        })
    }

    async fn wait_for_listeners(bus: &EventBus, topic: Topic, expected: usize) {
        for _ in 0..100 {
            if bus.listener_count(topic) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} listeners on {}, found {}",
            expected,
            topic,
            bus.listener_count(topic)
        );
    }

    #[tokio::test]
    async fn authorized_events_skips_foreign_conversations() {
        let bus = EventBus::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut events = Box::pin(authorized_events(
            &bus,
            SubscriptionRequest::ConversationCreated,
            Some(a),
        ));

        bus.publish(created_for(&[b, c]));
        let visible = created_for(&[a, b]);
        bus.publish(visible.clone());

        assert_eq!(events.next().await, Some(visible));
    }

    #[tokio::test]
    async fn subscribe_forwards_only_authorized_events() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let mut subs = Subscriptions::new(bus.clone(), Some(me), tx);

        subs.handle(GatewayCommand::Subscribe {
            id: "m".into(),
            subscription: SubscriptionRequest::MessageSent { conversation_id },
        });
        assert_eq!(bus.listener_count(Topic::MessageSent), 1);

        bus.publish(sent_in(Uuid::new_v4(), &[me, other]));
        let mine = sent_in(conversation_id, &[other, me]);
        bus.publish(mine.clone());

        match rx.recv().await {
            Some(GatewayEvent::Event { subscription_id, event }) => {
                assert_eq!(subscription_id, "m");
                assert_eq!(event, mine);
            }
            other => panic!("unexpected gateway event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn anonymous_connection_receives_nothing() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let member = Uuid::new_v4();
        let mut subs = Subscriptions::new(bus.clone(), None, tx);

        subs.handle(GatewayCommand::Subscribe {
            id: "c".into(),
            subscription: SubscriptionRequest::ConversationCreated,
        });
        bus.publish(created_for(&[member]));

        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(received.is_err(), "anonymous subscriber got {:?}", received);
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new(bus.clone(), Some(Uuid::new_v4()), tx);

        for _ in 0..2 {
            subs.handle(GatewayCommand::Subscribe {
                id: "dup".into(),
                subscription: SubscriptionRequest::ConversationDeleted,
            });
        }

        assert_eq!(subs.len(), 1);
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::SubscriptionError { id, .. }) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn unsubscribe_cancels_the_listener() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new(bus.clone(), Some(Uuid::new_v4()), tx);

        subs.handle(GatewayCommand::Subscribe {
            id: "u".into(),
            subscription: SubscriptionRequest::ConversationUpdated,
        });
        subs.handle(GatewayCommand::Unsubscribe { id: "u".into() });

        assert!(matches!(rx.recv().await, Some(GatewayEvent::Complete { id }) if id == "u"));
        assert!(subs.is_empty());
        wait_for_listeners(&bus, Topic::ConversationUpdated, 0).await;
    }

    #[tokio::test]
    async fn dropping_the_connection_state_cancels_everything() {
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new(bus.clone(), Some(Uuid::new_v4()), tx);

        subs.handle(GatewayCommand::Subscribe {
            id: "a".into(),
            subscription: SubscriptionRequest::ConversationCreated,
        });
        subs.handle(GatewayCommand::Subscribe {
            id: "b".into(),
            subscription: SubscriptionRequest::ConversationDeleted,
        });
        assert_eq!(bus.listener_count(Topic::ConversationCreated), 1);

        drop(subs);

        wait_for_listeners(&bus, Topic::ConversationCreated, 0).await;
        wait_for_listeners(&bus, Topic::ConversationDeleted, 0).await;
    }
}
