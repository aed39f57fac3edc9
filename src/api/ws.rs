//! The connection gateway: authenticated bidirectional sockets, auction
//! rooms, and fan-out of bus events to locally attached connections.
//!
//! Subscriptions to the bus are per-instance, not per-socket: the instance
//! holds one subscriber connection and multiplexes it to every socket in
//! the corresponding room.

use {
    crate::{
        auth::{
            self,
            Claims,
        },
        events::{
            auction_bids_channel,
            auction_events_channel,
            AuctionChannelEvent,
            BidChannelEvent,
            BidEnvelope,
            BusChannel,
            Notification,
            NotificationKind,
            GLOBAL_NOTIFICATIONS_CHANNEL,
        },
        models::{
            AuctionId,
            AuctionStatus,
            UserId,
        },
        server::{
            EXIT_CHECK_INTERVAL,
            SHOULD_EXIT,
        },
        state::Store,
    },
    anyhow::{
        anyhow,
        Result,
    },
    axum::{
        extract::{
            ws::{
                Message,
                WebSocket,
            },
            ConnectInfo,
            Query,
            State,
            WebSocketUpgrade,
        },
        http::{
            HeaderMap,
            StatusCode,
        },
        response::{
            IntoResponse,
            Response,
        },
    },
    dashmap::DashMap,
    futures::{
        stream::{
            SplitSink,
            SplitStream,
        },
        SinkExt,
        StreamExt,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    std::{
        collections::HashSet,
        net::{
            IpAddr,
            SocketAddr,
        },
        sync::{
            atomic::Ordering,
            Arc,
        },
        time::Duration,
    },
    time::OffsetDateTime,
    tokio::sync::{
        mpsc,
        RwLock,
    },
    uuid::Uuid,
};

pub type SocketId = Uuid;

const PING_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const NOTIFICATIONS_CHAN_LEN: usize = 1000;
/// How long an instance keeps a channel subscription after its local room
/// empties; late rejoins should not thrash the bus.
const SUBSCRIPTION_IDLE_TTL: time::Duration = time::Duration::seconds(300);

/// Per-connection session record, owned by the gateway and cleaned up by a
/// single disconnect handler.
pub struct ConnectionSession {
    pub user_id:          UserId,
    pub username:         String,
    pub address:          IpAddr,
    pub rooms:            HashSet<AuctionId>,
    pub connected_at:     OffsetDateTime,
    pub token_expires_at: OffsetDateTime,
}

pub struct WsState {
    pub subscribers:      DashMap<SocketId, mpsc::Sender<ServerMessage>>,
    pub sessions:         DashMap<SocketId, ConnectionSession>,
    pub rooms:            DashMap<AuctionId, HashSet<SocketId>>,
    pub identity_sockets: DashMap<UserId, HashSet<SocketId>>,
    /// Auctions whose bus channels this instance subscribes to, with the
    /// last time the local room was seen non-empty.
    pub channel_subs:     DashMap<AuctionId, OffsetDateTime>,
    pub pubsub:           RwLock<Option<crate::cache::PubSubHandle>>,
}

impl WsState {
    pub fn new() -> Self {
        Self {
            subscribers:      DashMap::new(),
            sessions:         DashMap::new(),
            rooms:            DashMap::new(),
            identity_sockets: DashMap::new(),
            channel_subs:     DashMap::new(),
            pubsub:           RwLock::new(None),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ClientMessage {
    JoinAuction { auction_id: AuctionId },
    LeaveAuction { auction_id: AuctionId },
    PlaceBid { auction_id: AuctionId, bid_amount: i64 },
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        message:  String,
        user_id:  UserId,
        username: String,
    },
    AuctionUpdate {
        auction_id:          AuctionId,
        current_highest_bid: i64,
        bid_count:           i64,
        status:              AuctionStatus,
    },
    BidReceived { message: String },
    BidUpdate {
        auction_id: AuctionId,
        bid_id:     Uuid,
        user_id:    UserId,
        bid_amount: i64,
        #[serde(with = "time::serde::rfc3339")]
        timestamp:  OffsetDateTime,
        user:       String,
    },
    Outbid {
        auction_id:     AuctionId,
        new_bid_amount: i64,
        new_bid_user:   String,
        message:        String,
    },
    AuctionEnd {
        auction_id:  AuctionId,
        winning_bid: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        winner_id:   Option<UserId>,
        message:     String,
    },
    AuctionWon {
        auction_id:  AuctionId,
        winning_bid: i64,
        message:     String,
    },
    UserJoined { user_id: UserId, username: String },
    UserLeft { user_id: UserId, username: String },
    Error { message: String },
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Resolve the client address from forwarding headers, then the socket
/// peer.
fn resolve_client_address(headers: &HeaderMap, peer: SocketAddr, header_name: &str) -> IpAddr {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

/// Connection establishment follows a strict sequence: address resolution,
/// pre-auth admission, credential verification, identity admission,
/// tracking, `connected` ack.
pub async fn ws_route_handler(
    ws: WebSocketUpgrade,
    State(store): State<Arc<Store>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let address = resolve_client_address(&headers, peer, &store.requester_ip_header);

    let decision = store.admission.check(address, None).await;
    if !decision.allowed {
        tracing::warn!(
            %address,
            reason = ?decision.reason,
            retry_after_secs = ?decision.retry_after_secs,
            "Connection denied before authentication."
        );
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let token = query.token.as_deref().or_else(|| auth::bearer_token(&headers));
    let claims = match token.map(|token| auth::verify_token(token, &store.secret_key)) {
        Some(Ok(claims)) => claims,
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let decision = store.admission.check(address, Some(claims.sub)).await;
    if !decision.allowed {
        tracing::warn!(
            %address,
            user_id = %claims.sub,
            reason = ?decision.reason,
            retry_after_secs = ?decision.retry_after_secs,
            "Connection denied after authentication."
        );
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let tracker = store.task_tracker.clone();
    ws.on_upgrade(move |socket| tracker.track_future(websocket_handler(socket, store, claims, address)))
}

async fn websocket_handler(stream: WebSocket, store: Arc<Store>, claims: Claims, address: IpAddr) {
    let socket_id = Uuid::new_v4();
    let (notify_sender, notify_receiver) = mpsc::channel(NOTIFICATIONS_CHAN_LEN);
    let (sender, receiver) = stream.split();

    store.ws.subscribers.insert(socket_id, notify_sender);
    store.ws.sessions.insert(
        socket_id,
        ConnectionSession {
            user_id:          claims.sub,
            username:         claims.username.clone(),
            address,
            rooms:            HashSet::new(),
            connected_at:     OffsetDateTime::now_utc(),
            token_expires_at: claims.expires_at(),
        },
    );
    store
        .ws
        .identity_sockets
        .entry(claims.sub)
        .or_default()
        .insert(socket_id);
    store.admission.track(address, socket_id, Some(claims.sub)).await;
    tracing::info!(%socket_id, user_id = %claims.sub, "Socket connected.");

    let mut subscriber = Subscriber::new(socket_id, store.clone(), notify_receiver, receiver, sender);
    let connected = ServerMessage::Connected {
        message:  "connected".to_string(),
        user_id:  claims.sub,
        username: claims.username,
    };
    if subscriber.send(&connected).await.is_ok() {
        subscriber.run().await;
    }

    disconnect_cleanup(&store, socket_id).await;
}

/// A `Subscriber` is an actor handling a single socket: it relays room
/// events from the dispatch loop and routes client intents into the
/// pipeline.
struct Subscriber {
    id:                  SocketId,
    closed:              bool,
    store:               Arc<Store>,
    notify_receiver:     mpsc::Receiver<ServerMessage>,
    receiver:            SplitStream<WebSocket>,
    sender:              SplitSink<WebSocket, Message>,
    ping_interval:       tokio::time::Interval,
    exit_check_interval: tokio::time::Interval,
    responded_to_ping:   bool,
}

impl Subscriber {
    fn new(
        id: SocketId,
        store: Arc<Store>,
        notify_receiver: mpsc::Receiver<ServerMessage>,
        receiver: SplitStream<WebSocket>,
        sender: SplitSink<WebSocket, Message>,
    ) -> Self {
        Self {
            id,
            closed: false,
            store,
            notify_receiver,
            receiver,
            sender,
            ping_interval: tokio::time::interval(PING_INTERVAL_DURATION),
            exit_check_interval: tokio::time::interval(EXIT_CHECK_INTERVAL),
            // Start true so the connection is not closed before the first ping.
            responded_to_ping: true,
        }
    }

    #[tracing::instrument(skip(self), fields(socket_id = %self.id))]
    async fn run(&mut self) {
        while !self.closed {
            if let Err(err) = self.handle_next().await {
                tracing::debug!(socket_id = %self.id, error = ?err, "Closing socket.");
                break;
            }
        }
    }

    async fn handle_next(&mut self) -> Result<()> {
        tokio::select! {
            maybe_event = self.notify_receiver.recv() => {
                match maybe_event {
                    Some(event) => self.send(&event).await,
                    None => Err(anyhow!("Notify channel closed. Closing connection.")),
                }
            },
            maybe_message_or_err = self.receiver.next() => {
                self.handle_client_message(
                    maybe_message_or_err.ok_or(anyhow!("Client channel is closed"))??
                ).await
            },
            _ = self.ping_interval.tick() => {
                if !self.responded_to_ping {
                    return Err(anyhow!("Socket did not respond to ping. Closing connection."));
                }
                self.responded_to_ping = false;
                self.sender.send(Message::Ping(vec![])).await?;
                Ok(())
            },
            _ = self.exit_check_interval.tick() => {
                if SHOULD_EXIT.load(Ordering::Acquire) {
                    self.sender.close().await?;
                    self.closed = true;
                    return Err(anyhow!("Application is shutting down. Closing connection."));
                }
                Ok(())
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        self.sender
            .send(Message::Text(serde_json::to_string(message)?))
            .await?;
        Ok(())
    }

    async fn handle_client_message(&mut self, message: Message) -> Result<()> {
        let maybe_intent = match message {
            Message::Close(_) => {
                // Send the close frame back so the client does not see an
                // abnormal closure.
                self.sender.close().await?;
                self.closed = true;
                return Ok(());
            }
            Message::Text(text) => serde_json::from_str::<ClientMessage>(&text),
            Message::Binary(data) => serde_json::from_slice::<ClientMessage>(&data),
            Message::Ping(_) => {
                // Axum answers with Pong automatically.
                return Ok(());
            }
            Message::Pong(_) => {
                self.responded_to_ping = true;
                return Ok(());
            }
        };

        match maybe_intent {
            Err(err) => {
                self.send(&ServerMessage::Error {
                    message: format!("malformed message: {err}"),
                })
                .await
            }
            Ok(ClientMessage::JoinAuction { auction_id }) => self.join_auction(auction_id).await,
            Ok(ClientMessage::LeaveAuction { auction_id }) => self.leave_auction(auction_id).await,
            Ok(ClientMessage::PlaceBid { auction_id, bid_amount }) => {
                self.place_bid(auction_id, bid_amount).await
            }
        }
    }

    async fn join_auction(&mut self, auction_id: AuctionId) -> Result<()> {
        let snapshot = match load_auction_snapshot(&self.store, auction_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return self
                    .send(&ServerMessage::Error {
                        message: "auction not found".to_string(),
                    })
                    .await;
            }
            Err(err) => {
                tracing::error!(error = ?err, "Failed to load auction for join.");
                return self
                    .send(&ServerMessage::Error {
                        message: "service temporarily unavailable".to_string(),
                    })
                    .await;
            }
        };

        let (user_id, username) = {
            let Some(mut session) = self.store.ws.sessions.get_mut(&self.id) else {
                return Err(anyhow!("Session missing for connected socket"));
            };
            session.rooms.insert(auction_id);
            (session.user_id, session.username.clone())
        };
        self.store
            .ws
            .rooms
            .entry(auction_id)
            .or_default()
            .insert(self.id);
        ensure_channel_subscription(&self.store, auction_id).await;

        self.send(&ServerMessage::AuctionUpdate {
            auction_id,
            current_highest_bid: snapshot.current_highest_bid,
            bid_count: snapshot.bid_count,
            status: snapshot.status,
        })
        .await?;

        broadcast_room(
            &self.store,
            auction_id,
            ServerMessage::UserJoined { user_id, username },
            Some(self.id),
        )
        .await;
        Ok(())
    }

    async fn leave_auction(&mut self, auction_id: AuctionId) -> Result<()> {
        let left = {
            let Some(mut session) = self.store.ws.sessions.get_mut(&self.id) else {
                return Err(anyhow!("Session missing for connected socket"));
            };
            session
                .rooms
                .remove(&auction_id)
                .then(|| (session.user_id, session.username.clone()))
        };
        let Some((user_id, username)) = left else {
            return Ok(());
        };
        remove_from_room(&self.store, auction_id, self.id);
        broadcast_room(
            &self.store,
            auction_id,
            ServerMessage::UserLeft { user_id, username },
            Some(self.id),
        )
        .await;
        Ok(())
    }

    /// Forward the intent onto the queue. Amounts are not validated here;
    /// validation is authoritative only inside the processor.
    async fn place_bid(&mut self, auction_id: AuctionId, bid_amount: i64) -> Result<()> {
        let (user_id, username, token_expires_at) = {
            let Some(session) = self.store.ws.sessions.get(&self.id) else {
                return Err(anyhow!("Session missing for connected socket"));
            };
            (
                session.user_id,
                session.username.clone(),
                session.token_expires_at,
            )
        };

        if OffsetDateTime::now_utc() >= token_expires_at {
            return self
                .send(&ServerMessage::Error {
                    message: "authentication token expired".to_string(),
                })
                .await;
        }
        if !self.store.admission.check_bid_rate(user_id).await {
            return self
                .send(&ServerMessage::Error {
                    message: "too many bids, slow down".to_string(),
                })
                .await;
        }

        let envelope = BidEnvelope {
            auction_id,
            user_id,
            username,
            amount: bid_amount,
            socket_id: Some(self.id),
            submitted_at: OffsetDateTime::now_utc(),
            submission_id: Uuid::new_v4(),
        };
        if let Err(err) = self.store.queue.publish_bid_placed(&envelope).await {
            tracing::error!(error = ?err, "Failed to enqueue bid.");
            return self
                .send(&ServerMessage::Error {
                    message: "failed to submit bid, please retry".to_string(),
                })
                .await;
        }

        self.send(&ServerMessage::BidReceived {
            message: "bid received, queued for processing".to_string(),
        })
        .await
    }
}

/// Current auction state for a joining socket: the processor-written cache
/// snapshot when fresh, the store otherwise.
async fn load_auction_snapshot(
    store: &Store,
    auction_id: AuctionId,
) -> Result<Option<crate::events::AuctionSnapshot>> {
    match store
        .cache
        .get_json::<crate::events::AuctionSnapshot>(&crate::cache::auction_snapshot_key(auction_id))
        .await
    {
        Ok(Some(snapshot)) => return Ok(Some(snapshot)),
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = ?err, "Snapshot read failed, falling back to store.");
        }
    }
    let auction = store.repo.get_auction(auction_id).await?;
    Ok(auction.map(|auction| crate::events::AuctionSnapshot {
        auction_id:          auction.id,
        current_highest_bid: auction.current_highest_bid,
        bid_count:           auction.bid_count,
        status:              auction.status,
        winner_id:           auction.winner_id,
    }))
}

fn remove_from_room(store: &Store, auction_id: AuctionId, socket_id: SocketId) {
    if let Some(mut room) = store.ws.rooms.get_mut(&auction_id) {
        room.remove(&socket_id);
    }
    store.ws.rooms.remove_if(&auction_id, |_, room| room.is_empty());
    // The channel subscription is retained until TTL-driven cleanup.
}

async fn disconnect_cleanup(store: &Store, socket_id: SocketId) {
    store.ws.subscribers.remove(&socket_id);
    let session = store.ws.sessions.remove(&socket_id).map(|(_, session)| session);

    if let Some(session) = session {
        let connected_for = OffsetDateTime::now_utc() - session.connected_at;
        tracing::info!(
            %socket_id,
            user_id = %session.user_id,
            address = %session.address,
            connected_secs = connected_for.whole_seconds(),
            "Session closed."
        );
        if let Some(mut sockets) = store.ws.identity_sockets.get_mut(&session.user_id) {
            sockets.remove(&socket_id);
        }
        store
            .ws
            .identity_sockets
            .remove_if(&session.user_id, |_, sockets| sockets.is_empty());

        for auction_id in session.rooms {
            remove_from_room(store, auction_id, socket_id);
            broadcast_room(
                store,
                auction_id,
                ServerMessage::UserLeft {
                    user_id:  session.user_id,
                    username: session.username.clone(),
                },
                None,
            )
            .await;
        }
    }

    store.admission.untrack(socket_id).await;
}

/// Lazily subscribe this instance to an auction's bus channels.
async fn ensure_channel_subscription(store: &Store, auction_id: AuctionId) {
    let newly_subscribed = !store.ws.channel_subs.contains_key(&auction_id);
    store
        .ws
        .channel_subs
        .insert(auction_id, OffsetDateTime::now_utc());
    if newly_subscribed {
        if let Some(handle) = store.ws.pubsub.read().await.as_ref() {
            handle.subscribe(auction_bids_channel(auction_id));
            handle.subscribe(auction_events_channel(auction_id));
        }
    }
}

async fn send_to_socket(store: &Store, socket_id: SocketId, message: ServerMessage) {
    let Some(sender) = store
        .ws
        .subscribers
        .get(&socket_id)
        .map(|entry| entry.clone())
    else {
        return;
    };
    if sender.send(message).await.is_err() {
        // The channel is closed after an abrupt disconnection; the
        // subscriber's own cleanup removes the rest.
        store.ws.subscribers.remove(&socket_id);
    }
}

pub async fn broadcast_room(
    store: &Store,
    auction_id: AuctionId,
    message: ServerMessage,
    exclude: Option<SocketId>,
) {
    let members: Vec<SocketId> = store
        .ws
        .rooms
        .get(&auction_id)
        .map(|room| room.iter().copied().collect())
        .unwrap_or_default();
    for socket_id in members {
        if Some(socket_id) == exclude {
            continue;
        }
        send_to_socket(store, socket_id, message.clone()).await;
    }
}

pub async fn emit_to_identity(store: &Store, user_id: UserId, message: ServerMessage) {
    let sockets: Vec<SocketId> = store
        .ws
        .identity_sockets
        .get(&user_id)
        .map(|sockets| sockets.iter().copied().collect())
        .unwrap_or_default();
    for socket_id in sockets {
        send_to_socket(store, socket_id, message.clone()).await;
    }
}

/// The per-instance dispatch loop: one subscriber connection whose incoming
/// messages are routed to rooms by channel name.
pub async fn run_event_dispatcher(store: Arc<Store>) -> Result<()> {
    let (handle, mut messages) = store.cache.open_subscriber().await?;
    handle.subscribe(GLOBAL_NOTIFICATIONS_CHANNEL.to_string());
    for entry in store.ws.channel_subs.iter() {
        handle.subscribe(auction_bids_channel(*entry.key()));
        handle.subscribe(auction_events_channel(*entry.key()));
    }
    *store.ws.pubsub.write().await = Some(handle);
    tracing::info!("Event dispatcher started.");

    loop {
        if SHOULD_EXIT.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            next = messages.next() => {
                match next {
                    None => return Err(anyhow!("Pub/sub connection closed")),
                    Some((channel, payload)) => dispatch(&store, &channel, &payload).await,
                }
            }
            _ = tokio::time::sleep(EXIT_CHECK_INTERVAL) => {}
        }
    }
}

async fn dispatch(store: &Store, channel: &str, payload: &str) {
    match BusChannel::parse(channel) {
        Some(BusChannel::AuctionBids(auction_id)) => {
            match serde_json::from_str::<BidChannelEvent>(payload) {
                Ok(BidChannelEvent::BidUpdate {
                    auction_id,
                    bid_id,
                    user_id,
                    username,
                    amount,
                    timestamp,
                }) => {
                    broadcast_room(
                        store,
                        auction_id,
                        ServerMessage::BidUpdate {
                            auction_id,
                            bid_id,
                            user_id,
                            bid_amount: amount,
                            timestamp,
                            user: username,
                        },
                        None,
                    )
                    .await;
                }
                // Broadcast to the whole room; clients ignore events naming
                // themselves as the new top bidder.
                Ok(BidChannelEvent::Outbid {
                    auction_id,
                    new_bid_amount,
                    new_bid_user,
                }) => {
                    broadcast_room(
                        store,
                        auction_id,
                        ServerMessage::Outbid {
                            auction_id,
                            new_bid_amount,
                            new_bid_user: new_bid_user.clone(),
                            message: format!("{} placed a higher bid", new_bid_user),
                        },
                        None,
                    )
                    .await;
                }
                Err(err) => {
                    tracing::warn!(%auction_id, error = ?err, "Undecodable bid channel event.");
                }
            }
        }
        Some(BusChannel::AuctionEvents(auction_id)) => {
            match serde_json::from_str::<AuctionChannelEvent>(payload) {
                Ok(AuctionChannelEvent::End {
                    auction_id,
                    winning_bid,
                    winner_id,
                }) => {
                    broadcast_room(
                        store,
                        auction_id,
                        ServerMessage::AuctionEnd {
                            auction_id,
                            winning_bid,
                            winner_id,
                            message: "auction has ended".to_string(),
                        },
                        None,
                    )
                    .await;
                    if let Some(winner_id) = winner_id {
                        emit_to_identity(
                            store,
                            winner_id,
                            ServerMessage::AuctionWon {
                                auction_id,
                                winning_bid,
                                message: "congratulations, you won the auction".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Ok(AuctionChannelEvent::Cancelled { auction_id }) => {
                    broadcast_room(
                        store,
                        auction_id,
                        ServerMessage::AuctionEnd {
                            auction_id,
                            winning_bid: 0,
                            winner_id: None,
                            message: "auction was cancelled".to_string(),
                        },
                        None,
                    )
                    .await;
                }
                Err(err) => {
                    tracing::warn!(%auction_id, error = ?err, "Undecodable auction event.");
                }
            }
        }
        Some(BusChannel::GlobalNotifications) => {
            match serde_json::from_str::<Notification>(payload) {
                Ok(notification) => dispatch_notification(store, notification).await,
                Err(err) => {
                    tracing::warn!(error = ?err, "Undecodable notification.");
                }
            }
        }
        None => {
            tracing::warn!(channel, "Message on unrecognized channel.");
        }
    }
}

async fn dispatch_notification(store: &Store, notification: Notification) {
    match notification.kind {
        // Surface failures on the originating socket when it is local.
        NotificationKind::BidFailed => {
            if let Some(socket_id) = notification.socket_id {
                send_to_socket(
                    store,
                    socket_id,
                    ServerMessage::Error {
                        message: notification.message,
                    },
                )
                .await;
            }
        }
        // Winner announcements ride the auction events channel; success and
        // outbid notifications are for the external notification consumer.
        NotificationKind::BidSuccess | NotificationKind::Outbid | NotificationKind::AuctionWon => {}
    }
}

/// Drop channel subscriptions whose local room has been empty past the TTL.
pub async fn run_subscription_cleanup(store: Arc<Store>) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        if SHOULD_EXIT.load(Ordering::Acquire) {
            return Ok(());
        }
        interval.tick().await;

        let now = OffsetDateTime::now_utc();
        let mut stale = Vec::new();
        for mut entry in store.ws.channel_subs.iter_mut() {
            let auction_id = *entry.key();
            let occupied = store
                .ws
                .rooms
                .get(&auction_id)
                .map(|room| !room.is_empty())
                .unwrap_or(false);
            if occupied {
                *entry.value_mut() = now;
            } else if now - *entry.value() > SUBSCRIPTION_IDLE_TTL {
                stale.push(auction_id);
            }
        }

        for auction_id in stale {
            store.ws.channel_subs.remove(&auction_id);
            if let Some(handle) = store.ws.pubsub.read().await.as_ref() {
                handle.unsubscribe(auction_bids_channel(auction_id));
                handle.unsubscribe(auction_events_channel(auction_id));
            }
            tracing::debug!(%auction_id, "Dropped idle channel subscription.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_forwarded_address_before_peer() {
        let peer: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(
            resolve_client_address(&headers, peer, "X-Forwarded-For"),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_client_address(&HeaderMap::new(), peer, "X-Forwarded-For"),
            "192.0.2.7".parse::<IpAddr>().unwrap()
        );

        let mut garbage = HeaderMap::new();
        garbage.insert("X-Forwarded-For", "not-an-address".parse().unwrap());
        assert_eq!(
            resolve_client_address(&garbage, peer, "X-Forwarded-For"),
            "192.0.2.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_messages_use_camel_case() {
        let join: ClientMessage = serde_json::from_str(
            r#"{"type":"joinAuction","auctionId":"7f2c3a9e-1c7b-4fd2-9c34-54f1e1c4f6a2"}"#,
        )
        .unwrap();
        assert!(matches!(join, ClientMessage::JoinAuction { .. }));

        let bid: ClientMessage = serde_json::from_str(
            r#"{"type":"placeBid","auctionId":"7f2c3a9e-1c7b-4fd2-9c34-54f1e1c4f6a2","bidAmount":250100}"#,
        )
        .unwrap();
        match bid {
            ClientMessage::PlaceBid { bid_amount, .. } => assert_eq!(bid_amount, 250_100),
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn server_messages_are_tagged_events() {
        let message = ServerMessage::Outbid {
            auction_id:     Uuid::new_v4(),
            new_bid_amount: 250_200,
            new_bid_user:   "u2".to_string(),
            message:        "outbid".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "outbid");
        assert_eq!(json["newBidAmount"], 250_200);

        let end = ServerMessage::AuctionEnd {
            auction_id:  Uuid::new_v4(),
            winning_bid: 250_200,
            winner_id:   None,
            message:     "auction has ended".to_string(),
        };
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["type"], "auctionEnd");
        assert!(json.get("winnerId").is_none());
    }
}
