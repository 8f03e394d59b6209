//! WebSocket Subscription Hub
//!
//! Single-process fan-out of view invalidations. Clients subscribe to
//! views by name; every committed mutation broadcasts an `update` frame
//! to the subscribers of each view whose dependency set contains a
//! mutated table. The hub never computes deltas; clients refetch
//! through the normal view endpoint, which keeps a subscriber at most
//! one round-trip stale.
//!
//! The subscriber map is locked only to mutate or snapshot the set;
//! frames are sent outside the lock and dead senders are pruned on the
//! next broadcast.

use crate::auth::{bearer_token, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::views::{self, ViewQuery};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Idle cutoff: a socket silent for this long is disconnected.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// FRAMES
// ============================================================================

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { view: String },
    Unsubscribe { view: String },
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Current view contents, sent once on subscribe.
    Snapshot {
        view: String,
        items: Vec<serde_json::Value>,
    },
    /// The view's dependencies changed; refetch.
    Update { view: String },
    /// The artifact was hot-swapped.
    ArtifactReload,
}

// ============================================================================
// HUB
// ============================================================================

struct Subscriber {
    socket_id: u64,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// The subscription hub. One per server.
pub struct SubscriptionHub {
    subscribers: DashMap<String, Vec<Subscriber>>,
    reload_tx: broadcast::Sender<ServerFrame>,
    next_socket_id: AtomicU64,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        let (reload_tx, _) = broadcast::channel(16);
        Self {
            subscribers: DashMap::new(),
            reload_tx,
            next_socket_id: AtomicU64::new(1),
        }
    }

    /// Allocate a socket identity.
    pub fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a socket to a view's subscriber set.
    pub fn subscribe(&self, view: &str, socket_id: u64, tx: mpsc::UnboundedSender<ServerFrame>) {
        let mut entry = self.subscribers.entry(view.to_string()).or_default();
        if !entry.iter().any(|s| s.socket_id == socket_id) {
            entry.push(Subscriber { socket_id, tx });
        }
    }

    /// Remove a socket from a view's subscriber set; drop the set when
    /// it empties.
    pub fn unsubscribe(&self, view: &str, socket_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(view) {
            entry.retain(|s| s.socket_id != socket_id);
        }
        self.subscribers
            .remove_if(view, |_, subscribers| subscribers.is_empty());
    }

    /// Remove a closed socket everywhere.
    pub fn remove_socket(&self, socket_id: u64) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|s| s.socket_id != socket_id);
        }
        self.subscribers.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Push an invalidation frame to every live subscriber of a view.
    /// The subscriber list is snapshotted under the lock, sends happen
    /// outside it, and closed senders are pruned afterwards.
    pub fn broadcast_view(&self, view: &str) {
        let targets: Vec<(u64, mpsc::UnboundedSender<ServerFrame>)> = match self
            .subscribers
            .get(view)
        {
            Some(entry) => entry
                .iter()
                .map(|s| (s.socket_id, s.tx.clone()))
                .collect(),
            None => return,
        };

        let frame = ServerFrame::Update {
            view: view.to_string(),
        };
        let mut dead = Vec::new();
        for (socket_id, tx) in targets {
            if tx.send(frame.clone()).is_err() {
                dead.push(socket_id);
            }
        }
        for socket_id in dead {
            self.unsubscribe(view, socket_id);
        }
        debug!(view, "Broadcast invalidation");
    }

    /// Invalidate every view depending on any of the mutated tables.
    pub fn broadcast_tables<'a>(
        &self,
        artifact: &forge_core::Artifact,
        tables: impl IntoIterator<Item = &'a str>,
    ) {
        let mut views: Vec<String> = Vec::new();
        for table in tables {
            for view in artifact.views_depending_on(table) {
                if !views.contains(&view.name) {
                    views.push(view.name.clone());
                }
            }
        }
        for view in views {
            self.broadcast_view(&view);
        }
    }

    /// Channel every connected socket listens on for reload frames.
    pub fn reload_receiver(&self) -> broadcast::Receiver<ServerFrame> {
        self.reload_tx.subscribe()
    }

    /// Announce an artifact swap to all connected sockets.
    pub fn notify_reload(&self) {
        let _ = self.reload_tx.send(ServerFrame::ArtifactReload);
    }

    /// Number of live subscriptions (tests and introspection).
    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }
}

// ============================================================================
// SOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler. The bearer credential rides either the
/// Authorization header or a `token` query parameter (browsers cannot
/// set headers on WebSocket connects).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let token = bearer_token(&headers).or_else(|| params.get("token").cloned());
    let ctx = state.auth.authenticate(token.as_deref())?;
    if state.auth.provider_kind() != crate::config::AuthProviderKind::None
        && !ctx.is_authenticated()
    {
        return Err(ApiError::auth_required());
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, ctx)))
}

/// Runs for the lifetime of one WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, ctx: AuthContext) {
    let socket_id = state.hub.next_socket_id();
    info!(socket_id, user_id = ?ctx.user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut reload_rx = state.hub.reload_receiver();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { view }) => {
                                handle_subscribe(&state, &ctx, socket_id, &view, &frame_tx, &mut sender).await;
                            }
                            Ok(ClientFrame::Unsubscribe { view }) => {
                                state.hub.unsubscribe(&view, socket_id);
                            }
                            Err(e) => {
                                debug!(socket_id, error = %e, "Ignoring malformed client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => {
                        warn!(socket_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            reload = reload_rx.recv() => {
                match reload {
                    Ok(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(socket_id, skipped, "Reload channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > IDLE_TIMEOUT {
                    info!(socket_id, "WebSocket idle timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.remove_socket(socket_id);
    info!(socket_id, "WebSocket disconnected");
}

/// Register the subscription and send the initial snapshot by running
/// the view once under the subscriber's identity.
async fn handle_subscribe(
    state: &AppState,
    ctx: &AuthContext,
    socket_id: u64,
    view: &str,
    frame_tx: &mpsc::UnboundedSender<ServerFrame>,
    sender: &mut (impl SinkExt<Message> + Unpin),
) {
    let artifact = state.artifact.current().await;
    if !artifact.views.contains_key(view) {
        debug!(socket_id, view, "Subscribe to unknown view ignored");
        return;
    }
    state.hub.subscribe(view, socket_id, frame_tx.clone());

    match views::execute_view(state, &artifact, view, ViewQuery::default(), ctx).await {
        Ok(page) => {
            let frame = ServerFrame::Snapshot {
                view: view.to_string(),
                items: page.items,
            };
            let _ = send_frame(sender, &frame).await;
        }
        Err(e) => {
            warn!(socket_id, view, error = %e, "Snapshot query failed");
        }
    }
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: &ServerFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_unsubscribe_lifecycle() {
        let hub = SubscriptionHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.next_socket_id();

        hub.subscribe("TicketList", id, tx);
        assert_eq!(hub.subscription_count(), 1);

        hub.unsubscribe("TicketList", id);
        assert_eq!(hub.subscription_count(), 0);
        // Empty sets are removed entirely.
        assert!(hub.subscribers.get("TicketList").is_none());
    }

    #[test]
    fn test_broadcast_reaches_subscriber() {
        let hub = SubscriptionHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe("TicketList", hub.next_socket_id(), tx);

        hub.broadcast_view("TicketList");
        let frame = rx.try_recv().expect("frame");
        assert_eq!(
            frame,
            ServerFrame::Update {
                view: "TicketList".to_string()
            }
        );
    }

    #[test]
    fn test_dead_subscribers_pruned_on_broadcast() {
        let hub = SubscriptionHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe("TicketList", hub.next_socket_id(), tx);
        drop(rx);

        hub.broadcast_view("TicketList");
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let hub = SubscriptionHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.next_socket_id();
        hub.subscribe("V", id, tx.clone());
        hub.subscribe("V", id, tx);
        assert_eq!(hub.subscription_count(), 1);
    }

    #[test]
    fn test_remove_socket_clears_all_views() {
        let hub = SubscriptionHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.next_socket_id();
        hub.subscribe("A", id, tx.clone());
        hub.subscribe("B", id, tx);
        hub.remove_socket(id);
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_client_frame_wire_shape() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","view":"TicketList"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                view: "TicketList".to_string()
            }
        );

        let out = serde_json::to_value(ServerFrame::ArtifactReload).unwrap();
        assert_eq!(out["type"], "artifact_reload");
    }
}
