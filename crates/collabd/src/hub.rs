//! Connection registry and broadcast hub.
//!
//! The hub owns every live connection, grouped by resource and then by
//! user, plus a bounded history of recent messages per resource. All
//! registry mutation and fan-out happens under one lock, which is what
//! lets a joiner observe (history, then live traffic) with nothing
//! slipping in between.
//!
//! Delivery never blocks: each connection is fed through a bounded channel
//! drained by its own writer task, and a full or closed channel is logged
//! as a failure for that recipient only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::protocol::Message;
use crate::relay::{bus_channel, PubSubBus};

/// Outbound frames buffered per connection before deliveries start failing.
pub const CONNECTION_BUFFER: usize = 256;

/// Sending half of one participant's connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    user_id: String,
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tx,
        }
    }

    /// Create a handle together with the receiver its writer task drains.
    pub fn channel(user_id: impl Into<String>) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        (Self::new(user_id, tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an already serialized frame without waiting.
    pub fn deliver(&self, frame: Bytes) -> CollabResult<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CollabError::Transport(format!("connection {} is not keeping up", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                CollabError::Transport(format!("connection {} is closed", self.id))
            }
        })
    }

    /// Serialize and queue a single message.
    pub fn send_message(&self, message: &Message) -> CollabResult<()> {
        let frame = serde_json::to_vec(message)?;
        self.deliver(Bytes::from(frame))
    }
}

#[derive(Default)]
struct ResourceHistory {
    messages: VecDeque<Message>,
    last_stamp: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct HubState {
    /// resource_id -> user_id -> connections. Empty containers are removed eagerly.
    channels: HashMap<String, HashMap<String, Vec<ConnectionHandle>>>,
    history: HashMap<String, ResourceHistory>,
}

/// Registry of live connections and per-resource replay buffers.
pub struct Hub {
    instance_id: String,
    history_limit: usize,
    state: Mutex<HubState>,
    bus: Option<Arc<dyn PubSubBus>>,
}

impl Hub {
    /// Create a hub. With a bus, every broadcast is also published for
    /// sibling instances.
    pub fn new(
        instance_id: impl Into<String>,
        history_limit: usize,
        bus: Option<Arc<dyn PubSubBus>>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            history_limit,
            state: Mutex::new(HubState::default()),
            bus,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection to a resource.
    pub fn register(&self, resource_id: &str, conn: ConnectionHandle) {
        let mut state = self.state();
        Self::insert(&mut state, resource_id, conn);
    }

    fn insert(state: &mut HubState, resource_id: &str, conn: ConnectionHandle) {
        debug!(
            "[hub] Registering connection {} for {} on {}",
            conn.id, conn.user_id, resource_id
        );
        state
            .channels
            .entry(resource_id.to_string())
            .or_default()
            .entry(conn.user_id.clone())
            .or_default()
            .push(conn);
    }

    /// Replay history to `conn` and register it, atomically with respect to
    /// broadcasts. Returns whether a history envelope was sent.
    pub fn join(&self, resource_id: &str, conn: ConnectionHandle) -> bool {
        let mut state = self.state();
        let replayed = Self::replay_locked(&state, resource_id, &conn);
        Self::insert(&mut state, resource_id, conn);
        replayed
    }

    /// Remove a connection. Returns true when this was the user's last
    /// connection on the resource. Unknown connections are ignored.
    pub fn unregister(&self, resource_id: &str, user_id: &str, conn_id: Uuid) -> bool {
        let mut state = self.state();
        let Some(users) = state.channels.get_mut(resource_id) else {
            return false;
        };
        let Some(conns) = users.get_mut(user_id) else {
            return false;
        };

        let before = conns.len();
        conns.retain(|c| c.id != conn_id);
        let removed = conns.len() != before;

        let user_gone = conns.is_empty();
        if user_gone {
            users.remove(user_id);
        }
        if users.is_empty() {
            state.channels.remove(resource_id);
        }

        if removed {
            debug!(
                "[hub] Unregistered connection {} for {} on {}",
                conn_id, user_id, resource_id
            );
        }
        removed && user_gone
    }

    /// Fan a message out locally, then publish it for other instances.
    ///
    /// Returns the number of local connections that accepted the message.
    /// Delivery and publish failures are logged and never returned.
    pub async fn broadcast(
        &self,
        resource_id: &str,
        message: Message,
        exclude: Option<Uuid>,
    ) -> usize {
        let (delivered, stamped) = self.fan_out(resource_id, message, exclude);

        if let Some(bus) = &self.bus {
            let mut tagged = stamped;
            tagged.origin = Some(self.instance_id.clone());
            match serde_json::to_string(&tagged) {
                Ok(payload) => {
                    if let Err(e) = bus.publish(&bus_channel(resource_id), payload).await {
                        warn!("[hub] Failed to publish to bus for {}: {}", resource_id, e);
                    }
                }
                Err(e) => warn!("[hub] Failed to encode message for bus: {}", e),
            }
        }

        delivered
    }

    /// Fan a message out to this instance's connections only. Used by the
    /// relay for traffic that originated elsewhere.
    pub fn broadcast_local(&self, resource_id: &str, message: Message) -> usize {
        self.fan_out(resource_id, message, None).0
    }

    fn fan_out(
        &self,
        resource_id: &str,
        mut message: Message,
        exclude: Option<Uuid>,
    ) -> (usize, Message) {
        message.origin = None;

        let mut state = self.state();

        // Stamp, never letting a resource's clock run backwards
        let history = state.history.entry(resource_id.to_string()).or_default();
        let mut stamp = message.timestamp.unwrap_or_else(Utc::now);
        if let Some(last) = history.last_stamp {
            if stamp < last {
                stamp = last;
            }
        }
        history.last_stamp = Some(stamp);
        message.timestamp = Some(stamp);

        if self.history_limit > 0 && !message.is_presence() {
            history.messages.push_back(message.clone());
            while history.messages.len() > self.history_limit {
                history.messages.pop_front();
            }
        }

        let frame = match serde_json::to_vec(&message) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!("[hub] Failed to encode {} message: {}", message.action, e);
                return (0, message);
            }
        };

        let mut delivered = 0;
        if let Some(users) = state.channels.get(resource_id) {
            for conn in users.values().flatten() {
                if Some(conn.id) == exclude {
                    continue;
                }
                match conn.deliver(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!(
                        "[hub] Dropped {} for {} on {}: {}",
                        message.action, conn.user_id, resource_id, e
                    ),
                }
            }
        }

        debug!(
            "[hub] Broadcast {} on {} to {} connection{}",
            message.action,
            resource_id,
            delivered,
            if delivered == 1 { "" } else { "s" }
        );
        (delivered, message)
    }

    /// Send a message to every connection a user holds on a resource,
    /// bypassing history. Returns true if any connection accepted it.
    pub fn send_direct(&self, resource_id: &str, user_id: &str, message: &Message) -> bool {
        let frame = match serde_json::to_vec(message) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!("[hub] Failed to encode direct message: {}", e);
                return false;
            }
        };

        let state = self.state();
        let Some(conns) = state
            .channels
            .get(resource_id)
            .and_then(|users| users.get(user_id))
        else {
            return false;
        };

        let mut sent = false;
        for conn in conns {
            match conn.deliver(frame.clone()) {
                Ok(()) => sent = true,
                Err(e) => warn!("[hub] Direct send to {} failed: {}", user_id, e),
            }
        }
        sent
    }

    /// Users with at least one live connection on the resource.
    pub fn active_users(&self, resource_id: &str) -> HashSet<String> {
        self.state()
            .channels
            .get(resource_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, resource_id: &str) -> usize {
        self.state()
            .channels
            .get(resource_id)
            .map(|users| users.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Send the buffered history, oldest first, as one `history` envelope.
    /// Nothing is sent when the buffer is empty.
    pub fn replay_history(&self, resource_id: &str, conn: &ConnectionHandle) -> bool {
        let state = self.state();
        Self::replay_locked(&state, resource_id, conn)
    }

    fn replay_locked(state: &HubState, resource_id: &str, conn: &ConnectionHandle) -> bool {
        let Some(history) = state.history.get(resource_id) else {
            return false;
        };
        if history.messages.is_empty() {
            return false;
        }
        let envelope = Message::history(history.messages.iter().cloned().collect());
        match conn.send_message(&envelope) {
            Ok(()) => {
                debug!(
                    "[hub] Sent history ({} messages) to {} on {}",
                    history.messages.len(),
                    conn.user_id,
                    resource_id
                );
                true
            }
            Err(e) => {
                warn!("[hub] Failed to replay history on {}: {}", resource_id, e);
                false
            }
        }
    }

    /// Snapshot of the buffered history for a resource.
    pub fn history(&self, resource_id: &str) -> Vec<Message> {
        self.state()
            .history
            .get(resource_id)
            .map(|h| h.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every registered connection. Writer tasks observe their channel
    /// closing once the last sender is gone.
    pub fn close_all(&self) {
        let mut state = self.state();
        let count: usize = state
            .channels
            .values()
            .flat_map(|users| users.values())
            .map(Vec::len)
            .sum();
        state.channels.clear();
        info!("[hub] Closed {} connection(s)", count);
    }

    #[cfg(test)]
    fn has_dangling_containers(&self) -> bool {
        let state = self.state();
        state
            .channels
            .values()
            .any(|users| users.is_empty() || users.values().any(Vec::is_empty))
    }
}
