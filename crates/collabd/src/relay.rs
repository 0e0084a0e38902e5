//! Cross-instance relay over a pub/sub bus.
//!
//! Every hub broadcast is published on `collaboration:{resource_id}` tagged
//! with the publishing instance. Each instance keeps at most one subscriber
//! per resource while it has local connections there; the subscriber drops
//! its own echoes and re-broadcasts everything else to local connections
//! without publishing again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::hub::Hub;
use crate::protocol::Message;

/// Messages a memory bus channel buffers per subscriber.
const MEMORY_BUS_CAPACITY: usize = 1024;

/// Bus channel carrying a resource's traffic.
pub fn bus_channel(resource_id: &str) -> String {
    format!("collaboration:{}", resource_id)
}

/// Stream of raw payloads published on one channel.
pub type BusSubscription = BoxStream<'static, String>;

/// A pub/sub transport shared by every instance of the daemon.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()>;
    async fn subscribe(&self, channel: &str) -> anyhow::Result<BusSubscription>;
}

/// In-process bus. Cloning shares the channels, so hubs built around clones
/// of one `MemoryBus` behave like instances behind one broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_BUS_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
        // No subscribers is not an error on a pub/sub bus
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BusSubscription> {
        let rx = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[relay] Memory bus subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct Subscriber {
    refs: usize,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns this instance's bus subscribers, one per resource with local
/// connections.
pub struct Relay {
    hub: Arc<Hub>,
    bus: Arc<dyn PubSubBus>,
    poll_interval: Duration,
    subscribers: Mutex<HashMap<String, Subscriber>>,
}

impl Relay {
    pub fn new(hub: Arc<Hub>, bus: Arc<dyn PubSubBus>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            hub,
            bus,
            poll_interval,
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a subscriber runs for `resource_id` for as long as the
    /// returned guard lives.
    pub async fn attach(self: &Arc<Self>, resource_id: &str) -> anyhow::Result<RelayGuard> {
        if self.retain_existing(resource_id) {
            return Ok(self.guard(resource_id));
        }

        let stream = self.bus.subscribe(&bus_channel(resource_id)).await?;

        let mut subscribers = self.subscribers();
        if let Some(existing) = subscribers.get_mut(resource_id) {
            // Another connection raced us here; share its subscriber
            existing.refs += 1;
        } else {
            let (cancel, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(pump(
                self.hub.clone(),
                resource_id.to_string(),
                stream,
                cancel_rx,
                self.poll_interval,
            ));
            subscribers.insert(
                resource_id.to_string(),
                Subscriber {
                    refs: 1,
                    cancel,
                    task,
                },
            );
            info!("[relay] Subscribed to {}", bus_channel(resource_id));
        }
        drop(subscribers);

        Ok(self.guard(resource_id))
    }

    fn retain_existing(&self, resource_id: &str) -> bool {
        match self.subscribers().get_mut(resource_id) {
            Some(existing) => {
                existing.refs += 1;
                true
            }
            None => false,
        }
    }

    fn guard(self: &Arc<Self>, resource_id: &str) -> RelayGuard {
        RelayGuard {
            relay: self.clone(),
            resource_id: resource_id.to_string(),
        }
    }

    fn release(&self, resource_id: &str) {
        let mut subscribers = self.subscribers();
        let Some(sub) = subscribers.get_mut(resource_id) else {
            return;
        };
        sub.refs = sub.refs.saturating_sub(1);
        if sub.refs == 0 {
            if let Some(sub) = subscribers.remove(resource_id) {
                let _ = sub.cancel.send(true);
                sub.task.abort();
                info!("[relay] Unsubscribed from {}", bus_channel(resource_id));
            }
        }
    }

    /// Number of resources with a running subscriber.
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers().len()
    }

    /// Cancel every subscriber.
    pub fn shutdown(&self) {
        let mut subscribers = self.subscribers();
        for (_, sub) in subscribers.drain() {
            let _ = sub.cancel.send(true);
            sub.task.abort();
        }
    }
}

/// Keeps a resource's subscriber alive. Dropping it releases the reference.
pub struct RelayGuard {
    relay: Arc<Relay>,
    resource_id: String,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.relay.release(&self.resource_id);
    }
}

async fn pump(
    hub: Arc<Hub>,
    resource_id: String,
    mut stream: BusSubscription,
    mut cancel: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            next = tokio::time::timeout(poll_interval, stream.next()) => match next {
                // Poll interval elapsed; loop to re-check cancellation
                Err(_) => continue,
                Ok(None) => {
                    info!("[relay] Bus closed for {}", resource_id);
                    break;
                }
                Ok(Some(payload)) => forward(&hub, &resource_id, &payload),
            },
        }
    }
    debug!("[relay] Subscriber for {} stopped", resource_id);
}

fn forward(hub: &Hub, resource_id: &str, payload: &str) {
    let message: Message = match serde_json::from_str(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("[relay] Ignoring malformed payload on {}: {}", resource_id, e);
            return;
        }
    };
    if message.origin.as_deref() == Some(hub.instance_id()) {
        return;
    }
    debug!(
        "[relay] Forwarding {} from {} on {}",
        message.action,
        message.origin.as_deref().unwrap_or("unknown"),
        resource_id
    );
    hub.broadcast_local(resource_id, message);
}
