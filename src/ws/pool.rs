use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::NoxError;
use crate::ws::types::{WsEnvelope, WsPoolConfig};

/// Stable connection identity derived from the URL, so repeated requests for
/// the same URL share one physical socket.
fn connection_id(url: &str) -> String {
    url.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Open,
    Closed,
}

enum CloseReason {
    /// Socket dropped or errored; reconnect may apply.
    Dropped,
    /// Deliberate teardown; the entry is removed.
    Shutdown,
}

#[derive(Debug)]
struct PoolEntry {
    id: String,
    url: String,
    subscribers: StdMutex<HashSet<String>>,
    events: broadcast::Sender<WsEnvelope>,
    outbound: mpsc::UnboundedSender<Message>,
    state: watch::Sender<ConnState>,
    reconnect_count: AtomicU32,
    shutdown: Notify,
    /// Pending grace-period teardown, replaced on every re-release and
    /// cancelled by resubscription and by `destroy`.
    cleanup: StdMutex<Option<JoinHandle<()>>>,
}

impl PoolEntry {
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }

    fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    fn set_cleanup(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self
            .cleanup
            .lock()
            .expect("cleanup lock poisoned")
            .replace(handle)
        {
            previous.abort();
        }
    }

    fn cancel_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().expect("cleanup lock poisoned").take() {
            handle.abort();
        }
    }
}

struct PoolInner {
    config: WsPoolConfig,
    connections: StdMutex<HashMap<String, Arc<PoolEntry>>>,
}

impl PoolInner {
    /// Remove the entry only if the map still points at this exact entry, so
    /// a stale teardown cannot evict a replacement connection for the same URL.
    fn remove_entry(&self, entry: &Arc<PoolEntry>) {
        let mut map = self.connections.lock().expect("pool lock poisoned");
        if let Some(current) = map.get(&entry.id)
            && Arc::ptr_eq(current, entry)
        {
            map.remove(&entry.id);
        }
    }
}

/// Handle to a pooled WebSocket connection held by one subscriber.
///
/// Dropping the handle does not release the subscription; call
/// [`WsPool::release_connection`] with the same subscriber id.
#[derive(Debug)]
pub struct WsConnection {
    entry: Arc<PoolEntry>,
}

impl WsConnection {
    /// Stable identity shared by every handle for the same URL.
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn url(&self) -> &str {
        &self.entry.url
    }

    pub fn is_open(&self) -> bool {
        *self.entry.state.borrow() == ConnState::Open
    }

    /// Receive messages fanned out from the shared socket. Each subscriber
    /// gets an independent cursor; slow readers drop the oldest messages.
    pub fn subscribe(&self) -> broadcast::Receiver<WsEnvelope> {
        self.entry.events.subscribe()
    }

    /// Queue a JSON envelope for transmission on the shared socket.
    pub fn send(&self, envelope: &WsEnvelope) -> Result<(), NoxError> {
        let text = serde_json::to_string(envelope)?;
        self.entry
            .outbound
            .send(Message::Text(text))
            .map_err(|_| NoxError::Ws("connection is closed".into()))
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsPoolStats {
    pub active_connections: usize,
    pub total_subscribers: usize,
}

/// Pool of WebSocket connections deduplicated by URL.
///
/// Each physical connection is owned by a supervisor task that performs the
/// open handshake, fans inbound JSON out to subscribers, sends heartbeat
/// pings, and reconnects with exponential backoff while subscribers remain.
/// Connections released by their last subscriber linger for a grace period
/// before teardown.
///
/// The pool is an explicit dependency: construct one and pass it to whatever
/// needs realtime channels, rather than reaching for a global.
pub struct WsPool {
    inner: Arc<PoolInner>,
}

impl WsPool {
    pub fn new(config: WsPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connections: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `subscriber_id` on the connection for `url`, creating and
    /// opening the connection if no live one exists. Resolves once the open
    /// handshake completes; fails if the handshake does.
    pub async fn get_connection(
        &self,
        url: &str,
        subscriber_id: &str,
    ) -> Result<WsConnection, NoxError> {
        let id = connection_id(url);
        let entry = {
            let mut map = self.inner.connections.lock().expect("pool lock poisoned");
            match map.get(&id) {
                Some(existing) if *existing.state.borrow() != ConnState::Closed => {
                    existing.clone()
                }
                _ => {
                    let entry = spawn_entry(&self.inner, id.clone(), url, subscriber_id);
                    map.insert(id, entry.clone());
                    entry
                }
            }
        };

        entry
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(subscriber_id.to_string());
        // A resubscription within the grace period keeps the socket.
        entry.cancel_cleanup();

        let mut state_rx = entry.state.subscribe();
        match state_rx.wait_for(|state| *state != ConnState::Connecting).await {
            Ok(state) if *state == ConnState::Open => {}
            _ => {
                return Err(NoxError::Ws(format!(
                    "websocket handshake failed for {url}"
                )));
            }
        }

        Ok(WsConnection { entry })
    }

    /// Deregister `subscriber_id`. When the subscriber set becomes empty a
    /// delayed cleanup is scheduled instead of closing immediately, so a
    /// quick resubscribe keeps the socket. Releasing an unknown pair is a
    /// no-op.
    pub fn release_connection(&self, url: &str, subscriber_id: &str) {
        let id = connection_id(url);
        let entry = {
            let map = self.inner.connections.lock().expect("pool lock poisoned");
            map.get(&id).cloned()
        };
        let Some(entry) = entry else {
            return;
        };

        let now_empty = {
            let mut subscribers = entry.subscribers.lock().expect("subscriber lock poisoned");
            subscribers.remove(subscriber_id);
            subscribers.is_empty()
        };
        if !now_empty {
            return;
        }

        let grace = self.inner.config.idle_grace;
        let task_entry = entry.clone();
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            if !task_entry.has_subscribers() {
                debug!(id = %task_entry.id, "grace period elapsed with no subscribers, closing");
                task_entry.shutdown.notify_one();
            }
        });
        entry.set_cleanup(handle);
    }

    pub fn stats(&self) -> WsPoolStats {
        let map = self.inner.connections.lock().expect("pool lock poisoned");
        WsPoolStats {
            active_connections: map.len(),
            total_subscribers: map.values().map(|e| e.subscriber_count()).sum(),
        }
    }

    /// Force-close every connection and cancel all heartbeat and cleanup
    /// timers. Intended for application shutdown.
    pub fn destroy(&self) {
        let entries: Vec<Arc<PoolEntry>> = {
            let mut map = self.inner.connections.lock().expect("pool lock poisoned");
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.cancel_cleanup();
            entry.shutdown.notify_one();
        }
    }
}

impl Drop for WsPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn spawn_entry(
    inner: &Arc<PoolInner>,
    id: String,
    url: &str,
    first_subscriber: &str,
) -> Arc<PoolEntry> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(ConnState::Connecting);
    let (events_tx, _) = broadcast::channel(256);

    let entry = Arc::new(PoolEntry {
        id,
        url: url.to_string(),
        subscribers: StdMutex::new(HashSet::from([first_subscriber.to_string()])),
        events: events_tx,
        outbound: outbound_tx,
        state: state_tx,
        reconnect_count: AtomicU32::new(0),
        shutdown: Notify::new(),
        cleanup: StdMutex::new(None),
    });

    tokio::spawn(run_connection(inner.clone(), entry.clone(), outbound_rx));
    entry
}

/// Wait out the reconnect backoff. Returns false when the retry budget is
/// exhausted, subscribers are gone, or shutdown was requested.
async fn schedule_reconnect(inner: &Arc<PoolInner>, entry: &Arc<PoolEntry>) -> bool {
    if !entry.has_subscribers() {
        return false;
    }
    let attempt = entry.reconnect_count.fetch_add(1, Ordering::Relaxed);
    if attempt >= inner.config.max_reconnect_attempts {
        warn!(id = %entry.id, "reconnect attempts exhausted");
        return false;
    }

    let exp = 2u32.saturating_pow(attempt.min(16));
    let delay = (inner.config.reconnect_base_delay * exp).min(inner.config.max_reconnect_delay);
    debug!(id = %entry.id, attempt = attempt + 1, ?delay, "scheduling reconnect");

    tokio::select! {
        _ = sleep(delay) => entry.has_subscribers(),
        _ = entry.shutdown.notified() => false,
    }
}

async fn run_connection(
    inner: Arc<PoolInner>,
    entry: Arc<PoolEntry>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        entry.state.send_replace(ConnState::Connecting);

        let stream = match connect_async(entry.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(id = %entry.id, error = %err, "websocket connect failed");
                if schedule_reconnect(&inner, &entry).await {
                    continue;
                }
                break;
            }
        };

        debug!(id = %entry.id, "websocket open");
        entry.state.send_replace(ConnState::Open);
        entry.reconnect_count.store(0, Ordering::Relaxed);

        let (mut sink, mut stream) = stream.split();
        let heartbeat_period = inner.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);

        let reason = loop {
            tokio::select! {
                _ = entry.shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break CloseReason::Shutdown;
                }
                _ = heartbeat.tick() => {
                    let ping = match serde_json::to_string(&WsEnvelope::ping()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(ping)).await.is_err() {
                        break CloseReason::Dropped;
                    }
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break CloseReason::Dropped;
                        }
                    }
                    // Every sender is gone, so the entry itself is gone.
                    None => break CloseReason::Shutdown,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsEnvelope>(&text) {
                            Ok(envelope) => {
                                let _ = entry.events.send(envelope);
                            }
                            Err(err) => {
                                debug!(id = %entry.id, error = %err, "dropping unparseable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(envelope) = serde_json::from_slice::<WsEnvelope>(&bytes) {
                            let _ = entry.events.send(envelope);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break CloseReason::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(id = %entry.id, error = %err, "websocket read failed");
                        break CloseReason::Dropped;
                    }
                },
            }
        };

        match reason {
            CloseReason::Shutdown => break,
            CloseReason::Dropped => {
                debug!(id = %entry.id, "websocket closed unexpectedly");
                if schedule_reconnect(&inner, &entry).await {
                    continue;
                }
                break;
            }
        }
    }

    entry.state.send_replace(ConnState::Closed);
    entry.cancel_cleanup();
    inner.remove_entry(&entry);
}
