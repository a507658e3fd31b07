//! One shared realtime stream per user, fanned out to every registered listener.
//!
//! Per key the registry moves through `Absent → Connecting → Active → Draining → Absent`.
//! The first [`SubscriptionMultiplexer::acquire`] opens the stream; later acquires only
//! bump the reference count. When the last handle is released the stream lingers for a
//! grace period so a quick re-acquire can reuse it. Disconnects are retried with bounded
//! exponential backoff and listeners stay registered throughout.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{domain::UserId, protocol::ServerEvent};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type EventStream = BoxStream<'static, anyhow::Result<ServerEvent>>;

/// Opens the underlying realtime stream for a user.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    async fn connect(&self, user_id: UserId) -> anyhow::Result<EventStream>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Server(ServerEvent),
    /// Reconnecting has failed repeatedly; updates are not arriving.
    StreamDegraded,
    /// The stream is back after a degraded period.
    StreamRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Absent,
    Connecting,
    Active,
    Draining,
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// How long an unreferenced stream stays open. Zero tears down immediately.
    pub drain_grace: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    /// Consecutive failed connection attempts before listeners see `StreamDegraded`.
    pub degraded_after_failures: u32,
    /// A connection counts as healthy once it delivers an event or stays open this long.
    /// Shorter connections count as failures and keep the backoff growing.
    pub stable_after: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(2),
            reconnect_initial_backoff: Duration::from_millis(250),
            reconnect_max_backoff: Duration::from_secs(30),
            degraded_after_failures: 3,
            stable_after: Duration::from_secs(5),
        }
    }
}

type Listener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

struct Entry {
    generation: u64,
    state: StreamState,
    connected: bool,
    ref_count: usize,
    /// Listeners in registration order, tagged with the owning handle.
    listeners: Vec<(u64, Listener)>,
    stream_task: JoinHandle<()>,
    drain: Option<(u64, JoinHandle<()>)>,
}

impl Entry {
    fn shutdown(self) {
        self.stream_task.abort();
        if let Some((_, timer)) = self.drain {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<UserId, Entry>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Shared {
    connector: Arc<dyn EventStreamConnector>,
    config: MultiplexerConfig,
    registry: Mutex<Registry>,
}

/// Process-wide registry of shared event streams. Cloning shares the registry.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    shared: Arc<Shared>,
}

impl SubscriptionMultiplexer {
    pub fn new(connector: Arc<dyn EventStreamConnector>, config: MultiplexerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Takes a reference on the stream for `user_id`, opening it if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(&self, user_id: UserId) -> SubscriptionHandle {
        let mut guard = self.shared.registry();
        let handle_id = guard.next_id();

        if let Some(entry) = guard.entries.get_mut(&user_id) {
            entry.ref_count += 1;
            if let Some((_, timer)) = entry.drain.take() {
                timer.abort();
                entry.state = if entry.connected {
                    StreamState::Active
                } else {
                    StreamState::Connecting
                };
                debug!(%user_id, "drain cancelled by new subscriber");
            }
        } else {
            let generation = guard.next_id();
            let stream_task = tokio::spawn(run_stream(
                Arc::clone(&self.shared),
                user_id,
                generation,
            ));
            guard.entries.insert(
                user_id,
                Entry {
                    generation,
                    state: StreamState::Connecting,
                    connected: false,
                    ref_count: 1,
                    listeners: Vec::new(),
                    stream_task,
                    drain: None,
                },
            );
            debug!(%user_id, "opening shared event stream");
        }

        SubscriptionHandle {
            shared: Arc::clone(&self.shared),
            user_id,
            id: handle_id,
            released: false,
        }
    }

    pub fn state(&self, user_id: UserId) -> StreamState {
        self.shared
            .registry()
            .entries
            .get(&user_id)
            .map_or(StreamState::Absent, |entry| entry.state)
    }

    pub fn listener_count(&self, user_id: UserId) -> usize {
        self.shared
            .registry()
            .entries
            .get(&user_id)
            .map_or(0, |entry| entry.listeners.len())
    }

    pub fn ref_count(&self, user_id: UserId) -> usize {
        self.shared
            .registry()
            .entries
            .get(&user_id)
            .map_or(0, |entry| entry.ref_count)
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_listener(&self, user_id: UserId, handle_id: u64, listener: Listener) {
        if let Some(entry) = self.registry().entries.get_mut(&user_id) {
            entry.listeners.push((handle_id, listener));
        }
    }

    fn release(self: &Arc<Self>, user_id: UserId, handle_id: u64) {
        let mut guard = self.registry();
        let registry = &mut *guard;
        let Some(entry) = registry.entries.get_mut(&user_id) else {
            return;
        };
        entry.listeners.retain(|(owner, _)| *owner != handle_id);
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }

        let grace = self.config.drain_grace;
        let runtime = tokio::runtime::Handle::try_current().ok();
        if let (false, Some(runtime)) = (grace.is_zero(), runtime) {
            registry.next_id += 1;
            let drain_id = registry.next_id;
            let shared = Arc::clone(self);
            let timer = runtime.spawn(async move {
                tokio::time::sleep(grace).await;
                shared.finish_drain(user_id, drain_id);
            });
            entry.state = StreamState::Draining;
            if let Some((_, previous)) = entry.drain.replace((drain_id, timer)) {
                previous.abort();
            }
            debug!(%user_id, grace_ms = grace.as_millis() as u64, "event stream draining");
        } else if let Some(entry) = registry.entries.remove(&user_id) {
            entry.shutdown();
            info!(%user_id, "event stream closed");
        }
    }

    fn finish_drain(&self, user_id: UserId, drain_id: u64) {
        let mut guard = self.registry();
        let expired = guard.entries.get(&user_id).is_some_and(|entry| {
            entry.ref_count == 0 && matches!(entry.drain, Some((id, _)) if id == drain_id)
        });
        if !expired {
            return;
        }
        if let Some(mut entry) = guard.entries.remove(&user_id) {
            // The timer calling us is about to finish on its own.
            entry.drain = None;
            entry.shutdown();
            info!(%user_id, "event stream closed after grace period");
        }
    }

    /// Records connectivity for the current stream. Returns false when the stream this
    /// task serves has been torn down.
    fn set_connected(&self, user_id: UserId, generation: u64, connected: bool) -> bool {
        let mut guard = self.registry();
        let Some(entry) = guard
            .entries
            .get_mut(&user_id)
            .filter(|entry| entry.generation == generation)
        else {
            return false;
        };
        entry.connected = connected;
        entry.state = match (entry.state, connected) {
            (StreamState::Connecting, true) => StreamState::Active,
            (StreamState::Active, false) => StreamState::Connecting,
            (state, _) => state,
        };
        true
    }

    fn dispatch(&self, user_id: UserId, generation: u64, event: FeedEvent) {
        let listeners: Vec<Listener> = {
            let guard = self.registry();
            match guard.entries.get(&user_id) {
                Some(entry) if entry.generation == generation => entry
                    .listeners
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect(),
                _ => return,
            }
        };
        debug!(%user_id, listeners = listeners.len(), "fanning out event");
        for listener in listeners {
            listener(&event);
        }
    }
}

async fn run_stream(shared: Arc<Shared>, user_id: UserId, generation: u64) {
    let config = shared.config.clone();
    let mut backoff = config.reconnect_initial_backoff;
    let mut failures = 0u32;
    let mut degraded = false;
    let mut connected_before = false;

    loop {
        let healthy = match shared.connector.connect(user_id).await {
            Ok(mut stream) => {
                if !shared.set_connected(user_id, generation, true) {
                    return;
                }
                info!(%user_id, "event stream connected");
                if connected_before {
                    // Anything published while we were away is gone.
                    shared.dispatch(
                        user_id,
                        generation,
                        FeedEvent::Server(ServerEvent::ResyncRequired),
                    );
                }
                connected_before = true;

                let settle = tokio::time::sleep(config.stable_after);
                tokio::pin!(settle);
                let mut stable = false;
                loop {
                    let step = tokio::select! {
                        item = stream.next() => Step::Item(item),
                        () = &mut settle, if !stable => Step::Settled,
                    };
                    let settles_now = match &step {
                        Step::Settled => true,
                        Step::Item(Some(Ok(_))) => !stable,
                        Step::Item(_) => false,
                    };
                    if settles_now {
                        stable = true;
                        failures = 0;
                        backoff = config.reconnect_initial_backoff;
                        if degraded {
                            degraded = false;
                            shared.dispatch(user_id, generation, FeedEvent::StreamRestored);
                        }
                    }
                    match step {
                        Step::Settled => {}
                        Step::Item(Some(Ok(event))) => {
                            shared.dispatch(user_id, generation, FeedEvent::Server(event));
                        }
                        Step::Item(Some(Err(error))) => {
                            warn!(%user_id, %error, "event stream failed");
                            break;
                        }
                        Step::Item(None) => break,
                    }
                }
                if !shared.set_connected(user_id, generation, false) {
                    return;
                }
                warn!(%user_id, stable, "event stream disconnected, reconnecting");
                stable
            }
            Err(error) => {
                warn!(%user_id, attempt = failures + 1, %error, "event stream connect failed");
                false
            }
        };

        if !healthy {
            failures += 1;
            if !degraded && failures >= config.degraded_after_failures {
                degraded = true;
                shared.dispatch(user_id, generation, FeedEvent::StreamDegraded);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_mul(2).min(config.reconnect_max_backoff);
    }
}

enum Step {
    Item(Option<anyhow::Result<ServerEvent>>),
    Settled,
}

/// A counted reference on one user's stream. Dropping it releases the reference.
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    user_id: UserId,
    id: u64,
    released: bool,
}

impl SubscriptionHandle {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Registers a listener that lives until this handle is released. Listeners run on
    /// the stream task and should hand work off rather than block.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.shared
            .add_listener(self.user_id, self.id, Arc::new(listener));
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.user_id, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("user_id", &self.user_id)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/multiplexer_tests.rs"]
mod tests;
