use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use shared::domain::ConversationId;
use shared::protocol::ConversationChange;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const ALICE: UserId = UserId(1);
const GRACE: Duration = Duration::from_millis(500);

type EventSender = mpsc::UnboundedSender<anyhow::Result<ServerEvent>>;

#[derive(Default)]
struct FakeConnector {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    /// Streams fail right after connecting.
    flapping: AtomicBool,
    senders: Mutex<Vec<EventSender>>,
}

impl FakeConnector {
    fn failing(times: usize) -> Self {
        let connector = Self::default();
        connector.failures_left.store(times, Ordering::SeqCst);
        connector
    }

    fn flapping() -> Self {
        let connector = Self::default();
        connector.flapping.store(true, Ordering::SeqCst);
        connector
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn connections(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    fn latest(&self) -> EventSender {
        self.senders.lock().unwrap().last().cloned().expect("no stream opened")
    }
}

#[async_trait]
impl EventStreamConnector for FakeConnector {
    async fn connect(&self, _user_id: UserId) -> anyhow::Result<EventStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow::anyhow!("connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if self.flapping.load(Ordering::SeqCst) {
            tx.send(Err(anyhow::anyhow!("closed during handshake"))).unwrap();
        }
        self.senders.lock().unwrap().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

fn config() -> MultiplexerConfig {
    MultiplexerConfig {
        drain_grace: GRACE,
        reconnect_initial_backoff: Duration::from_millis(100),
        reconnect_max_backoff: Duration::from_millis(400),
        degraded_after_failures: 3,
        stable_after: Duration::from_secs(1),
    }
}

fn setup(connector: FakeConnector) -> (Arc<FakeConnector>, SubscriptionMultiplexer) {
    let connector = Arc::new(connector);
    let multiplexer = SubscriptionMultiplexer::new(connector.clone(), config());
    (connector, multiplexer)
}

fn recorder(handle: &SubscriptionHandle) -> Arc<Mutex<Vec<FeedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle.on_event(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

fn pinned(conversation: i64) -> ServerEvent {
    ServerEvent::ConversationUpdated {
        conversation_id: ConversationId(conversation),
        change: ConversationChange::Pinned,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn handles_for_same_user_share_one_stream() {
    let (connector, multiplexer) = setup(FakeConnector::default());
    let first = multiplexer.acquire(ALICE);
    let second = multiplexer.acquire(ALICE);
    let first_seen = recorder(&first);
    let second_seen = recorder(&second);

    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;
    assert_eq!(connector.connections(), 1);
    assert_eq!(multiplexer.ref_count(ALICE), 2);
    assert_eq!(multiplexer.listener_count(ALICE), 2);

    connector.latest().send(Ok(pinned(1))).unwrap();
    wait_for(|| second_seen.lock().unwrap().len() == 1).await;
    assert_eq!(first_seen.lock().unwrap().len(), 1);

    first.release();
    assert_eq!(multiplexer.listener_count(ALICE), 1);
    assert_eq!(multiplexer.state(ALICE), StreamState::Active);

    connector.latest().send(Ok(pinned(2))).unwrap();
    wait_for(|| second_seen.lock().unwrap().len() == 2).await;
    assert_eq!(first_seen.lock().unwrap().len(), 1);
    assert_eq!(connector.connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn reacquire_during_grace_reuses_stream() {
    let (connector, multiplexer) = setup(FakeConnector::default());
    let handle = multiplexer.acquire(ALICE);
    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;

    handle.release();
    assert_eq!(multiplexer.state(ALICE), StreamState::Draining);

    tokio::time::sleep(GRACE / 2).await;
    let handle = multiplexer.acquire(ALICE);
    assert_eq!(multiplexer.state(ALICE), StreamState::Active);

    // The cancelled drain timer must not fire later.
    tokio::time::sleep(GRACE).await;
    assert_eq!(multiplexer.state(ALICE), StreamState::Active);
    assert_eq!(connector.connections(), 1);
    drop(handle);
}

#[tokio::test(start_paused = true)]
async fn stream_closes_after_grace_period() {
    let (connector, multiplexer) = setup(FakeConnector::default());
    let handle = multiplexer.acquire(ALICE);
    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;

    drop(handle);
    assert_eq!(multiplexer.state(ALICE), StreamState::Draining);

    tokio::time::sleep(GRACE + Duration::from_millis(10)).await;
    assert_eq!(multiplexer.state(ALICE), StreamState::Absent);
    wait_for(|| connector.latest().is_closed()).await;

    let _again = multiplexer.acquire(ALICE);
    wait_for(|| connector.connections() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn zero_grace_closes_immediately() {
    let connector = Arc::new(FakeConnector::default());
    let multiplexer = SubscriptionMultiplexer::new(
        connector.clone(),
        MultiplexerConfig {
            drain_grace: Duration::ZERO,
            ..config()
        },
    );
    let handle = multiplexer.acquire(ALICE);
    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;

    handle.release();
    assert_eq!(multiplexer.state(ALICE), StreamState::Absent);
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_listeners_and_asks_for_resync() {
    let (connector, multiplexer) = setup(FakeConnector::default());
    let handle = multiplexer.acquire(ALICE);
    let seen = recorder(&handle);
    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;

    connector.latest().send(Err(anyhow::anyhow!("reset by peer"))).unwrap();
    wait_for(|| connector.connections() == 2).await;
    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;

    connector.latest().send(Ok(pinned(7))).unwrap();
    wait_for(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            FeedEvent::Server(ServerEvent::ResyncRequired),
            FeedEvent::Server(pinned(7)),
        ]
    );
    assert_eq!(multiplexer.listener_count(ALICE), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_report_degraded_then_restored() {
    let (connector, multiplexer) = setup(FakeConnector::failing(4));
    let handle = multiplexer.acquire(ALICE);
    let seen = recorder(&handle);

    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;
    assert_eq!(connector.attempts(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![FeedEvent::StreamDegraded]);

    // Restored once the new connection proves itself.
    connector.latest().send(Ok(pinned(1))).unwrap();
    wait_for(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            FeedEvent::StreamDegraded,
            FeedEvent::StreamRestored,
            FeedEvent::Server(pinned(1)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn quiet_connection_is_restored_after_staying_up() {
    let (_connector, multiplexer) = setup(FakeConnector::failing(3));
    let handle = multiplexer.acquire(ALICE);
    let seen = recorder(&handle);

    wait_for(|| multiplexer.state(ALICE) == StreamState::Active).await;
    assert_eq!(*seen.lock().unwrap(), vec![FeedEvent::StreamDegraded]);

    tokio::time::sleep(config().stable_after + Duration::from_millis(10)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![FeedEvent::StreamDegraded, FeedEvent::StreamRestored]
    );
}

#[tokio::test(start_paused = true)]
async fn connections_that_drop_at_once_back_off_and_degrade() {
    let (connector, multiplexer) = setup(FakeConnector::flapping());
    let handle = multiplexer.acquire(ALICE);
    let seen = recorder(&handle);

    wait_for(|| seen.lock().unwrap().contains(&FeedEvent::StreamDegraded)).await;
    assert_eq!(connector.attempts(), 3);

    // Retrying every 100ms would make about twenty attempts in this window.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let attempts = connector.attempts();
    assert!(attempts <= 9, "too many reconnects: {attempts}");
    assert!(!seen.lock().unwrap().contains(&FeedEvent::StreamRestored));
}

#[tokio::test(start_paused = true)]
async fn streams_are_independent_per_user() {
    let (connector, multiplexer) = setup(FakeConnector::default());
    let alice = multiplexer.acquire(ALICE);
    let bob = multiplexer.acquire(UserId(2));
    wait_for(|| connector.connections() == 2).await;

    bob.release();
    assert_eq!(multiplexer.state(UserId(2)), StreamState::Draining);
    assert_eq!(multiplexer.ref_count(ALICE), 1);
    assert_eq!(alice.user_id(), ALICE);
}
