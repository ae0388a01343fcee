//! End-to-end behavior of the relay loop over in-memory doubles.
//!
//! Time-dependent tests run on a paused tokio clock, so backoff and idle
//! waits advance instantly and deterministically.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use outbox_relay::{Relay, RelayConfig, RelayStats};
use outbox_relay_rabbitmq::testing::{ChannelScript, MockBroker};
use outbox_relay_rabbitmq::{ChannelPool, Router};
use relay_core::testing::{MemoryOutbox, ScriptedNotifier, SourceFault};
use relay_core::{OperationType, WaitOutcome};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CRITICAL_ERROR_DELAY: Duration = Duration::from_secs(300);
const POLLING_INTERVAL: Duration = Duration::from_secs(60);

fn config(messages_per_transaction: usize) -> RelayConfig {
    RelayConfig {
        messages_per_transaction,
        confirm_timeout: Duration::from_secs(5),
        critical_error_delay: CRITICAL_ERROR_DELAY,
        notification_timeout: Duration::from_secs(180),
        polling_interval: POLLING_INTERVAL,
    }
}

async fn spawn_relay(
    outbox: &MemoryOutbox,
    notifier: &ScriptedNotifier,
    broker: &MockBroker,
    channels: usize,
    messages_per_transaction: usize,
) -> (CancellationToken, JoinHandle<RelayStats>) {
    let pool = ChannelPool::open(broker.connection(), Router::new("relay"), Some(channels))
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let relay = Relay::new(
        outbox.clone(),
        notifier.clone(),
        pool,
        config(messages_per_transaction),
        shutdown.clone(),
    );
    (shutdown, tokio::spawn(relay.run()))
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<RelayStats>) -> RelayStats {
    shutdown.cancel();
    handle.await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_two_types_two_channels_scenario() {
    let outbox = MemoryOutbox::new();
    for t in ["A", "A", "B", "A", "B"] {
        outbox.insert(t, OperationType::Insert, "{}");
    }
    let broker = MockBroker::new();
    let notifier = ScriptedNotifier::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 2, 100).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = stop(shutdown, handle).await;

    assert_eq!(broker.sequences_on(0), vec![1, 2, 4]);
    assert_eq!(broker.sequences_on(1), vec![3, 5]);
    assert_eq!(stats.messages_relayed, 5);
    assert_eq!(stats.cycles, 1);
    assert_eq!(outbox.remaining(), 0);
    assert_eq!(outbox.commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_row_is_published_at_least_once_despite_failures() {
    let outbox = MemoryOutbox::new();
    let types = ["Orders", "Stock", "Prices", "Orders", "Stock"];
    let mut expected = HashSet::new();
    for i in 0..40 {
        let seq = outbox.insert(types[i % types.len()], OperationType::Update, "{}");
        expected.insert(seq);
    }
    let uuids: HashSet<_> = outbox.rows().iter().map(|m| m.uuid).collect();

    let broker = MockBroker::new();
    broker.script(0, ChannelScript::acking().close_at(2));
    broker.script(0, ChannelScript::acking().close_at(1));
    broker.script(1, ChannelScript::acking().nack(3));
    broker.script(2, ChannelScript::acking().fail_publish_at(1));
    outbox.inject(SourceFault::Unavailable);
    outbox.inject(SourceFault::CommitFails);

    let notifier = ScriptedNotifier::new();
    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 3, 10).await;
    tokio::time::sleep(Duration::from_secs(3600)).await;
    let stats = stop(shutdown, handle).await;

    assert_eq!(outbox.remaining(), 0);
    assert_eq!(outbox.in_flight(), 0);
    let published: HashSet<_> = broker.published().iter().map(|p| p.message.uuid).collect();
    assert!(uuids.is_subset(&published));
    let keys: HashSet<_> = broker
        .published()
        .iter()
        .map(|p| p.message.sequence_key)
        .collect();
    assert_eq!(keys, expected);
    assert!(stats.failures >= 2);
    assert!(stats.retries >= 1);
    assert!(stats.messages_relayed >= 40);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_resumes_after_broker_reconnects() {
    let outbox = MemoryOutbox::new();
    for t in ["A", "B", "A"] {
        outbox.insert(t, OperationType::Insert, "{}");
    }
    let broker = MockBroker::new();
    // The connection dies mid-batch and refuses the first reconnect.
    broker.script(0, ChannelScript::acking().drop_connection_at(1, 1));
    let notifier = ScriptedNotifier::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 2, 10).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(outbox.remaining(), 3);
    assert_eq!(outbox.rollbacks(), 1);

    tokio::time::sleep(Duration::from_secs(600)).await;
    let stats = stop(shutdown, handle).await;

    assert_eq!(outbox.remaining(), 0);
    assert_eq!(broker.reconnects(), 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.messages_relayed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_messages_of_a_type_are_published_in_sequence_order() {
    let outbox = MemoryOutbox::new();
    let pattern = ["A", "B", "C", "A", "A", "D", "B", "C", "A", "E", "B"];
    for i in 0..66 {
        outbox.insert(pattern[i % pattern.len()], OperationType::Insert, "{}");
    }
    let broker = MockBroker::new();
    let notifier = ScriptedNotifier::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 3, 7).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = stop(shutdown, handle).await;
    assert_eq!(stats.messages_relayed, 66);

    let mut by_type: HashMap<String, Vec<i64>> = HashMap::new();
    for p in broker.published() {
        by_type
            .entry(p.message.message_type.clone())
            .or_default()
            .push(p.message.sequence_key);
    }
    for (message_type, keys) in by_type {
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "{message_type} published out of order: {keys:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gaps_are_constant() {
    let outbox = MemoryOutbox::new();
    for _ in 0..3 {
        outbox.inject(SourceFault::Unavailable);
    }
    let notifier = ScriptedNotifier::new();
    for _ in 0..3 {
        notifier.push(WaitOutcome::NotificationReceived);
    }
    let broker = MockBroker::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 1, 10).await;
    tokio::time::sleep(Duration::from_secs(1000)).await;
    let stats = stop(shutdown, handle).await;

    let attempts = outbox.dequeue_attempts();
    assert!(attempts.len() >= 4, "attempts: {}", attempts.len());
    let gaps: Vec<Duration> = attempts[..4].windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps, vec![CRITICAL_ERROR_DELAY; 3]);
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.cycles, 0);
}

#[tokio::test(start_paused = true)]
async fn test_polls_when_notifications_are_not_supported() {
    let outbox = MemoryOutbox::new();
    let notifier = ScriptedNotifier::new();
    notifier.push(WaitOutcome::NotSupported);
    let broker = MockBroker::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 1, 10).await;
    tokio::time::sleep(Duration::from_secs(150)).await;
    stop(shutdown, handle).await;

    let attempts = outbox.dequeue_attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1] - attempts[0], POLLING_INTERVAL);
    assert_eq!(attempts[2] - attempts[1], POLLING_INTERVAL);
    assert_eq!(notifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifier_error_falls_back_to_one_poll() {
    let outbox = MemoryOutbox::new();
    let notifier = ScriptedNotifier::new();
    notifier.push_error("connection reset");
    let broker = MockBroker::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 1, 10).await;
    tokio::time::sleep(Duration::from_secs(61)).await;
    outbox.insert("A", OperationType::Insert, "{}");
    tokio::time::sleep(Duration::from_secs(200)).await;
    let stats = stop(shutdown, handle).await;

    // The error costs one polling interval, then normal idle waits resume.
    assert_eq!(notifier.calls(), 3);
    assert_eq!(notifier.timeouts()[1], Duration::from_secs(180));
    assert_eq!(stats.messages_relayed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let outbox = MemoryOutbox::new();
    outbox.inject(SourceFault::Unavailable);
    let notifier = ScriptedNotifier::new();
    let broker = MockBroker::new();

    let (shutdown, handle) = spawn_relay(&outbox, &notifier, &broker, 1, 10).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    let started = tokio::time::Instant::now();
    let stats = stop(shutdown, handle).await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(stats.failures, 1);
    assert_eq!(notifier.calls(), 0);
}
