//! Bulk export of a snapshot table through the publisher channels.
//!
//! The snapshot is cut into row-number ranges up front and the ranges are
//! dealt round-robin to the channels. Each channel runs its own worker with
//! its own snapshot reader, so a slow or failing channel never stalls the
//! others.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use outbox_relay_rabbitmq::{
    pool_size, watch_blocked, BrokerConnection, ChannelReport, RelayChannel, Router,
};
use relay_core::{report, BatchId, Message, RelayError, RowRange, SnapshotReader, SnapshotSource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deterministic export plan: `plan[channel]` lists the ranges that channel
/// publishes, in order.
///
/// Ranges cover `1..=min(max_row_number, rows_limit)` in steps of
/// `batch_size` and are assigned round-robin.
pub fn plan_batches(
    max_row_number: i64,
    batch_size: usize,
    channels: usize,
    rows_limit: Option<u64>,
) -> Vec<Vec<RowRange>> {
    let channels = channels.max(1);
    let batch_size = batch_size.max(1) as i64;
    let last_row = match rows_limit {
        Some(limit) => max_row_number.min(i64::try_from(limit).unwrap_or(i64::MAX)),
        None => max_row_number,
    };

    let mut plan = vec![Vec::new(); channels];
    let mut first = 1;
    let mut index = 0;
    while first <= last_row {
        let last = last_row.min(first.saturating_add(batch_size - 1));
        plan[index % channels].push(RowRange::new(first, last));
        index += 1;
        first = last + 1;
    }
    plan
}

/// Callbacks fired as each range settles.
pub trait ExportObserver: Send + Sync {
    fn batch_confirmed(&self, channel: u16, range: RowRange, messages: u64, elapsed: Duration);
    fn batch_failed(&self, channel: u16, range: RowRange, error: &RelayError);
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub batch_size: usize,
    /// Requested channel count; the CPU count when `None`.
    pub channels: Option<usize>,
    pub rows_limit: Option<u64>,
    pub confirm_timeout: Duration,
}

/// A range that was still failing after its retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRange {
    pub channel: u16,
    pub range: RowRange,
    pub error: String,
}

impl fmt::Display for FailedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rows {} on channel #{}: {}", self.range, self.channel, self.error)
    }
}

/// Totals of one export run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub messages_sent: u64,
    pub confirmed: u64,
    pub failed: u64,
    /// Every failed range, in row order.
    pub failed_ranges: Vec<FailedRange>,
    pub elapsed: Duration,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn absorb(&mut self, other: ExportReport) {
        self.messages_sent += other.messages_sent;
        self.confirmed += other.confirmed;
        self.failed += other.failed;
        self.failed_ranges.extend(other.failed_ranges);
    }
}

pub struct Exporter {
    connection: Arc<dyn BrokerConnection>,
    router: Arc<Router>,
    config: ExportConfig,
    shutdown: CancellationToken,
}

impl Exporter {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        router: Router,
        config: ExportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection,
            router: Arc::new(router),
            config,
            shutdown,
        }
    }

    /// Publish every planned range of `snapshot`.
    ///
    /// Failing to open a reader or a channel, at the start or when a channel
    /// has to be replaced, stops every worker and fails the export. A range
    /// that still fails after its retry is reported to the observer and
    /// counted.
    pub async fn run(
        &self,
        snapshot: &dyn SnapshotSource,
        observer: Arc<dyn ExportObserver>,
    ) -> Result<ExportReport, RelayError> {
        let started = Instant::now();
        let max_row_number = snapshot.max_row_number().await?;

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let channels = pool_size(
            parallelism,
            self.config.channels,
            self.connection.channel_max(),
        );
        let plan = plan_batches(
            max_row_number,
            self.config.batch_size,
            channels,
            self.config.rows_limit,
        );
        info!(
            rows = max_row_number,
            ranges = plan.iter().map(Vec::len).sum::<usize>(),
            channels,
            "Starting export"
        );

        let stop = self.shutdown.child_token();
        let mut handles = Vec::new();
        for (id, ranges) in plan.into_iter().enumerate() {
            if ranges.is_empty() {
                continue;
            }
            let worker = match self
                .start_worker(id as u16, snapshot, observer.clone(), stop.clone())
                .await
            {
                Ok(worker) => worker,
                Err(e) => {
                    stop.cancel();
                    join_all(handles).await;
                    return Err(e);
                }
            };
            handles.push(tokio::spawn(worker.run(ranges)));
        }

        let mut report = ExportReport::default();
        let mut structural = None;
        for result in join_all(handles).await {
            let tally = result
                .map_err(|e| RelayError::broker_unavailable("Export worker failed", e))
                .and_then(|tally| tally);
            match tally {
                Ok(tally) => report.absorb(tally),
                Err(e) => {
                    structural.get_or_insert(e);
                }
            }
        }
        if let Some(e) = structural {
            return Err(e);
        }
        report.failed_ranges.sort_by_key(|f| f.range.first);
        report.elapsed = started.elapsed();

        info!(
            messages = report.messages_sent,
            confirmed = report.confirmed,
            failed = report.failed,
            elapsed = ?report.elapsed,
            "Export finished"
        );
        Ok(report)
    }

    async fn start_worker(
        &self,
        id: u16,
        snapshot: &dyn SnapshotSource,
        observer: Arc<dyn ExportObserver>,
        stop: CancellationToken,
    ) -> Result<ExportWorker, RelayError> {
        Ok(ExportWorker {
            channel: RelayChannel::open(id, self.connection.as_ref()).await?,
            reader: snapshot.reader().await?,
            connection: self.connection.clone(),
            router: self.router.clone(),
            confirm_timeout: self.config.confirm_timeout,
            observer,
            stop,
        })
    }
}

/// One channel's share of the export.
struct ExportWorker {
    channel: RelayChannel,
    reader: Box<dyn SnapshotReader>,
    connection: Arc<dyn BrokerConnection>,
    router: Arc<Router>,
    confirm_timeout: Duration,
    observer: Arc<dyn ExportObserver>,
    stop: CancellationToken,
}

impl ExportWorker {
    async fn run(mut self, ranges: Vec<RowRange>) -> Result<ExportReport, RelayError> {
        let id = self.channel.id();
        let mut tally = ExportReport::default();

        for range in ranges {
            if self.stop.is_cancelled() {
                debug!(channel = id, "Export interrupted");
                break;
            }
            let started = Instant::now();
            let outcome = match self.export_range(range).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.stop.cancel();
                    return Err(e);
                }
            };
            match outcome {
                Ok(sent) => {
                    tally.confirmed += 1;
                    tally.messages_sent += sent;
                    self.observer.batch_confirmed(id, range, sent, started.elapsed());
                }
                Err(e) => {
                    tally.failed += 1;
                    tally.failed_ranges.push(FailedRange {
                        channel: id,
                        range,
                        error: report(&e),
                    });
                    self.observer.batch_failed(id, range, &e);
                }
            }
        }
        Ok(tally)
    }

    /// The outer error ends the export; the inner one fails only this range.
    async fn export_range(
        &mut self,
        range: RowRange,
    ) -> Result<Result<u64, RelayError>, RelayError> {
        let messages = match self.reader.read_range(range).await {
            Ok(messages) => messages,
            Err(e) => return Ok(Err(e)),
        };
        if messages.is_empty() {
            return Ok(Ok(0));
        }
        let batch = BatchId::Rows(range);

        let first = self.publish(batch, messages).await?;
        let messages = match first.outcome {
            Ok(()) => return Ok(Ok(first.sent)),
            Err(e) if e.is_environmental() => return Ok(Err(e)),
            Err(e) => {
                warn!(
                    channel = first.channel_id,
                    batch = %batch,
                    error = %report(&e),
                    "Export range failed, retrying once"
                );
                first.messages
            }
        };

        let retry = self.publish(batch, messages).await?;
        let sent = retry.sent;
        Ok(retry.outcome.map(|()| sent))
    }

    /// Publish one range under a flow-control watcher. Fails only when a
    /// replacement channel cannot be opened.
    async fn publish(
        &mut self,
        batch: BatchId,
        messages: Vec<Message>,
    ) -> Result<ChannelReport, RelayError> {
        if !self.channel.is_healthy() {
            let id = self.channel.id();
            warn!(channel = id, "Replacing unhealthy export channel");
            self.channel = RelayChannel::open(id, self.connection.as_ref()).await?;
        }
        if self.connection.is_blocked() {
            return Ok(ChannelReport {
                channel_id: self.channel.id(),
                sent: 0,
                outcome: Err(RelayError::ConnectionBlocked),
                messages,
            });
        }

        self.channel.enqueue(messages);
        let abort = CancellationToken::new();
        let watcher = watch_blocked(self.connection.clone(), abort.clone());
        let report = self
            .channel
            .publish_and_confirm(&self.router, batch, self.confirm_timeout, &abort)
            .await;
        watcher.abort();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_relay_rabbitmq::testing::{ChannelScript, MockBroker};
    use relay_core::testing::MemorySnapshot;
    use relay_core::OperationType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        confirmed: Mutex<Vec<(u16, RowRange, u64)>>,
        failed: Mutex<Vec<(u16, RowRange)>>,
    }

    impl ExportObserver for Recorder {
        fn batch_confirmed(&self, channel: u16, range: RowRange, messages: u64, _: Duration) {
            self.confirmed.lock().unwrap().push((channel, range, messages));
        }

        fn batch_failed(&self, channel: u16, range: RowRange, _: &RelayError) {
            self.failed.lock().unwrap().push((channel, range));
        }
    }

    fn snapshot(rows: i64) -> MemorySnapshot {
        MemorySnapshot::new(
            (1..=rows)
                .map(|i| {
                    let message_type = if i % 2 == 0 { "A" } else { "B" };
                    Message::new(i, message_type, OperationType::Insert, "{}")
                })
                .collect(),
        )
    }

    fn exporter(broker: &MockBroker, batch_size: usize, rows_limit: Option<u64>) -> Exporter {
        Exporter::new(
            broker.connection(),
            Router::new("export"),
            ExportConfig {
                batch_size,
                channels: Some(2),
                rows_limit,
                confirm_timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_plan_batches_round_robin() {
        let plan = plan_batches(2500, 1000, 2, None);
        assert_eq!(
            plan,
            vec![
                vec![RowRange::new(1, 1000), RowRange::new(2001, 2500)],
                vec![RowRange::new(1001, 2000)],
            ]
        );
    }

    #[test]
    fn test_plan_batches_is_deterministic_and_covers_every_row_once() {
        let plan = plan_batches(10_007, 333, 3, None);
        assert_eq!(plan, plan_batches(10_007, 333, 3, None));

        let mut ranges: Vec<RowRange> = plan.into_iter().flatten().collect();
        ranges.sort_by_key(|r| r.first);
        assert_eq!(ranges.first().map(|r| r.first), Some(1));
        assert_eq!(ranges.last().map(|r| r.last), Some(10_007));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].last + 1, pair[1].first);
        }
        assert_eq!(ranges.iter().map(RowRange::len).sum::<u64>(), 10_007);
    }

    #[test]
    fn test_plan_batches_respects_rows_limit() {
        let plan = plan_batches(5000, 1000, 4, Some(1500));
        assert_eq!(
            plan,
            vec![
                vec![RowRange::new(1, 1000)],
                vec![RowRange::new(1001, 1500)],
                vec![],
                vec![],
            ]
        );
        assert!(plan_batches(0, 1000, 2, None).iter().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn test_export_publishes_every_row() {
        let broker = MockBroker::new();
        let snapshot = snapshot(25);
        let recorder = Arc::new(Recorder::default());

        let report = exporter(&broker, 10, None)
            .run(&snapshot, recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.messages_sent, 25);
        assert_eq!(report.confirmed, 3);
        assert!(report.is_success());
        assert_eq!(broker.sequences_on(0), (1..=10).chain(21..=25).collect::<Vec<_>>());
        assert_eq!(broker.sequences_on(1), (11..=20).collect::<Vec<_>>());
        assert_eq!(recorder.confirmed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_export_retries_nacked_range() {
        let broker = MockBroker::new();
        broker.script(1, ChannelScript::acking().nack(3));
        let recorder = Arc::new(Recorder::default());

        let report = exporter(&broker, 10, Some(20))
            .run(&snapshot(30), recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.confirmed, 2);
        assert_eq!(report.failed, 0);
        // Rows 11-20 went out twice on channel 1.
        assert_eq!(broker.sequences_on(1).len(), 20);
        assert_eq!(report.messages_sent, 20);
    }

    #[tokio::test]
    async fn test_export_counts_failed_range_and_continues() {
        let broker = MockBroker::new();
        broker.script(0, ChannelScript::acking().close_at(1));
        broker.script(0, ChannelScript::acking().close_at(1));
        let recorder = Arc::new(Recorder::default());

        let report = exporter(&broker, 10, None)
            .run(&snapshot(25), recorder.clone())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.confirmed, 2);
        assert!(!report.is_success());
        assert_eq!(
            *recorder.failed.lock().unwrap(),
            vec![(0, RowRange::new(1, 10))]
        );
        assert_eq!(report.failed_ranges.len(), 1);
        let failed = &report.failed_ranges[0];
        assert_eq!((failed.channel, failed.range), (0, RowRange::new(1, 10)));
        assert!(failed
            .to_string()
            .starts_with("rows 1-10 on channel #0: Channel #0 closed"));
    }

    fn single_channel_exporter(broker: &MockBroker, batch_size: usize) -> Exporter {
        Exporter::new(
            broker.connection(),
            Router::new("export"),
            ExportConfig {
                batch_size,
                channels: Some(1),
                rows_limit: None,
                confirm_timeout: Duration::from_secs(30),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_control_aborts_range_in_flight() {
        let broker = MockBroker::new();
        broker.script(0, ChannelScript::acking().block_connection_at(1));
        let recorder = Arc::new(Recorder::default());

        let started = tokio::time::Instant::now();
        let report = single_channel_exporter(&broker, 5)
            .run(&snapshot(5), recorder.clone())
            .await
            .unwrap();

        // Aborted by the watcher, long before the confirm timeout.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.failed, 1);
        assert_eq!(report.confirmed, 0);
        assert!(report.failed_ranges[0].error.contains("blocked"));
    }

    #[tokio::test]
    async fn test_export_stops_when_replacement_channel_cannot_open() {
        let broker = MockBroker::new();
        broker.script(0, ChannelScript::acking().drop_connection_at(1, 1));
        let snapshot = snapshot(10);
        let recorder = Arc::new(Recorder::default());

        let err = single_channel_exporter(&broker, 5)
            .run(&snapshot, recorder.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::BrokerUnavailable { .. }));
        // The second range is never attempted.
        assert_eq!(snapshot.reads(), vec![RowRange::new(1, 5)]);
        assert!(recorder.confirmed.lock().unwrap().is_empty());
        assert!(recorder.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_fails_when_channel_cannot_open() {
        let broker = MockBroker::new();
        broker.fail_next_opens(1);
        let err = exporter(&broker, 10, None)
            .run(&snapshot(5), Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::BrokerUnavailable { .. }));
    }
}
