use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use prometheus::{Counter, Gauge, Histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock;
use crate::pipeline::Snapshot;

use super::handle::WriterHandle;
use super::SnapshotWrite;

/// Write instrumentation scoped to one sink.
#[derive(Clone)]
pub struct SinkMetrics {
    pub name: &'static str,
    pub successes: Counter,
    pub errors: Counter,
    pub records_written: Counter,
    pub write_duration: Histogram,
    pub last_success: Gauge,
    pub channel_length: Gauge,
}

impl SinkMetrics {
    pub fn log_success(&self, elapsed: Duration, records: usize) {
        self.successes.inc();
        self.records_written.inc_by(records as f64);
        self.write_duration.observe(elapsed.as_secs_f64());
        self.last_success
            .set(clock::to_epoch_secs(SystemTime::now()));
    }

    pub fn log_error(&self, elapsed: Duration, records: usize, err: &anyhow::Error) {
        self.errors.inc();
        self.write_duration.observe(elapsed.as_secs_f64());
        warn!(
            sink = self.name,
            records,
            error = %format!("{err:#}"),
            "sink write failed",
        );
    }

    /// Metrics not attached to any registry.
    #[cfg(test)]
    pub(crate) fn unregistered(name: &'static str) -> Self {
        use prometheus::HistogramOpts;

        Self {
            name,
            successes: Counter::new("successes", "test").expect("counter"),
            errors: Counter::new("errors", "test").expect("counter"),
            records_written: Counter::new("records", "test").expect("counter"),
            write_duration: Histogram::with_opts(HistogramOpts::new("duration", "test"))
                .expect("histogram"),
            last_success: Gauge::new("last_success", "test").expect("gauge"),
            channel_length: Gauge::new("channel_length", "test").expect("gauge"),
        }
    }
}

/// Runs the loop for a sink that writes one snapshot per call.
///
/// A failed write is recorded and the loop moves on to the next unit.
pub fn spawn_snapshot_loop<W: SnapshotWrite>(
    mut rx: mpsc::Receiver<Snapshot>,
    handle: Arc<WriterHandle<W>>,
    metrics: SinkMetrics,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => break,
                unit = rx.recv() => match unit {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };
            metrics.channel_length.set(rx.len() as f64);

            let writer = handle.get();
            let start = Instant::now();
            match writer.write(&snapshot).await {
                Ok(()) => metrics.log_success(start.elapsed(), 1),
                Err(e) => metrics.log_error(start.elapsed(), 1, &e),
            }
        }
        tracing::debug!(sink = metrics.name, "snapshot loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{bail, Result};

    use super::*;
    use crate::pipeline::Summary;

    fn snapshot(n: u64) -> Snapshot {
        Snapshot {
            instance_id: format!("i-{n}"),
            account_id: String::new(),
            region: String::new(),
            host_name: "h".to_string(),
            window_start: SystemTime::UNIX_EPOCH,
            window: Duration::from_secs(60),
            sample_count: n,
            cpu_used_percent: Summary::default(),
            memory_used_percent: Summary::default(),
            memory_total: 0,
            fss: BTreeMap::new(),
        }
    }

    /// Fails the first `fail_first` writes, then succeeds.
    struct Flaky {
        fail_first: usize,
        calls: Arc<AtomicUsize>,
    }

    impl SnapshotWrite for Flaky {
        async fn write(&self, _snapshot: &Snapshot) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(WriterHandle::fixed(
            "billing",
            Flaky {
                fail_first: 3,
                calls: Arc::clone(&calls),
            },
        ));
        let metrics = SinkMetrics::unregistered("billing");
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_snapshot_loop(rx, handle, metrics.clone(), cancel.clone());

        for n in 0..4 {
            tx.send(snapshot(n)).await.expect("send");
        }

        for _ in 0..200 {
            if metrics.successes.get() == 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.errors.get(), 3.0);
        assert_eq!(metrics.successes.get(), 1.0);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.expect("loop should exit cleanly");
    }

    #[tokio::test]
    async fn test_loop_exits_when_senders_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(WriterHandle::fixed(
            "cloud_metrics",
            Flaky {
                fail_first: 0,
                calls: Arc::clone(&calls),
            },
        ));
        let (tx, rx) = mpsc::channel(2);
        let task = spawn_snapshot_loop(
            rx,
            handle,
            SinkMetrics::unregistered("cloud_metrics"),
            CancellationToken::new(),
        );

        tx.send(snapshot(1)).await.expect("send");
        drop(tx);
        task.await.expect("loop should exit cleanly");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
