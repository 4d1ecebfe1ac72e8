//! Cost rollup sink: snapshots are converted to instance and file system
//! records, split when one endpoint's file systems exceed a call, and
//! batched into size-bounded calls.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::format_datetime;
use crate::pipeline::Snapshot;

use super::dispatch::SinkMetrics;
use super::handle::WriterHandle;
use super::http::HttpTarget;
use super::writer::WriterConfig;

/// Per-instance record of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceData {
    pub instance_id: String,
    pub account_id: String,
    pub region: String,
    pub host_name: String,
    pub window_start: String,
    pub window_secs: u64,
    pub sample_count: u64,
    pub cpu_avg: Option<f64>,
    pub cpu_max: Option<f64>,
    pub memory_avg: Option<f64>,
    pub memory_max: Option<f64>,
    pub memory_total: u64,
}

/// Per-file-system record of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FsData {
    pub instance_id: String,
    pub mount_point: String,
    pub window_start: String,
    pub size: u64,
    pub used_avg: Option<f64>,
    pub used_max: Option<f64>,
}

/// Maximum records per outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    pub max_instances: usize,
    pub max_fs: usize,
}

/// One instance record and its file system records.
#[derive(Debug, Clone, PartialEq)]
pub struct CostCall {
    pub instance: InstanceData,
    pub fss: Vec<FsData>,
}

impl CostCall {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let window_start = format_datetime(snapshot.window_start);
        let present = |count: u64, v: f64| (count > 0).then_some(v);

        let instance = InstanceData {
            instance_id: snapshot.instance_id.clone(),
            account_id: snapshot.account_id.clone(),
            region: snapshot.region.clone(),
            host_name: snapshot.host_name.clone(),
            window_start: window_start.clone(),
            window_secs: snapshot.window.as_secs(),
            sample_count: snapshot.sample_count,
            cpu_avg: snapshot.cpu_used_percent.avg(),
            cpu_max: present(snapshot.cpu_used_percent.count, snapshot.cpu_used_percent.max),
            memory_avg: snapshot.memory_used_percent.avg(),
            memory_max: present(
                snapshot.memory_used_percent.count,
                snapshot.memory_used_percent.max,
            ),
            memory_total: snapshot.memory_total,
        };

        let fss = snapshot
            .fss
            .iter()
            .map(|(mount_point, fs)| FsData {
                instance_id: snapshot.instance_id.clone(),
                mount_point: mount_point.clone(),
                window_start: window_start.clone(),
                size: fs.size,
                used_avg: fs.used_percent.avg(),
                used_max: present(fs.used_percent.count, fs.used_percent.max),
            })
            .collect();

        Self { instance, fss }
    }

    /// Splits off file system records beyond `max_fs`.
    ///
    /// Returns the primary call, holding the instance and the first `max_fs`
    /// file systems, plus file-system-only chunks for the rest. The chunk
    /// list is empty when everything fits one call.
    pub fn split(mut self, max_fs: usize) -> (CostCall, Vec<Vec<FsData>>) {
        let max_fs = max_fs.max(1);
        if self.fss.len() <= max_fs {
            return (self, Vec::new());
        }
        let rest = self.fss.split_off(max_fs);
        let overflow = rest.chunks(max_fs).map(<[FsData]>::to_vec).collect();
        (self, overflow)
    }
}

/// Bounded accumulator of cost records awaiting one call.
///
/// Owned by the cost rollup loop alone.
#[derive(Debug)]
pub struct CostBuffer {
    limits: CallLimits,
    instances: Vec<InstanceData>,
    fss: Vec<FsData>,
}

impl CostBuffer {
    pub fn new(limits: CallLimits) -> Self {
        Self {
            limits,
            instances: Vec::with_capacity(limits.max_instances),
            fss: Vec::new(),
        }
    }

    /// Appends a call if it fits. On rejection the call is handed back and
    /// the buffer is unchanged.
    pub fn add(&mut self, call: CostCall) -> Result<(), CostCall> {
        if self.instances.len() + 1 > self.limits.max_instances
            || self.fss.len() + call.fss.len() > self.limits.max_fs
        {
            return Err(call);
        }
        self.instances.push(call.instance);
        self.fss.extend(call.fss);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.fss.is_empty()
    }

    pub fn get(&self) -> (&[InstanceData], &[FsData]) {
        (&self.instances, &self.fss)
    }

    pub fn clear(&mut self) {
        self.instances.clear();
        self.fss.clear();
    }
}

/// A record that cannot fit an empty buffer; limits and splitting disagree.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("cost call for {instance_id} with {fs_count} file systems does not fit an empty buffer")]
    RecordTooLarge { instance_id: String, fs_count: usize },
}

/// Destination of cost rollup calls.
pub trait CostWrite: Send + Sync + 'static {
    fn write(
        &self,
        instances: &[InstanceData],
        fss: &[FsData],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Serialize)]
struct CostRequest<'a> {
    instances: &'a [InstanceData],
    file_systems: &'a [FsData],
}

pub enum CostWriter {
    Http(HttpTarget),
    DryRun,
}

impl CostWriter {
    pub fn from_config(cfg: &WriterConfig) -> Result<Self> {
        Ok(match cfg.http_target()? {
            Some(target) => Self::Http(target),
            None => Self::DryRun,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Self::from_config(&WriterConfig::from_yaml(contents)?)
    }
}

impl CostWrite for CostWriter {
    async fn write(&self, instances: &[InstanceData], fss: &[FsData]) -> Result<()> {
        match self {
            Self::Http(target) => {
                target
                    .post_json(&CostRequest {
                        instances,
                        file_systems: fss,
                    })
                    .await
            }
            Self::DryRun => {
                info!(
                    instances = instances.len(),
                    file_systems = fss.len(),
                    "dry run: would write cost rollup call",
                );
                Ok(())
            }
        }
    }
}

async fn write_call<W: CostWrite>(
    writer: &W,
    instances: &[InstanceData],
    fss: &[FsData],
    metrics: &SinkMetrics,
) {
    let start = Instant::now();
    match writer.write(instances, fss).await {
        Ok(()) => metrics.log_success(start.elapsed(), instances.len()),
        Err(e) => metrics.log_error(start.elapsed(), instances.len(), &e),
    }
}

async fn flush<W: CostWrite>(buffer: &mut CostBuffer, writer: &W, metrics: &SinkMetrics) {
    if buffer.is_empty() {
        return;
    }
    let (instances, fss) = buffer.get();
    write_call(writer, instances, fss, metrics).await;
    buffer.clear();
}

/// Writes one batch of snapshots, splitting and buffering as needed.
///
/// Arrival order is preserved: an oversized snapshot flushes whatever is
/// buffered before its own calls go out.
pub async fn dispatch_batch<W: CostWrite>(
    writer: &W,
    limits: CallLimits,
    snapshots: &[Snapshot],
    metrics: &SinkMetrics,
) -> Result<(), BufferError> {
    let mut buffer = CostBuffer::new(limits);

    for snapshot in snapshots {
        let (call, overflow) = CostCall::from_snapshot(snapshot).split(limits.max_fs);

        if !overflow.is_empty() {
            flush(&mut buffer, writer, metrics).await;
            write_call(
                writer,
                std::slice::from_ref(&call.instance),
                &call.fss,
                metrics,
            )
            .await;
            for fss in &overflow {
                write_call(writer, &[], fss, metrics).await;
            }
            continue;
        }

        if let Err(call) = buffer.add(call) {
            flush(&mut buffer, writer, metrics).await;
            if let Err(call) = buffer.add(call) {
                return Err(BufferError::RecordTooLarge {
                    instance_id: call.instance.instance_id,
                    fs_count: call.fss.len(),
                });
            }
        }
    }

    flush(&mut buffer, writer, metrics).await;
    Ok(())
}

/// Runs the cost rollup loop. Each unit is every retained snapshot of one
/// endpoint.
///
/// A record that does not fit an empty buffer aborts the process.
pub fn spawn_cost_loop<W: CostWrite>(
    mut rx: mpsc::Receiver<Vec<Snapshot>>,
    handle: Arc<WriterHandle<W>>,
    limits: CallLimits,
    metrics: SinkMetrics,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshots = tokio::select! {
                _ = cancel.cancelled() => break,
                unit = rx.recv() => match unit {
                    Some(snapshots) => snapshots,
                    None => break,
                },
            };
            metrics.channel_length.set(rx.len() as f64);

            let writer = handle.get();
            if let Err(e) = dispatch_batch(writer.as_ref(), limits, &snapshots, &metrics).await {
                error!(sink = metrics.name, error = %e, "cost rollup buffer invariant violated");
                std::process::abort();
            }
        }
        tracing::debug!(sink = metrics.name, "cost rollup loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};

    use parking_lot::Mutex;

    use super::*;
    use crate::pipeline::{FsSummary, Summary};

    fn snapshot(id: &str, fs_count: usize) -> Snapshot {
        let mut cpu = Summary::default();
        cpu.add(10.0);
        cpu.add(30.0);
        let fss = (0..fs_count)
            .map(|i| {
                let mut used = Summary::default();
                used.add(50.0);
                (
                    format!("/mnt/{i:02}"),
                    FsSummary {
                        size: 100,
                        used_percent: used,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        Snapshot {
            instance_id: id.to_string(),
            account_id: "acct".to_string(),
            region: "us-east-1".to_string(),
            host_name: format!("{id}.example"),
            window_start: SystemTime::UNIX_EPOCH + Duration::from_secs(3600),
            window: Duration::from_secs(3600),
            sample_count: 2,
            cpu_used_percent: cpu,
            memory_used_percent: Summary::default(),
            memory_total: 0,
            fss,
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
    }

    impl CostWrite for Recorder {
        async fn write(&self, instances: &[InstanceData], fss: &[FsData]) -> Result<()> {
            self.calls.lock().push((
                instances.iter().map(|i| i.instance_id.clone()).collect(),
                fss.iter()
                    .map(|f| format!("{}:{}", f.instance_id, f.mount_point))
                    .collect(),
            ));
            Ok(())
        }
    }

    fn limits(max_instances: usize, max_fs: usize) -> CallLimits {
        CallLimits {
            max_instances,
            max_fs,
        }
    }

    #[test]
    fn test_from_snapshot() {
        let call = CostCall::from_snapshot(&snapshot("i-1", 2));
        assert_eq!(call.instance.cpu_avg, Some(20.0));
        assert_eq!(call.instance.cpu_max, Some(30.0));
        assert_eq!(call.instance.memory_avg, None);
        assert_eq!(call.instance.memory_max, None);
        assert_eq!(call.instance.window_start, "1970-01-01 01:00:00.000");
        assert_eq!(call.fss.len(), 2);
        assert_eq!(call.fss[0].mount_point, "/mnt/00");
    }

    #[test]
    fn test_split_fits() {
        let call = CostCall::from_snapshot(&snapshot("i-1", 3));
        let (primary, overflow) = call.clone().split(3);
        assert!(overflow.is_empty());
        assert_eq!(primary, call);
    }

    #[test]
    fn test_split_overflow_keeps_all_fs_once() {
        let call = CostCall::from_snapshot(&snapshot("i-1", 7));
        let (primary, overflow) = call.clone().split(3);

        assert_eq!(primary.fss.len(), 3);
        assert_eq!(overflow.len(), 2);
        assert_eq!(overflow[0].len(), 3);
        assert_eq!(overflow[1].len(), 1);

        let mut rejoined = primary.fss.clone();
        rejoined.extend(overflow.into_iter().flatten());
        assert_eq!(rejoined, call.fss);
    }

    #[test]
    fn test_buffer_rejects_without_mutation() {
        let mut buffer = CostBuffer::new(limits(2, 4));
        assert!(buffer.is_empty());

        buffer
            .add(CostCall::from_snapshot(&snapshot("i-1", 3)))
            .expect("fits empty buffer");
        let rejected = buffer
            .add(CostCall::from_snapshot(&snapshot("i-2", 2)))
            .expect_err("too many file systems");
        assert_eq!(rejected.instance.instance_id, "i-2");

        let (instances, fss) = buffer.get();
        assert_eq!(instances.len(), 1);
        assert_eq!(fss.len(), 3);

        buffer
            .add(CostCall::from_snapshot(&snapshot("i-3", 1)))
            .expect("fits");
        assert!(buffer
            .add(CostCall::from_snapshot(&snapshot("i-4", 0)))
            .is_err());

        buffer.clear();
        assert!(buffer.is_empty());
        buffer
            .add(CostCall::from_snapshot(&snapshot("i-5", 4)))
            .expect("fits after clear");
    }

    #[tokio::test]
    async fn test_dispatch_batches_small_snapshots() {
        let writer = Recorder::default();
        let metrics = SinkMetrics::unregistered("cost_rollup");
        let snapshots = vec![snapshot("a", 1), snapshot("b", 1), snapshot("c", 1)];

        dispatch_batch(&writer, limits(2, 10), &snapshots, &metrics)
            .await
            .expect("dispatch");

        let calls = writer.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, vec!["a", "b"]);
        assert_eq!(calls[1].0, vec!["c"]);
        assert_eq!(metrics.successes.get(), 2.0);
        assert_eq!(metrics.records_written.get(), 3.0);
    }

    #[tokio::test]
    async fn test_dispatch_oversized_flushes_first() {
        let writer = Recorder::default();
        let metrics = SinkMetrics::unregistered("cost_rollup");
        let snapshots = vec![snapshot("a", 1), snapshot("big", 5), snapshot("c", 1)];

        dispatch_batch(&writer, limits(10, 2), &snapshots, &metrics)
            .await
            .expect("dispatch");

        let calls = writer.calls.lock();
        let instances: Vec<_> = calls.iter().map(|c| c.0.clone()).collect();
        assert_eq!(
            instances,
            vec![
                vec!["a".to_string()],
                vec!["big".to_string()],
                vec![],
                vec![],
                vec!["c".to_string()],
            ]
        );
        assert_eq!(calls[1].1.len(), 2);
        assert_eq!(calls[2].1.len(), 2);
        assert_eq!(calls[3].1, vec!["big:/mnt/04".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_impossible_limits() {
        let writer = Recorder::default();
        let metrics = SinkMetrics::unregistered("cost_rollup");

        let err = dispatch_batch(&writer, limits(0, 10), &[snapshot("a", 1)], &metrics)
            .await
            .expect_err("nothing fits");
        assert!(matches!(err, BufferError::RecordTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_writer() {
        let writer = CostWriter::from_yaml("dry_run: true\n").expect("dry run");
        writer.write(&[], &[]).await.expect("dry run write");
    }
}
