use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sweepline::collector::{Metric, MetricValue};
use sweepline::pipeline::{FsSummary, InstanceStats, Snapshot, Summary};
use sweepline::queue::KeyedQueue;
use sweepline::sink::cost::{CallLimits, CostBuffer, CostCall};

fn health_agent_metrics() -> Vec<Metric> {
    let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let mut metrics = vec![
        Metric::new("/sys/cpu/user", MetricValue::Float(12.5)).at(ts),
        Metric::new("/sys/cpu/sys", MetricValue::Float(3.5)).at(ts),
        Metric::new("/sys/memory/total", MetricValue::Uint(64 << 30)).at(ts),
        Metric::new("/sys/memory/free", MetricValue::Uint(20 << 30)).at(ts),
        Metric::new("/sys/fs/METRICS/size", MetricValue::Uint(500 << 30)).at(ts),
        Metric::new("/sys/fs/METRICS/free", MetricValue::Uint(200 << 30)).at(ts),
    ];
    for i in 0..32 {
        metrics.push(
            Metric::new(&format!("/sys/fs/data{i}/METRICS/size"), MetricValue::Uint(1 << 40))
                .at(ts),
        );
        metrics.push(
            Metric::new(&format!("/sys/fs/data{i}/METRICS/free"), MetricValue::Uint(1 << 39))
                .at(ts),
        );
    }
    for i in 0..200 {
        metrics.push(Metric::new(&format!("/proc/app/counter{i}"), MetricValue::Int(i)).at(ts));
    }
    metrics
}

fn snapshot(instance: usize, fs_count: usize) -> Snapshot {
    let mut used = Summary::default();
    used.add(40.0);
    used.add(60.0);
    let fss: BTreeMap<String, FsSummary> = (0..fs_count)
        .map(|i| {
            (
                format!("/data{i}"),
                FsSummary {
                    size: 1 << 40,
                    used_percent: used,
                },
            )
        })
        .collect();

    Snapshot {
        instance_id: format!("i-{instance}"),
        account_id: "42".to_string(),
        region: "us-east-1".to_string(),
        host_name: format!("host-{instance}"),
        window_start: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_040),
        window: Duration::from_secs(300),
        sample_count: 10,
        cpu_used_percent: used,
        memory_used_percent: used,
        memory_total: 64 << 30,
        fss,
    }
}

fn bench_queue(c: &mut Criterion) {
    c.bench_function("queue/add_coalescing_1k_over_100_keys", |b| {
        b.iter(|| {
            let queue: KeyedQueue<u32, u32> = KeyedQueue::new();
            for i in 0..1_000u32 {
                queue.add(i % 100, i);
            }
            let mut drained = 0;
            while queue.try_remove().is_some() {
                drained += 1;
            }
            black_box(drained)
        })
    });
}

fn bench_instance_stats(c: &mut Criterion) {
    let metrics = health_agent_metrics();
    let default_ts = SystemTime::now();

    c.bench_function("stats/from_metrics_health_agent", |b| {
        b.iter(|| black_box(InstanceStats::from_metrics(black_box(&metrics), default_ts)))
    });
}

fn bench_split_and_buffer(c: &mut Criterion) {
    let limits = CallLimits {
        max_instances: 100,
        max_fs: 50,
    };
    let batch: Vec<Snapshot> = (0..200).map(|i| snapshot(i, 1 + i % 8)).collect();
    let wide = snapshot(0, 400);

    c.bench_function("cost/split_wide_snapshot", |b| {
        b.iter(|| {
            let (call, overflow) = CostCall::from_snapshot(black_box(&wide)).split(limits.max_fs);
            black_box((call.fss.len(), overflow.len()))
        })
    });

    c.bench_function("cost/buffer_200_snapshots", |b| {
        b.iter(|| {
            let mut buffer = CostBuffer::new(limits);
            let mut flushes = 0;
            for snapshot in &batch {
                let (call, _) = CostCall::from_snapshot(snapshot).split(limits.max_fs);
                if let Err(call) = buffer.add(call) {
                    flushes += 1;
                    buffer.clear();
                    if buffer.add(call).is_err() {
                        unreachable!("record larger than an empty buffer");
                    }
                }
            }
            black_box(flushes)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_queue(c);
    bench_instance_stats(c);
    bench_split_and_buffer(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
