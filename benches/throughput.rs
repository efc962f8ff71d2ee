use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use plumbline::config::{EngineConfig, LoadedConfig};
use plumbline::engine::{Engine, RunStats};
use plumbline::pipeline::queue::{ChannelQueue, Queue};

fn bodyfile(lines: usize) -> String {
    let mut body = String::with_capacity(lines * 80);
    for n in 0..lines {
        let _ = writeln!(
            body,
            "0|/var/log/file{n}|{n}|-rw-r--r--|0|0|{}|1700000000|1700000100|1700000200|0",
            n * 10
        );
    }
    body
}

fn run_engine(source: &std::path::Path, single_threaded: bool) -> RunStats {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        source_path: Some(source.to_path_buf()),
        output_path: temp_dir.path().join("timeline"),
        recursive: true,
        single_threaded,
        worker_count: 4,
        ..EngineConfig::default()
    };
    Engine::new(LoadedConfig::from_config(config))
        .run()
        .expect("run")
}

fn bench_engine(c: &mut Criterion) {
    let evidence = tempfile::tempdir().expect("tempdir");
    for n in 0..16 {
        std::fs::write(evidence.path().join(format!("body{n}.txt")), bodyfile(500))
            .expect("write bodyfile");
    }

    let mut group = c.benchmark_group("engine");
    group.sample_size(10);
    group.throughput(Throughput::Elements(16 * 500));
    for (label, single_threaded) in [("sequential", true), ("parallel", false)] {
        group.bench_with_input(
            BenchmarkId::new("bodyfile_dir", label),
            &single_threaded,
            |b, &single_threaded| b.iter(|| run_engine(evidence.path(), single_threaded)),
        );
    }
    group.finish();
}

fn bench_channel_queue(c: &mut Criterion) {
    const ITEMS: u64 = 100_000;
    let mut group = c.benchmark_group("channel_queue");
    group.throughput(Throughput::Elements(ITEMS));
    for capacity in [64usize, 1024] {
        group.bench_with_input(
            BenchmarkId::new("spsc", capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let queue: Arc<ChannelQueue<u64>> =
                        Arc::new(ChannelQueue::new("bench", capacity));
                    let producer = {
                        let queue = queue.clone();
                        thread::spawn(move || {
                            for n in 0..ITEMS {
                                if queue.push(n).is_err() {
                                    break;
                                }
                            }
                            Queue::close(queue.as_ref());
                        })
                    };
                    let mut sum = 0u64;
                    while let Some(n) = queue.pop() {
                        sum = sum.wrapping_add(n);
                    }
                    let _ = producer.join();
                    sum
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_channel_queue, bench_engine);
criterion_main!(benches);
