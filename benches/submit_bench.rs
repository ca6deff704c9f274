//! Benchmarks for cross-thread submission
//!
//! Measures:
//! - Blocking round trip to the owning thread
//! - Fire-and-forget submission awaited from another runtime
//! - Zombie marking and draining in batches

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use openworkers_context_group::engine::headless::{HeadlessEngine, HeadlessValue};
use openworkers_context_group::{ContextGroup, ContextGroupHandle, EnginePlatform, GroupConfig, TokioEventLoop};
use std::hint::black_box;
use std::thread;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

/// Owning thread driving one group until the returned sender is dropped.
fn spawn_owner() -> (ContextGroupHandle, oneshot::Sender<()>, thread::JoinHandle<()>) {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let join = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let engine = HeadlessEngine::new();
        let event_loop = TokioEventLoop::new(rt.handle().clone()).unwrap();

        let mut group = ContextGroup::owned(
            &engine,
            EnginePlatform::global(),
            Some(event_loop),
            None,
            GroupConfig::default().with_strict_reference_checks(false),
        )
        .unwrap();
        ready_tx.send(group.handle()).unwrap();

        rt.block_on(async {
            let _ = stop_rx.await;
        });
        group.dispose();
    });

    (ready_rx.recv().unwrap(), stop_tx, join)
}

/// Benchmark: submit_sync round trip (submit, wake, run, complete)
fn bench_submit_sync(c: &mut Criterion) {
    let (handle, stop, join) = spawn_owner();

    c.bench_function("submit_sync_roundtrip", |b| {
        b.iter(|| black_box(handle.submit_sync(|| 42u64).unwrap()));
    });

    drop(stop);
    join.join().unwrap();
}

/// Benchmark: submit_async awaited through a oneshot
fn bench_submit_async(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (handle, stop, join) = spawn_owner();

    c.bench_function("submit_async_awaited", |b| {
        b.to_async(&rt).iter(|| {
            let handle = handle.clone();
            async move {
                let (tx, rx) = oneshot::channel();
                handle
                    .submit_async(move || {
                        let _ = tx.send(());
                    })
                    .unwrap();
                rx.await.unwrap();
            }
        });
    });

    drop(stop);
    join.join().unwrap();
}

/// Benchmark: mark a batch of zombies, then barrier on a sync task
fn bench_zombie_batches(c: &mut Criterion) {
    let (handle, stop, join) = spawn_owner();
    let mut group = c.benchmark_group("zombie_batch");

    for size in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..size {
                    handle.mark_zombie_value(HeadlessValue::new());
                }

                // Zombies drain before tasks in the same cycle
                handle.submit_sync(|| ()).unwrap();
                black_box(handle.pending_zombies());
            });
        });
    }

    group.finish();
    drop(stop);
    join.join().unwrap();
}

criterion_group!(benches, bench_submit_sync, bench_submit_async, bench_zombie_batches);
criterion_main!(benches);
