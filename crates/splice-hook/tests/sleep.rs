// SPDX-License-Identifier: (MIT OR Apache-2.0)

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use splice_hook::{FeatureFlagSet, HookContext, Value};
use splice_rt::{Worker, WorkerCensus};

use common::{host_classes, host_table, scope};

fn sleeping(census: &WorkerCensus) -> HookContext {
    let mut ctx = HookContext::new(scope(census), host_table(), host_classes());
    assert!(ctx.set_flags(FeatureFlagSet::SLEEP));
    ctx
}

#[test]
fn hooked_usleep_yields_to_other_tasks() {
    let census = WorkerCensus::new();
    let ctx = sleeping(&census);
    let worker = Worker::with_census(&census).unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let (result, seen) = worker.block_on(async {
        let other = splice_rt::spawn(async move { flag.store(true, Ordering::SeqCst) });
        let result = ctx.call("usleep", vec![Value::Int(20_000)]).await;
        (result, other.is_finished())
    });
    assert_eq!(result, Ok(Value::Null));
    assert!(seen);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn concurrent_sleeps_overlap() {
    let census = WorkerCensus::new();
    let ctx = sleeping(&census);
    let worker = Worker::with_census(&census).unwrap();

    let started = Instant::now();
    let results = worker.block_on(async {
        let naps: Vec<_> = (0..5)
            .map(|_| splice_rt::spawn(ctx.call("usleep", vec![Value::Int(100_000)])))
            .collect();
        let mut results = Vec::new();
        for nap in naps {
            results.push(nap.await.unwrap());
        }
        results
    });
    assert!(results.iter().all(|r| *r == Ok(Value::Null)));
    assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
}

#[test]
fn outside_a_task_the_thread_blocks() {
    let census = WorkerCensus::new();
    let ctx = sleeping(&census);

    let started = Instant::now();
    let result = splice_rt::block_on(ctx.call("usleep", vec![Value::Int(30_000)]));
    assert_eq!(result, Ok(Value::Null));
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn results_match_each_routine() {
    let census = WorkerCensus::new();
    let ctx = sleeping(&census);
    let worker = Worker::with_census(&census).unwrap();

    worker.block_on(async {
        assert_eq!(ctx.call("sleep", vec![Value::Int(0)]).await, Ok(Value::Int(0)));
        assert_eq!(
            ctx.call("time_nanosleep", vec![Value::Int(0), Value::Int(1_000)]).await,
            Ok(Value::Bool(true))
        );
        assert_eq!(ctx.call("usleep", vec![Value::Int(-1)]).await, Ok(Value::Bool(false)));
        assert_eq!(
            ctx.call("time_sleep_until", vec![Value::Float(1.0)]).await,
            Ok(Value::Bool(false))
        );
    });
}

#[test]
fn huge_arguments_park_instead_of_panicking() {
    let census = WorkerCensus::new();
    let ctx = sleeping(&census);
    let worker = Worker::with_census(&census).unwrap();
    let short = Duration::from_millis(20);

    let outcomes = worker.block_on(async {
        let calls = [
            ctx.call("sleep", vec![Value::Int(i64::MAX)]),
            ctx.call("usleep", vec![Value::Int(i64::MAX)]),
            ctx.call("time_nanosleep", vec![Value::Int(i64::MAX), Value::Int(i64::MAX)]),
            ctx.call("time_sleep_until", vec![Value::Float(1e30)]),
        ];
        let mut outcomes = Vec::new();
        for call in calls {
            let task = splice_rt::spawn(splice_rt::timeout(short, call));
            outcomes.push(task.await);
        }
        outcomes
    });
    assert_eq!(outcomes.len(), 4);
    for outcome in outcomes {
        assert!(matches!(outcome, Ok(Err(splice_rt::Elapsed))), "{:?}", outcome);
    }
}
