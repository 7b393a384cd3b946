//! End-to-end scenarios driven entirely in-process through
//! [`support::InMemoryFactory`] — a real [`Dispatcher`] joined to a real
//! [`Pool`] over the same trait seams a subprocess transport would use.

mod support;

use bytes::Bytes;
use forgepool_core::dispatcher::{AbortTimeoutPolicy, CallContext, Dispatcher, Handler};
use forgepool_core::error::PoolError;
use forgepool_core::pool::{ExecOptions, MinWorkers, Pool, PoolConfig};
use forgepool_core::value::Value;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::InMemoryFactory;

fn handler(
    f: impl Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<Value, PoolError>> + Send + Sync + 'static,
) -> Handler {
    Arc::new(f)
}

#[tokio::test]
async fn fibonacci_style_load_never_exceeds_worker_cap() {
    let factory = InMemoryFactory::new(|| {
        Dispatcher::new().register(
            "inc",
            handler(|args, _ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    let n = match &args[0] {
                        Value::Number(n) => *n,
                        _ => 0.0,
                    };
                    Ok(Value::Number(n + 1.0))
                })
            }),
        )
    });
    let config = PoolConfig::default()
        .with_min_workers(MinWorkers::Fixed(0))
        .with_max_workers(3)
        .with_max_tasks_per_worker(1);
    let pool = Pool::new(factory, config);

    let mut handles = Vec::new();
    for i in 0..10 {
        let h = pool
            .exec("inc", vec![Value::Number(i as f64)], ExecOptions::default())
            .await
            .expect("exec accepted");
        handles.push(h);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mid_flight = pool.stats().await;
    assert!(mid_flight.busy_workers <= 3, "never more than 3 workers busy at once");
    assert!(mid_flight.total_workers <= 3);

    for (i, h) in handles.into_iter().enumerate() {
        let result = h.await.expect("task settles");
        assert_eq!(result, Value::Number(i as f64 + 1.0));
    }
}

#[tokio::test]
async fn cancel_in_flight_settles_with_cancellation_and_keeps_worker() {
    let factory = InMemoryFactory::new(|| {
        Dispatcher::new().register(
            "sleep_cancelable",
            handler(|_args, ctx| {
                Box::pin(async move {
                    let (abort_tx, abort_rx) = tokio::sync::oneshot::channel::<()>();
                    let abort_tx = Mutex::new(Some(abort_tx));
                    ctx.on_abort(move || {
                        if let Some(tx) = abort_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        Box::pin(async {})
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(Value::Number(1.0)),
                        _ = abort_rx => Err(PoolError::Cancellation),
                    }
                })
            }),
        )
    });
    let config = PoolConfig::default().with_max_workers(1);
    let pool = Pool::new(factory, config);

    let handle = pool
        .exec("sleep_cancelable", Vec::new(), ExecOptions::default())
        .await
        .expect("exec accepted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.expect("settles promptly");
    assert!(matches!(result, Err(PoolError::Cancellation)));

    let stats = pool.stats().await;
    assert_eq!(stats.total_workers, 1, "worker survives a cooperative abort");
}

#[tokio::test]
async fn abort_handler_hangs_kills_worker_and_pool_recovers() {
    let factory = InMemoryFactory::new(|| {
        Dispatcher::new()
            .with_abort_listener_timeout(Duration::from_millis(30))
            .with_abort_timeout_policy(AbortTimeoutPolicy::ReturnOutcome)
            .register(
                "sleep_unresponsive",
                handler(|_args, ctx| {
                    Box::pin(async move {
                        ctx.on_abort(|| Box::pin(futures::future::pending::<()>()));
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(Value::Null)
                    })
                }),
            )
    });
    let config = PoolConfig::default().with_max_workers(1);
    let pool = Pool::new(factory, config);

    let handle = pool
        .exec("sleep_unresponsive", Vec::new(), ExecOptions::default())
        .await
        .expect("exec accepted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.expect("settles promptly");
    assert!(matches!(result, Err(PoolError::Cancellation)));

    // Give the hung worker's own exit (triggered by the abort listener
    // timeout) time to reach the pool before routing the next call.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let handle2 = pool
        .exec("sleep_unresponsive", Vec::new(), ExecOptions::default())
        .await
        .expect("exec accepted on a fresh worker");
    handle2.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle2).await;
}

#[tokio::test]
async fn streaming_events_arrive_in_order_before_settlement() {
    let factory = InMemoryFactory::new(|| {
        Dispatcher::new().register(
            "progress",
            handler(|_args, ctx| {
                Box::pin(async move {
                    for i in 0..5 {
                        ctx.emit(Value::Number(i as f64));
                        tokio::task::yield_now().await;
                    }
                    Ok(Value::Number(42.0))
                })
            }),
        )
    });
    let pool = Pool::new(factory, PoolConfig::default().with_max_workers(1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let opts = ExecOptions {
        on: Some(Box::new(move |payload: Value| {
            if let Value::Number(n) = payload {
                seen_clone.lock().unwrap().push(n);
            }
        })),
        transfer: Vec::new(),
        timeout: None,
    };
    let handle = pool.exec("progress", Vec::new(), opts).await.expect("exec accepted");
    let result = handle.await.expect("task settles");

    assert_eq!(result, Value::Number(42.0));
    assert_eq!(*seen.lock().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
}

#[tokio::test]
async fn graceful_terminate_runs_cleanup_once_per_worker() {
    let cleanup_runs = Arc::new(AtomicUsize::new(0));
    let factory = {
        let cleanup_runs = cleanup_runs.clone();
        InMemoryFactory::new(move || {
            let cleanup_runs = cleanup_runs.clone();
            Dispatcher::new()
                .register(
                    "noop",
                    handler(|_args, _ctx| Box::pin(async move { Ok(Value::Null) })),
                )
                .on_terminate(handler(move |_args, _ctx| {
                    let cleanup_runs = cleanup_runs.clone();
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        cleanup_runs.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    })
                }))
        })
    };
    let config = PoolConfig::default().with_max_workers(3).with_min_workers(MinWorkers::Fixed(3));
    let pool = Pool::new(factory, config);

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(pool.exec("noop", Vec::new(), ExecOptions::default()).await.expect("exec accepted"));
    }
    for h in handles {
        h.await.expect("task settles");
    }

    tokio::time::timeout(Duration::from_secs(2), pool.terminate(false, None))
        .await
        .expect("terminate resolves");

    assert_eq!(cleanup_runs.load(Ordering::SeqCst), 3);

    let rejected = pool.exec("noop", Vec::new(), ExecOptions::default()).await;
    assert!(matches!(rejected, Err(PoolError::PoolTerminated)));
}

// S5: a handler that hands over a binary region via `emit_with_transfer`
// reports it as genuinely moved (`isDetached`) over the in-memory
// transport, which owns both ends of the pipe and never needs to copy.
#[tokio::test]
async fn create_array_style_emit_reports_transfer_detachment() {
    let factory = InMemoryFactory::new(|| {
        Dispatcher::new().register(
            "create_array",
            handler(|args, ctx| {
                Box::pin(async move {
                    let n = match args.first() {
                        Some(Value::Number(n)) => *n as usize,
                        _ => 0,
                    };
                    let region = Bytes::from(vec![0u8; n]);
                    let detached = ctx.emit_with_transfer(Value::Bytes(region), vec![Bytes::from(vec![1u8; n])]).await;
                    Ok(Value::Bool(detached))
                })
            }),
        )
    });
    let pool = Pool::new(factory, PoolConfig::default().with_max_workers(1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let opts = ExecOptions {
        on: Some(Box::new(move |payload: Value| {
            if let Value::Bytes(b) = payload {
                seen_clone.lock().unwrap().push(b);
            }
        })),
        transfer: vec![forgepool_core::Transfer::new(Bytes::from(vec![9u8; 4]))],
        timeout: None,
    };
    let handle = pool.exec("create_array", vec![Value::Number(4.0)], opts).await.expect("exec accepted");
    let result = handle.await.expect("task settles");

    assert_eq!(result, Value::Bool(true), "in-memory transport reports a genuine move");
    assert_eq!(seen.lock().unwrap().as_slice(), &[Bytes::from(vec![0u8; 4])]);
}

// Exercises the worker->pool `SwallowedError` envelope for a panicking
// abort callback: the pool counts it without the panic settling the task
// with anything other than the normal cancellation outcome.
#[tokio::test]
async fn panicking_abort_callback_is_swallowed_and_counted() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let factory = InMemoryFactory::new(|| {
        Dispatcher::new().register(
            "sleep_bad_abort",
            handler(|_args, ctx| {
                Box::pin(async move {
                    let (abort_tx, abort_rx) = tokio::sync::oneshot::channel::<()>();
                    let abort_tx = Mutex::new(Some(abort_tx));
                    ctx.on_abort(move || {
                        if let Some(tx) = abort_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        panic!("onAbort blew up");
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(Value::Number(1.0)),
                        _ = abort_rx => Err(PoolError::Cancellation),
                    }
                })
            }),
        )
    });
    let pool = Pool::new(factory, PoolConfig::default().with_max_workers(1));

    let handle = pool
        .exec("sleep_bad_abort", Vec::new(), ExecOptions::default())
        .await
        .expect("exec accepted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.expect("settles promptly");
    assert!(matches!(result, Err(PoolError::Cancellation)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pool.stats().await;
    assert_eq!(stats.swallowed_errors, 1);
    assert_eq!(stats.total_workers, 1, "worker survives a panicking abort callback");
}

// Exercises the worker->pool `SwallowedError` envelope for a failing
// `onTerminate` hook.
#[tokio::test]
async fn failing_cleanup_hook_is_swallowed_and_counted() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let factory = InMemoryFactory::new(|| {
        Dispatcher::new()
            .register("noop", handler(|_args, _ctx| Box::pin(async move { Ok(Value::Null) })))
            .on_terminate(handler(|_args, _ctx| {
                Box::pin(async move {
                    Err(PoolError::Handler {
                        message: "cleanup failed".to_string(),
                        stack: None,
                        fields: Value::Null,
                    })
                })
            }))
    });
    let config = PoolConfig::default().with_max_workers(1).with_min_workers(MinWorkers::Fixed(1));
    let pool = Pool::new(factory, config);

    let h = pool.exec("noop", Vec::new(), ExecOptions::default()).await.expect("exec accepted");
    h.await.expect("task settles");

    tokio::time::timeout(Duration::from_secs(2), pool.terminate(false, None))
        .await
        .expect("terminate resolves");

    let stats = pool.stats().await;
    assert_eq!(stats.swallowed_errors, 1);
}
