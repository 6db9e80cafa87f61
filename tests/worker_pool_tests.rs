// ABOUTME: Integration tests running real echo-worker processes behind a WorkerPool
// ABOUTME: Covers concurrent callers, round-robin dispatch, startup failure and crash recovery

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::broadcast;
use tokio::time::timeout;

use mediaworkers::worker_pool::{
    PoolConfig, PoolEvent, ReplyError, SlotState, SlotStatus, WorkerPool, WorkerPoolBuilder,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn echo_config(workers: usize) -> PoolConfig {
    PoolConfig {
        worker_count: workers,
        endpoint_prefix: "echotest".to_string(),
        restart_backoff_base: Duration::from_millis(50),
        restart_backoff_max: Duration::from_millis(500),
        shutdown_grace: Duration::from_millis(200),
        ..PoolConfig::new(env!("CARGO_BIN_EXE_echo-worker"))
    }
}

async fn next_event(events: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a pool event")
        .expect("event channel closed")
}

/// Start a pool and wait until every worker is connected
async fn start_connected(workers: usize) -> (WorkerPool, broadcast::Receiver<PoolEvent>) {
    let builder = WorkerPoolBuilder::new(echo_config(workers));
    let mut events = builder.subscribe();
    let pool = builder.start().unwrap();

    let mut connected = HashSet::new();
    while connected.len() < workers {
        match next_event(&mut events).await {
            PoolEvent::WorkerConnected { slot } => {
                connected.insert(slot);
            }
            other => panic!("unexpected event during startup: {other:?}"),
        }
    }
    (pool, events)
}

async fn wait_for_slot(pool: &WorkerPool, slot: usize, ready: impl Fn(&SlotStatus) -> bool) -> SlotStatus {
    let poll = async {
        loop {
            let statuses = pool.slot_statuses().await;
            if let Some(status) = statuses.into_iter().find(|s| s.index == slot && ready(s)) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(EVENT_TIMEOUT, poll).await.expect("slot never reached expected state")
}

// ==================== Request routing ====================

#[test]
fn test_concurrent_callers_get_their_own_responses() {
    let builder = WorkerPoolBuilder::new(echo_config(2));
    let mut events = builder.subscribe();
    let pool = Arc::new(builder.start().unwrap());

    let mut connected = HashSet::new();
    while connected.len() < 2 {
        match events.blocking_recv().unwrap() {
            PoolEvent::WorkerConnected { slot } => {
                connected.insert(slot);
            }
            other => panic!("unexpected event during startup: {other:?}"),
        }
    }

    let callers: Vec<_> = (0..5)
        .map(|n| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let reply = pool.send(format!("!tag request {n}").into_bytes());
                let response = reply.wait_blocking();
                (n, response, reply.id())
            })
        })
        .collect();

    // Ids are unique per worker connection, so key them by the serving pid
    let mut served = HashSet::new();
    let mut pids = HashSet::new();
    for caller in callers {
        let (n, response, id) = caller.join().unwrap();
        let response = String::from_utf8(response.unwrap()).unwrap();
        let (pid, text) = response.split_once(' ').expect("pid-prefixed response");
        assert_eq!(text, format!("request {n}"));

        let id = id.expect("delivered reply has an id");
        assert!(served.insert((pid.to_string(), id)), "id {id} reused on worker {pid}");
        pids.insert(pid.to_string());
    }
    assert_eq!(served.len(), 5);
    assert_eq!(pids.len(), 2, "both workers should have served requests");
    assert_eq!(pool.metrics().requests_total, 5);
}

#[tokio::test]
async fn test_requests_alternate_between_workers() {
    let (pool, _events) = start_connected(2).await;

    let mut pids = Vec::new();
    for _ in 0..4 {
        let response = pool.send(b"!pid".to_vec()).wait().await.unwrap();
        pids.push(String::from_utf8(response).unwrap());
    }

    assert_ne!(pids[0], pids[1]);
    assert_eq!(pids[0], pids[2]);
    assert_eq!(pids[1], pids[3]);
}

#[tokio::test]
async fn test_many_interleaved_requests_resolve_to_their_senders() {
    let (pool, _events) = start_connected(2).await;

    // Slow requests keep earlier replies pending while later ones complete
    let slow = pool.send(b"!sleep 200".to_vec());
    let replies: Vec<_> = (0..50)
        .map(|n| (n, pool.send(format!("payload-{n}").into_bytes())))
        .collect();

    for (n, reply) in replies {
        assert_eq!(reply.wait().await, Ok(format!("payload-{n}").into_bytes()));
    }
    assert_eq!(slow.wait().await, Ok(b"slept".to_vec()));
}

#[tokio::test]
async fn test_requests_before_connect_are_queued() {
    let pool = WorkerPool::start(echo_config(1)).unwrap();

    // Sent immediately, before the worker has had time to connect
    let reply = pool.send(b"early".to_vec());
    assert_eq!(timeout(EVENT_TIMEOUT, reply.wait()).await.unwrap(), Ok(b"early".to_vec()));
}

// ==================== Startup failure ====================

#[tokio::test]
async fn test_nonexistent_executable_never_succeeds() {
    let builder = WorkerPoolBuilder::new(PoolConfig {
        worker_count: 2,
        ..PoolConfig::new("/nonexistent/mediaworkers/echo-worker")
    });
    let mut events = builder.subscribe();
    let pool = builder.start().unwrap();

    match next_event(&mut events).await {
        PoolEvent::FailedToStart { error, .. } => assert!(!error.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }

    for _ in 0..3 {
        let outcome = timeout(EVENT_TIMEOUT, pool.send(b"hello".to_vec()).wait()).await.unwrap();
        assert_eq!(outcome, Err(ReplyError::PoolUnavailable));
    }

    let statuses = pool.slot_statuses().await;
    assert!(statuses.iter().all(|s| s.state != SlotState::Connected));
    assert!(
        matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
        "FailedToStart must be published once"
    );
}

// ==================== Crash recovery ====================

#[tokio::test]
async fn test_killed_worker_fails_pending_and_reconnects() {
    let (pool, mut events) = start_connected(1).await;

    let pending: Vec<_> = (0..3).map(|_| pool.send(b"!hang".to_vec())).collect();
    let status = wait_for_slot(&pool, 0, |s| s.pending == 3).await;
    let old_pid = status.pid.expect("connected worker has a pid");

    kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL).unwrap();

    for reply in &pending {
        let outcome = timeout(EVENT_TIMEOUT, reply.wait()).await.unwrap();
        assert_eq!(outcome, Err(ReplyError::ConnectionLost));
    }

    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::WorkerRestarting { slot: 0, .. }
    ));
    assert_eq!(next_event(&mut events).await, PoolEvent::WorkerConnected { slot: 0 });

    let status = wait_for_slot(&pool, 0, |s| s.state == SlotState::Connected).await;
    assert_ne!(status.pid, Some(old_pid));
    assert_eq!(status.restarts, 1);

    assert_eq!(pool.send(b"after".to_vec()).wait().await, Ok(b"after".to_vec()));
}

#[tokio::test]
async fn test_crash_request_loses_connection_and_pool_recovers() {
    let (pool, mut events) = start_connected(1).await;

    let crash = pool.send(b"!crash".to_vec());
    assert_eq!(
        timeout(EVENT_TIMEOUT, crash.wait()).await.unwrap(),
        Err(ReplyError::ConnectionLost)
    );

    match next_event(&mut events).await {
        PoolEvent::WorkerRestarting { slot, reason, .. } => {
            assert_eq!(slot, 0);
            assert!(!reason.is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Sent while the slot is down: queued and served after reconnect
    let queued = pool.send(b"queued".to_vec());
    assert_eq!(timeout(EVENT_TIMEOUT, queued.wait()).await.unwrap(), Ok(b"queued".to_vec()));
    assert_eq!(pool.metrics().worker_restarts, 1);
}

#[tokio::test]
async fn test_clean_worker_exit_is_restarted() {
    let (pool, mut events) = start_connected(1).await;

    let exiting = pool.send(b"!exit".to_vec());
    assert_eq!(
        timeout(EVENT_TIMEOUT, exiting.wait()).await.unwrap(),
        Err(ReplyError::ConnectionLost)
    );
    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::WorkerRestarting { slot: 0, .. }
    ));
    assert_eq!(next_event(&mut events).await, PoolEvent::WorkerConnected { slot: 0 });
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_shutdown_fails_pending_and_stops_workers() {
    let (pool, _events) = start_connected(2).await;

    let hanging = pool.send(b"!hang".to_vec());
    let status = wait_for_slot(&pool, 0, |s| s.pending == 1).await;
    let pid = status.pid.expect("connected worker has a pid");

    let pool = tokio::task::spawn_blocking(move || {
        pool.shutdown();
        pool
    })
    .await
    .unwrap();

    let outcome = timeout(EVENT_TIMEOUT, hanging.wait()).await.unwrap();
    assert!(
        matches!(outcome, Err(ReplyError::ConnectionLost | ReplyError::PoolShutDown)),
        "unexpected outcome {outcome:?}"
    );
    assert!(pool.is_shut_down());

    // The worker was reaped, so signalling it fails
    assert!(kill(Pid::from_raw(pid as i32), None).is_err());
}
