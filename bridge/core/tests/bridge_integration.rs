//! Integration tests for the Bridge dispatcher
//!
//! Every test drives a real `Bridge` against `FakeEngine`, which records the
//! scripts each transport runs and fails the ones matching a pattern.
//!
//! Patterns used to tell transports apart:
//! - named-pipe setup: `mkfifo`, named-pipe watcher: `/pipes/`
//! - terminal injection: `/dev/pts/0`
//! - signal send: `pkill -USR1`, signal watcher: `trap drain`
//! - exec: `exec.log`
//! - shared-volume: `/inbox/`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_stream::StreamExt;

use bridge_core::shell::SENTINEL;
use bridge_core::{
    Bridge, BridgeConfig, BridgeError, Envelope, FakeEngine, InboundMessage, MessageStream,
    SendOptions, Strategy, StrategyMode, TransportError,
};

/// Exit code the signal send script uses when nobody is listening
const NO_LISTENER: i32 = 3;

fn config(retry_attempts: u32) -> BridgeConfig {
    BridgeConfig {
        retry_attempts,
        retry_delay_ms: 1,
        ..Default::default()
    }
}

fn bridge(engine: &Arc<FakeEngine>, retry_attempts: u32) -> Bridge {
    Bridge::new(engine.clone(), config(retry_attempts)).unwrap()
}

/// Make every strategy before `Exec` unavailable
fn break_fast_strategies(engine: &FakeEngine) {
    engine.fail_matching("mkfifo");
    engine.fail_matching("/dev/pts/0");
    engine.exit_matching("pkill -USR1", NO_LISTENER);
}

fn sentinel_line(envelope: &Envelope) -> String {
    format!("{SENTINEL}{}", envelope.to_line().unwrap())
}

async fn next(stream: &mut MessageStream) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
}

fn first_call_index(engine: &FakeEngine, pattern: &str) -> usize {
    engine
        .calls()
        .iter()
        .position(|c| c.command_line().contains(pattern))
        .unwrap()
}

fn last_call_index(engine: &FakeEngine, pattern: &str) -> usize {
    engine
        .calls()
        .iter()
        .rposition(|c| c.command_line().contains(pattern))
        .unwrap()
}

// =============================================================================
// Send: strategy selection
// =============================================================================

#[tokio::test]
async fn test_auto_mode_falls_back_in_priority_order() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    break_fast_strategies(&engine);
    let bridge = bridge(&engine, 2);

    let result = bridge
        .send("worker-1", "hello", SendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::Exec);
    assert!(result.success);

    // Each earlier strategy used its full retry budget, exec succeeded once
    assert_eq!(engine.count_matching("mkfifo"), 2);
    assert_eq!(engine.count_matching("/dev/pts/0"), 2);
    assert_eq!(engine.count_matching("pkill -USR1"), 2);
    assert_eq!(engine.count_matching("exec.log"), 1);
    assert_eq!(engine.count_matching("/inbox/"), 0);

    // Strictly sequential: no strategy starts before the previous one finished
    assert!(last_call_index(&engine, "mkfifo") < first_call_index(&engine, "/dev/pts/0"));
    assert!(last_call_index(&engine, "/dev/pts/0") < first_call_index(&engine, "pkill -USR1"));
    assert!(last_call_index(&engine, "pkill -USR1") < first_call_index(&engine, "exec.log"));
}

#[tokio::test]
async fn test_ping_lands_via_signal_after_pipe_setup_fails_once() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    engine.fail_matching_times("mkfifo", 1);
    engine.fail_matching("/dev/pts/0");
    let bridge = bridge(&engine, 1);

    let result = bridge
        .send("worker-1", json!({"action": "ping"}), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::Signal);
    assert!(result.success);
    assert_eq!(result.target, "worker-1");
    assert_eq!(engine.count_matching("mkfifo"), 1);
    assert_eq!(engine.count_matching("tee"), 0);
}

#[tokio::test]
async fn test_first_available_strategy_wins_without_fallback() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 3);

    let result = bridge
        .send("worker-1", "hello", SendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::NamedPipe);
    assert_eq!(engine.count_matching("/dev/pts/0"), 0);
}

#[tokio::test]
async fn test_fixed_strategy_surfaces_failure_without_fallback() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    engine.fail_matching("mkfifo");
    let config = BridgeConfig {
        strategy: StrategyMode::Fixed(Strategy::NamedPipe),
        ..config(2)
    };
    let bridge = Bridge::new(engine.clone(), config).unwrap();

    let err = bridge
        .send("worker-1", "hello", SendOptions::default())
        .await
        .unwrap_err();

    match err {
        BridgeError::Transport { strategy, source } => {
            assert_eq!(strategy, Strategy::NamedPipe);
            assert!(matches!(source, TransportError::Setup { .. }));
        }
        other => panic!("expected transport error, got {other}"),
    }
    assert_eq!(engine.count_matching("mkfifo"), 2);
    assert_eq!(engine.count_matching("/dev/pts/0"), 0);
    assert_eq!(engine.count_matching("exec.log"), 0);
}

#[tokio::test]
async fn test_per_call_strategy_override() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);

    let result = bridge
        .send(
            "worker-1",
            "hello",
            SendOptions::default().with_strategy(Strategy::SharedVolume),
        )
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::SharedVolume);
    assert_eq!(engine.count_matching("mkfifo"), 0);
}

#[tokio::test]
async fn test_every_strategy_failing_is_aggregate_failure() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    break_fast_strategies(&engine);
    engine.fail_matching("exec.log");
    engine.fail_matching("/inbox/");
    let bridge = bridge(&engine, 2);

    let err = bridge
        .send("worker-1", "hello", SendOptions::default())
        .await
        .unwrap_err();

    match err {
        BridgeError::AggregateDeliveryFailure {
            target,
            attempts,
            last,
        } => {
            assert_eq!(target, "worker-1");
            assert_eq!(attempts, 10);
            assert!(matches!(
                last,
                TransportError::Write {
                    strategy: Strategy::SharedVolume,
                    ..
                }
            ));
        }
        other => panic!("expected aggregate failure, got {other}"),
    }
}

#[tokio::test]
async fn test_unknown_target_is_not_retried() {
    let engine = Arc::new(FakeEngine::new());
    let bridge = bridge(&engine, 3);

    let err = bridge
        .send("ghost", "hello", SendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::ContainerNotFound(ref id) if id == "ghost"));
    assert!(!err.is_retryable());
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_caller_supplied_id_and_sender_are_kept() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);

    let result = bridge
        .send(
            "worker-1",
            "hello",
            SendOptions::default()
                .from("planner")
                .with_id("task-42")
                .with_strategy(Strategy::Exec),
        )
        .await
        .unwrap();

    assert_eq!(result.message_id.as_str(), "task-42");
    let call = &engine.calls()[0];
    let envelope = Envelope::from_line(&call.command.env[0].1).unwrap();
    assert_eq!(envelope.from(), "planner");
    assert_eq!(envelope.to(), "worker-1");
    assert_eq!(envelope.payload(), "hello");
}

// =============================================================================
// Setup idempotence
// =============================================================================

#[tokio::test]
async fn test_repeated_sends_reuse_pipe_and_inbox() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);

    for strategy in [Strategy::NamedPipe, Strategy::SharedVolume] {
        for _ in 0..2 {
            bridge
                .send(
                    "worker-1",
                    "hello",
                    SendOptions::default().with_strategy(strategy),
                )
                .await
                .unwrap();
        }
    }

    let setups: HashSet<String> = engine
        .calls()
        .iter()
        .map(|c| c.command_line())
        .filter(|l| l.contains("mkfifo"))
        .collect();
    assert_eq!(setups.len(), 1);

    let inbox_dirs: HashSet<String> = engine
        .calls()
        .iter()
        .map(|c| c.command_line())
        .filter(|l| l.contains("/inbox/"))
        .filter_map(|l| l.lines().next().map(str::to_string))
        .collect();
    assert_eq!(inbox_dirs.len(), 1);
}

// =============================================================================
// Broadcast
// =============================================================================

#[tokio::test]
async fn test_broadcast_isolates_unreachable_target() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_container("a")
            .with_container("c"),
    );
    let bridge = bridge(&engine, 1);

    let report = bridge
        .broadcast(["a", "b", "c"], "ping", SendOptions::default())
        .await;

    let targets: Vec<&str> = report.results.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["a", "b", "c"]);
    assert_eq!(report.fulfilled().len(), 2);
    assert!(!report.all_succeeded());
    assert!(!report.all_failed());

    let rejected = report.rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0, "b");
    assert!(matches!(rejected[0].1, BridgeError::ContainerNotFound(_)));
}

#[tokio::test]
async fn test_broadcast_rejects_stopped_container_without_retry() {
    let engine = Arc::new(FakeEngine::new().with_container("a"));
    engine.add_stopped_container("b");
    let bridge = bridge(&engine, 3);

    let report = bridge
        .broadcast(["a", "b"], "ping", SendOptions::default())
        .await;

    assert!(report.results[0].is_fulfilled());
    let rejected = report.rejected();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0].1, BridgeError::ContainerNotFound(ref id) if id == "b"));
    assert!(engine.calls().iter().all(|call| call.container != "b"));
}

#[tokio::test]
async fn test_broadcast_failure_on_one_target_does_not_stop_others() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_container("a")
            .with_container("b"),
    );
    // Only b's pipe is broken; b still lands via fallback
    engine.fail_matching("pipes/b.fifo");
    let bridge = bridge(&engine, 1);

    let report = bridge
        .broadcast(vec!["a".to_string(), "b".to_string()], "ping", SendOptions::default())
        .await;

    assert!(report.all_succeeded());
    let strategies: Vec<Strategy> = report.fulfilled().iter().map(|r| r.strategy_used).collect();
    assert_eq!(strategies, vec![Strategy::NamedPipe, Strategy::TerminalInjection]);
}

// =============================================================================
// Listen / stop
// =============================================================================

#[tokio::test]
async fn test_listen_merges_and_does_not_deduplicate() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);
    let mut stream = bridge.listen(Some("worker-1")).await.unwrap();

    let envelope = Envelope::new(Some("dup-1".into()), "coord", "worker-1", "hello");
    let line = sentinel_line(&envelope);
    assert_eq!(engine.feed("worker-1", "/pipes/", &line), 1);
    assert_eq!(engine.feed("worker-1", "/inbox/", &line), 1);

    let first = next(&mut stream).await;
    let second = next(&mut stream).await;

    assert_eq!(first.envelope.id().as_str(), "dup-1");
    assert_eq!(second.envelope.id().as_str(), "dup-1");
    let strategies: HashSet<Strategy> = [first.strategy, second.strategy].into_iter().collect();
    assert_eq!(
        strategies,
        HashSet::from([Strategy::NamedPipe, Strategy::SharedVolume])
    );

    bridge.stop().await;
}

#[tokio::test]
async fn test_listen_starts_every_listen_capable_transport() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);
    let _stream = bridge.listen(Some("worker-1")).await.unwrap();

    assert_eq!(engine.live_streams("/pipes/"), 1);
    assert_eq!(engine.live_streams("trap drain"), 1);
    assert_eq!(engine.live_streams("/inbox/"), 1);
    assert_eq!(engine.live_streams("/dev/pts/0"), 0);

    bridge.stop().await;
}

#[tokio::test]
async fn test_second_listen_replaces_watchers() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);

    let _old = bridge.listen(Some("worker-1")).await.unwrap();
    let mut current = bridge.listen(Some("worker-1")).await.unwrap();

    assert_eq!(engine.live_streams("/pipes/"), 1);
    assert_eq!(engine.live_streams("/inbox/"), 1);

    let envelope = Envelope::new(None, "coord", "worker-1", "after replace");
    engine.feed("worker-1", "/pipes/", &sentinel_line(&envelope));
    assert_eq!(next(&mut current).await.envelope.payload(), "after replace");

    bridge.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_terminal() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);
    let mut stream = bridge.listen(Some("worker-1")).await.unwrap();

    // Buffered but never read before stop
    let envelope = Envelope::new(None, "coord", "worker-1", "late");
    engine.feed("worker-1", "/inbox/", &sentinel_line(&envelope));

    bridge.stop().await;
    bridge.stop().await;

    assert!(!bridge.is_listening());
    assert_eq!(engine.live_streams("/pipes/"), 0);
    assert_eq!(engine.live_streams("/inbox/"), 0);
    assert_eq!(engine.feed("worker-1", "/pipes/", &sentinel_line(&envelope)), 0);
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn test_stop_without_listen_is_noop() {
    let engine = Arc::new(FakeEngine::new());
    let bridge = bridge(&engine, 1);
    bridge.stop().await;
    bridge.stop().await;
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_listen_survives_one_failing_transport() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    engine.reject_matching("trap drain");
    let bridge = bridge(&engine, 1);

    let _stream = bridge.listen(Some("worker-1")).await.unwrap();
    assert!(bridge.is_listening());
    assert_eq!(engine.live_streams("/pipes/"), 1);
    bridge.stop().await;
}

#[tokio::test]
async fn test_listen_fails_when_no_transport_starts() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    engine.reject_matching("sandbox-bridge-watch");
    let bridge = bridge(&engine, 1);

    let result = bridge.listen(Some("worker-1")).await;
    assert!(matches!(result, Err(BridgeError::ListenFailed(_))));
    assert!(!bridge.is_listening());
}

#[tokio::test]
async fn test_listen_uses_configured_identity() {
    let engine = Arc::new(FakeEngine::new().with_container("coordinator"));
    let config = BridgeConfig {
        self_identity: Some("coordinator".into()),
        ..config(1)
    };
    let bridge = Bridge::new(engine.clone(), config).unwrap();

    let _stream = bridge.listen(None).await.unwrap();
    assert_eq!(engine.live_streams("pipes/coordinator.fifo"), 1);
    bridge.stop().await;
}

#[tokio::test]
async fn test_listen_on_unknown_identity() {
    let engine = Arc::new(FakeEngine::new());
    let bridge = bridge(&engine, 1);
    let result = bridge.listen(Some("ghost")).await;
    assert!(matches!(result, Err(BridgeError::ContainerNotFound(_))));
}

#[tokio::test]
async fn test_message_stream_as_stream() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let bridge = bridge(&engine, 1);
    let stream = bridge.listen(Some("worker-1")).await.unwrap();
    let mut stream = Box::pin(stream.into_stream());

    let envelope = Envelope::new(Some("s-1".into()), "coord", "worker-1", "via stream");
    engine.feed("worker-1", "trap drain", &sentinel_line(&envelope));

    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.strategy, Strategy::Signal);
    assert_eq!(msg.envelope, envelope);

    bridge.stop().await;
    assert!(stream.next().await.is_none());
}

// =============================================================================
// Liveness and inbox helpers
// =============================================================================

#[tokio::test]
async fn test_is_alive() {
    let engine = Arc::new(FakeEngine::new().with_container("running"));
    engine.add_stopped_container("stopped");
    let bridge = bridge(&engine, 1);

    assert!(bridge.is_alive("running").await);
    assert!(!bridge.is_alive("stopped").await);
    assert!(!bridge.is_alive("ghost").await);
}

#[tokio::test]
async fn test_pending_and_purge_inbox() {
    let engine = Arc::new(FakeEngine::new().with_container("worker-1"));
    let listing: String = ["m-2", "m-1"]
        .iter()
        .map(|id| Envelope::new(Some((*id).into()), "coordinator", "worker-1", "ping"))
        .map(|envelope| sentinel_line(&envelope) + "\n")
        .collect();
    engine.respond_matching("cat", &listing);
    let bridge = bridge(&engine, 1);

    let pending = bridge.pending("worker-1").await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["m-1", "m-2"]);

    bridge.purge("worker-1").await.unwrap();
    assert_eq!(engine.count_matching("rm -f"), 1);
}
