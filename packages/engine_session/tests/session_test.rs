//! End-to-end tests against a scripted fake engine (`/bin/sh`).
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_session::{
    EngineConfig, EngineError, EngineEvent, EngineManager, EngineState, MarkerProfile,
};

/// Speaks just enough UCI: announces readiness on launch, answers `isready`,
/// replies to any `go` with `bestmove e2e4` and echoes everything else.
const FAKE_ENGINE: &str = r#"
echo "id name fake"
echo "readyok"
while IFS= read -r line; do
  case "$line" in
    isready) echo "readyok" ;;
    go*) echo "info string $line"; echo "bestmove e2e4" ;;
    close) exec >&- ;;
    quit) exit 0 ;;
    *) echo "got $line" ;;
  esac
done
"#;

/// Ignores quit, SIGTERM and stdin EOF
const STUBBORN_ENGINE: &str = r#"
trap '' TERM
echo "readyok"
while true; do sleep 0.05; done
"#;

/// Announces readiness, then never reads its input again
const DEAF_ENGINE: &str = r#"
echo "readyok"
exec sleep 30
"#;

/// Closes its input before announcing readiness; output stays open
const CLOSED_INPUT_ENGINE: &str = r#"
exec <&-
echo "readyok"
exec sleep 30
"#;

fn fake_config(script: &str) -> EngineConfig {
    let mut profile = MarkerProfile::uci();
    profile.handshake.clear();
    EngineConfig {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        profile,
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read lines until `predicate` matches one, returning everything read
async fn read_until(manager: &EngineManager, predicate: impl Fn(&str) -> bool) -> Vec<String> {
    let mut lines = Vec::new();
    wait_until("output line", || {
        while let Some(line) = manager.read() {
            let done = predicate(&line);
            lines.push(line);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    lines
}

async fn started(script: &str) -> EngineManager {
    let manager = EngineManager::new(fake_config(script));
    manager.startup().await.expect("startup");
    wait_until("ready", || manager.is_ready()).await;
    manager
}

#[tokio::test]
async fn becomes_ready_then_thinks_and_returns_bestmove() {
    let manager = EngineManager::new(fake_config(FAKE_ENGINE));
    let id = manager.startup().await.unwrap();
    assert_eq!(manager.session_id(), Some(id));
    wait_until("ready", || manager.is_ready()).await;

    let mut events = manager.subscribe();
    manager.send("go").await.unwrap();

    wait_until("search to finish", || !manager.is_thinking()).await;
    assert!(manager.is_ready());

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![EngineState::Thinking, EngineState::Ready]);

    let lines = read_until(&manager, |l| l == "bestmove e2e4").await;
    assert_eq!(lines.first().map(String::as_str), Some("id name fake"));
    assert_eq!(lines.last().map(String::as_str), Some("bestmove e2e4"));

    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), EngineState::Terminated);
}

#[tokio::test]
async fn commands_arrive_in_order_with_one_newline_each() {
    let manager = started(FAKE_ENGINE).await;
    let commands = [
        "position startpos",
        "setoption name Hash value 16\n",
        "ucinewgame\r\n",
        "debug off\n\n",
    ];
    for command in commands {
        manager.send(command).await.unwrap();
    }
    manager.send("isready").await.unwrap();

    let lines = read_until(&manager, |l| l.starts_with("got debug")).await;
    let echoed: Vec<&str> = lines
        .iter()
        .filter_map(|l| l.strip_prefix("got "))
        .collect();
    assert_eq!(
        echoed,
        vec![
            "position startpos",
            "setoption name Hash value 16",
            "ucinewgame",
            "debug off",
        ]
    );
    // An extra newline would have produced an empty `got ` echo
    assert!(!lines.iter().any(|l| l == "got" || l == "got "));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_on_empty_queue_returns_none_immediately() {
    let manager = started(FAKE_ENGINE).await;
    read_until(&manager, |l| l == "readyok").await;

    let start = Instant::now();
    assert_eq!(manager.read(), None);
    assert!(start.elapsed() < Duration::from_millis(50));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_startup_is_rejected_and_first_session_survives() {
    let manager = started(FAKE_ENGINE).await;
    let first = manager.session_id();

    assert_eq!(manager.startup().await, Err(EngineError::AlreadyRunning));
    assert_eq!(manager.session_id(), first);
    assert!(manager.is_ready());

    manager.send("ping").await.unwrap();
    let lines = read_until(&manager, |l| l == "got ping").await;
    assert_eq!(lines.last().map(String::as_str), Some("got ping"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let manager = started(FAKE_ENGINE).await;
    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), EngineState::Terminated);
    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), EngineState::Terminated);
    assert_eq!(manager.send("isready").await, Err(EngineError::NotRunning));
}

#[tokio::test]
async fn missing_binary_is_spawn_failure() {
    let config = EngineConfig {
        program: "/nonexistent/engines/eleeye".to_string(),
        ..Default::default()
    };
    let manager = EngineManager::new(config);

    let err = manager.startup().await.unwrap_err();
    assert!(matches!(err, EngineError::SpawnFailure { .. }), "{:?}", err);
    assert_eq!(manager.state(), EngineState::Failed);
    assert!(!manager.reader_active());

    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), EngineState::Terminated);
}

#[tokio::test]
async fn closed_output_fails_the_session() {
    let manager = started(FAKE_ENGINE).await;
    manager.send("close").await.unwrap();

    wait_until("failure", || manager.state() == EngineState::Failed).await;
    assert!(!manager.is_ready());

    let err = manager.send("isready").await.unwrap_err();
    assert!(matches!(err, EngineError::Failed | EngineError::NotRunning));

    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), EngineState::Terminated);
}

#[tokio::test]
async fn shutdown_stops_reader_and_reaps_process() {
    let manager = started(FAKE_ENGINE).await;
    let pid = manager.pid().expect("pid");
    assert!(manager.reader_active());

    manager.shutdown().await.unwrap();

    assert!(!manager.reader_active());
    let status = manager.last_exit_status().expect("exit status collected");
    assert!(status.success());

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    assert!(kill(Pid::from_raw(pid as i32), None).is_err());
}

#[tokio::test]
async fn write_to_closed_input_is_io_failure() {
    let mut config = fake_config(CLOSED_INPUT_ENGINE);
    config.shutdown_grace = Duration::from_millis(200);
    let manager = EngineManager::new(config);
    manager.startup().await.unwrap();
    wait_until("ready", || manager.is_ready()).await;

    let err = manager.send("isready").await.unwrap_err();
    assert!(matches!(err, EngineError::IoFailure(_)), "{:?}", err);
    assert_eq!(manager.state(), EngineState::Failed);
    assert_eq!(manager.send("isready").await, Err(EngineError::Failed));

    let _ = manager.shutdown().await;
    assert_eq!(manager.state(), EngineState::Terminated);
}

#[tokio::test]
async fn send_to_engine_that_stopped_reading_times_out() {
    let mut config = fake_config(DEAF_ENGINE);
    config.shutdown_grace = Duration::from_millis(200);
    config.write_timeout = Duration::from_millis(200);
    let manager = EngineManager::new(config);
    manager.startup().await.unwrap();
    wait_until("ready", || manager.is_ready()).await;

    let flood = "x".repeat(1 << 20);
    let start = Instant::now();
    let err = manager.send(&flood).await.unwrap_err();
    assert!(matches!(err, EngineError::IoFailure(_)), "{:?}", err);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.state(), EngineState::Failed);
    assert_eq!(manager.send("isready").await, Err(EngineError::Failed));

    let _ = manager.shutdown().await;
    assert_eq!(manager.state(), EngineState::Terminated);
}

#[tokio::test]
async fn shutdown_is_bounded_while_a_send_is_blocked() {
    let mut config = fake_config(DEAF_ENGINE);
    config.shutdown_grace = Duration::from_millis(200);
    config.write_timeout = Duration::from_secs(30);
    let manager = Arc::new(EngineManager::new(config));
    manager.startup().await.unwrap();
    wait_until("ready", || manager.is_ready()).await;

    let blocked = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send(&"x".repeat(1 << 20)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown finished");
    assert!(matches!(result, Err(EngineError::ShutdownTimeout(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.state(), EngineState::Terminated);

    // Killing the engine breaks the pipe under the stuck writer
    let send = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("blocked send released")
        .unwrap();
    assert!(matches!(send, Err(EngineError::IoFailure(_))), "{:?}", send);
}

#[tokio::test]
async fn unresponsive_engine_is_killed_after_grace_period() {
    let mut config = fake_config(STUBBORN_ENGINE);
    config.shutdown_grace = Duration::from_millis(200);
    let manager = EngineManager::new(config);
    manager.startup().await.unwrap();
    wait_until("ready", || manager.is_ready()).await;

    let start = Instant::now();
    let result = manager.shutdown().await;
    assert!(matches!(result, Err(EngineError::ShutdownTimeout(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.state(), EngineState::Terminated);
    assert!(!manager.reader_active());
    assert!(manager.last_exit_status().is_some());
}

#[tokio::test]
async fn restart_creates_a_fresh_session() {
    let manager = started(FAKE_ENGINE).await;
    let first = manager.session_id().unwrap();
    manager.shutdown().await.unwrap();

    let second = manager.startup().await.unwrap();
    assert_ne!(first, second);
    wait_until("ready", || manager.is_ready()).await;
    let lines = read_until(&manager, |l| l == "readyok").await;
    assert_eq!(lines.first().map(String::as_str), Some("id name fake"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn go_uses_configured_search_depth() {
    let manager = started(FAKE_ENGINE).await;
    manager.change_search_depth(5).unwrap();
    manager.go().await.unwrap();

    let lines = read_until(&manager, |l| l.starts_with("bestmove")).await;
    assert!(lines.iter().any(|l| l == "info string go depth 5"));
    wait_until("ready", || manager.is_ready()).await;
    assert_eq!(manager.pending_commands(), 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn search_depth_is_appended_to_plain_go() {
    let manager = started(FAKE_ENGINE).await;
    manager.change_search_depth(7).unwrap();
    manager.send("go").await.unwrap();
    let lines = read_until(&manager, |l| l.starts_with("bestmove")).await;
    assert!(lines.iter().any(|l| l == "info string go depth 7"));

    wait_until("ready", || manager.is_ready()).await;
    manager.send("go depth 2").await.unwrap();
    let lines = read_until(&manager, |l| l.starts_with("bestmove")).await;
    assert!(lines.iter().any(|l| l == "info string go depth 2"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn events_report_output_and_state_changes() {
    let manager = EngineManager::new(fake_config(FAKE_ENGINE));
    let mut events = manager.subscribe();
    manager.startup().await.unwrap();

    let mut saw_ready_line = false;
    let mut saw_ready_state = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_ready_line && saw_ready_state) {
        assert!(Instant::now() < deadline, "timed out waiting for events");
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(EngineEvent::Output { line, .. })) if line == "readyok" => saw_ready_line = true,
            Ok(Ok(EngineEvent::StateChanged {
                state: EngineState::Ready,
                ..
            })) => saw_ready_state = true,
            _ => {}
        }
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn queue_drops_oldest_lines_beyond_high_water() {
    let mut config = fake_config(FAKE_ENGINE);
    config.queue_high_water = 2;
    let manager = EngineManager::new(config);
    manager.startup().await.unwrap();
    wait_until("ready", || manager.is_ready()).await;

    for n in 0..4 {
        manager.send(&format!("line {}", n)).await.unwrap();
    }
    wait_until("drops", || manager.dropped_lines() >= 4).await;
    wait_until("last echo", || manager.queued_lines() == 2).await;

    let mut kept = Vec::new();
    while let Some(line) = manager.read() {
        kept.push(line);
    }
    assert_eq!(kept, vec!["got line 2".to_string(), "got line 3".to_string()]);

    manager.shutdown().await.unwrap();
}
