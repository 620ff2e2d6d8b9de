// Tests for the worker process bridge, driven by small shell-script workers
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use trawler_core::bridge::{BridgeConfig, ProcessBridge, WorkerConfig};
use trawler_scanner::{
    CrawlEvent, CrawlPolicy, CrawlStatus, EventReceiver, PageResult, RenderMode, ScanError,
    Scheduler, event_channel,
};

fn write_worker(dir: &TempDir, body: &str) -> PathBuf {
    let results = dir.path().join("results.json");
    let log = dir.path().join("commands.log");
    let args = dir.path().join("args.txt");
    let body = body
        .replace("@RESULTS@", &results.to_string_lossy())
        .replace("@LOG@", &log.to_string_lossy())
        .replace("@ARGS@", &args.to_string_lossy());

    let script = dir.path().join("worker.sh");
    std::fs::write(&script, body).unwrap();
    script
}

fn bridge_config(dir: &TempDir, body: &str) -> BridgeConfig {
    BridgeConfig {
        program: "sh".to_string(),
        script: Some(write_worker(dir, body)),
        config_path: dir.path().join("worker.json"),
        output_dir: dir.path().join("out"),
        poll_interval: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(1),
        terminate_timeout: Duration::from_secs(1),
    }
}

fn seed() -> Vec<String> {
    vec!["http://a.test".to_string()]
}

/// Collects events up to and including the job's terminal status, plus
/// anything emitted alongside it.
async fn collect_until_terminal(events: &mut EventReceiver) -> Vec<CrawlEvent> {
    let mut seen = tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(
                event,
                CrawlEvent::StatusChanged(
                    CrawlStatus::Completed | CrawlStatus::Error | CrawlStatus::Idle
                )
            );
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("worker did not finish in time");

    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn results(events: &[CrawlEvent]) -> Vec<PageResult> {
    events
        .iter()
        .filter_map(|e| match e {
            CrawlEvent::ResultReady(result) => Some(result.clone()),
            _ => None,
        })
        .collect()
}

fn errors(events: &[CrawlEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            CrawlEvent::Error(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[CrawlEvent]) -> Vec<CrawlStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            CrawlEvent::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect()
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

// ============================================================================
// Successful runs
// ============================================================================

#[tokio::test]
async fn test_worker_results_are_deduped_and_completed() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(
        &dir,
        r#"
echo "$@" > @ARGS@
echo "2024-01-01 10:00:00 - worker - INFO - starting" >&2
cat > @RESULTS@ <<'JSON'
[{"url":"http://a.test/","title":"A","content":"alpha","links":["http://a.test/b"],"timestamp":"2024-05-01T10:00:00"},
 {"url":"http://a.test/b","title":"B","content":"beta","links":[],"metadata":{"dynamic_crawled":true}},
 {"url":"http://a.test/","title":"A again","content":"dup","links":[]}]
JSON
echo "Progress: 2/2"
echo "Results saved to: @RESULTS@"
exit 0
"#,
    );
    let config_path = config.config_path.clone();

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    let policy = CrawlPolicy::default()
        .with_request_delay_ms(250)
        .with_max_depth(3);
    bridge.start(&seed(), policy).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    let results = results(&events);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].url, "http://a.test/");
    assert_eq!(results[0].title, "A");
    assert_eq!(results[1].render_mode, RenderMode::Dynamic);
    assert!(errors(&events).is_empty());
    assert_eq!(
        statuses(&events),
        vec![CrawlStatus::Running, CrawlStatus::Completed]
    );
    assert!(matches!(events.last(), Some(CrawlEvent::Completed)));
    assert!(events.iter().any(|e| matches!(
        e,
        CrawlEvent::Progress {
            crawled: 2,
            total: 2
        }
    )));
    assert_eq!(bridge.status(), CrawlStatus::Completed);

    let worker_config: WorkerConfig = serde_json::from_str(&read(&config_path)).unwrap();
    assert_eq!(worker_config.request_delay, 0.25);
    assert_eq!(worker_config.max_depth, 3);
    assert!(dir.path().join("out").is_dir());

    let args = read(&dir.path().join("args.txt"));
    assert!(args.starts_with("http://a.test/ --config "));
    assert!(args.trim_end().ends_with("worker.json"));
}

#[tokio::test]
async fn test_malformed_results_are_retried() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(
        &dir,
        r#"
echo "not json yet" > @RESULTS@
echo "Results saved to: @RESULTS@"
sleep 0.4
echo '[{"url":"http://a.test/","title":"A"}]' > @RESULTS@
sleep 0.4
exit 0
"#,
    );

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(results(&events).len(), 1);
    assert!(errors(&events).is_empty());
    assert_eq!(bridge.status(), CrawlStatus::Completed);
}

// ============================================================================
// Log routing and exit codes
// ============================================================================

#[tokio::test]
async fn test_stderr_errors_raise_events() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(
        &dir,
        r#"
echo "t - worker - DEBUG - parsing" >&2
echo "t - worker - INFO - fetched page" >&2
echo "t - worker - WARNING - slow response" >&2
echo "Traceback (most recent call last):" >&2
echo "t - worker - CRITICAL - renderer crashed" >&2
exit 0
"#,
    );

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        errors(&events),
        vec![
            "Traceback (most recent call last):".to_string(),
            "t - worker - CRITICAL - renderer crashed".to_string(),
        ]
    );
    assert_eq!(bridge.status(), CrawlStatus::Completed);
}

#[tokio::test]
async fn test_nonzero_exit_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(&dir, "exit 3\n");

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        statuses(&events),
        vec![CrawlStatus::Running, CrawlStatus::Error]
    );
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("exited with code 3"));
    assert!(!events.iter().any(|e| matches!(e, CrawlEvent::Completed)));
    assert_eq!(bridge.status(), CrawlStatus::Error);
}

// ============================================================================
// Control commands
// ============================================================================

#[tokio::test]
async fn test_commands_are_written_to_stdin() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(
        &dir,
        r#"
while read cmd; do
  echo "$cmd" >> @LOG@
  if [ "$cmd" = "stop" ]; then exit 0; fi
done
"#,
    );

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    bridge.pause().await;
    assert_eq!(bridge.status(), CrawlStatus::Paused);
    bridge.resume().await;
    assert_eq!(bridge.status(), CrawlStatus::Running);
    bridge.stop().await;
    assert_eq!(bridge.status(), CrawlStatus::Idle);

    assert_eq!(read(&dir.path().join("commands.log")), "pause\nresume\nstop\n");

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        statuses(&events),
        vec![
            CrawlStatus::Running,
            CrawlStatus::Paused,
            CrawlStatus::Running,
            CrawlStatus::Idle
        ]
    );
    assert!(!events.iter().any(|e| matches!(e, CrawlEvent::Completed)));
}

#[tokio::test]
async fn test_worker_exit_while_paused_completes_on_resume() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(
        &dir,
        r#"
read cmd
echo "$cmd" >> @LOG@
echo '[{"url":"http://a.test/","title":"A"}]' > @RESULTS@
echo "Results saved to: @RESULTS@"
exit 0
"#,
    );

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    bridge.pause().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(read(&dir.path().join("commands.log")), "pause\n");
    assert_eq!(bridge.status(), CrawlStatus::Paused);

    let mut held = Vec::new();
    while let Ok(event) = rx.try_recv() {
        held.push(event);
    }
    assert_eq!(results(&held).len(), 1);
    assert!(!held.iter().any(|e| matches!(e, CrawlEvent::Completed)));

    bridge.resume().await;
    assert_eq!(bridge.status(), CrawlStatus::Completed);

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        statuses(&held).into_iter().chain(statuses(&events)).collect::<Vec<_>>(),
        vec![
            CrawlStatus::Running,
            CrawlStatus::Paused,
            CrawlStatus::Running,
            CrawlStatus::Completed
        ]
    );
    assert!(matches!(events.last(), Some(CrawlEvent::Completed)));
}

#[tokio::test]
async fn test_zero_poll_interval_still_completes() {
    let dir = TempDir::new().unwrap();
    let mut config = bridge_config(
        &dir,
        r#"
echo '[{"url":"http://a.test/"}]' > @RESULTS@
echo "Results saved to: @RESULTS@"
exit 0
"#,
    );
    config.poll_interval = Duration::ZERO;

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(results(&events).len(), 1);
    assert_eq!(bridge.status(), CrawlStatus::Completed);
}

#[tokio::test]
async fn test_stop_kills_unresponsive_worker() {
    let dir = TempDir::new().unwrap();
    let mut config = bridge_config(
        &dir,
        r#"
trap '' TERM
while true; do sleep 0.1; done
"#,
    );
    config.stop_timeout = Duration::from_millis(300);
    config.terminate_timeout = Duration::from_millis(300);

    let (tx, _rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    bridge.stop().await;

    assert_eq!(bridge.status(), CrawlStatus::Idle);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_pause_without_worker_is_noop() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(bridge_config(&dir, "exit 0\n"), tx);

    bridge.pause().await;
    bridge.stop().await;

    assert_eq!(bridge.status(), CrawlStatus::Idle);
    assert!(rx.try_recv().is_err());
}

// ============================================================================
// Start failures
// ============================================================================

#[tokio::test]
async fn test_launch_failure_sets_error() {
    let dir = TempDir::new().unwrap();
    let mut config = bridge_config(&dir, "exit 0\n");
    config.program = dir
        .path()
        .join("no-such-worker")
        .to_string_lossy()
        .into_owned();
    config.script = None;

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    let result = bridge.start(&seed(), CrawlPolicy::default()).await;

    assert!(matches!(result, Err(ScanError::IoError(_))));
    assert_eq!(bridge.status(), CrawlStatus::Error);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(statuses(&events), vec![CrawlStatus::Error]);
    assert!(errors(&events)[0].starts_with("Failed to start worker process"));
}

#[tokio::test]
async fn test_no_valid_seeds_launches_nothing() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(&dir, "echo ran > @LOG@\n");

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    let result = bridge
        .start(&["mailto:someone@a.test".to_string()], CrawlPolicy::default())
        .await;

    assert!(matches!(result, Err(ScanError::NoValidSeeds)));
    assert_eq!(bridge.status(), CrawlStatus::Idle);
    assert!(matches!(rx.try_recv(), Ok(CrawlEvent::Error(_))));
    assert!(!dir.path().join("worker.json").exists());
}

#[tokio::test]
async fn test_unwritable_config_path_aborts_start() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();

    let mut config = bridge_config(&dir, "exit 0\n");
    config.config_path = blocker.join("worker.json");

    let (tx, mut rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    let result = bridge.start(&seed(), CrawlPolicy::default()).await;

    assert!(result.is_err());
    assert_eq!(bridge.status(), CrawlStatus::Idle);
    match rx.try_recv() {
        Ok(CrawlEvent::Error(message)) => {
            assert!(message.starts_with("Failed to generate config file"))
        }
        other => panic!("expected an error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_start_while_running_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = bridge_config(&dir, "while read cmd; do [ \"$cmd\" = stop ] && exit 0; done\n");

    let (tx, _rx) = event_channel();
    let mut bridge = ProcessBridge::new(config, tx);
    bridge.start(&seed(), CrawlPolicy::default()).await.unwrap();

    let again = bridge.start(&seed(), CrawlPolicy::default()).await;
    assert!(matches!(again, Err(ScanError::AlreadyRunning)));

    bridge.stop().await;
    assert_eq!(bridge.status(), CrawlStatus::Idle);
}
