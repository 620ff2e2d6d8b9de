//! Delegates crawling to an external worker process.
//!
//! The worker is launched as `<program> [script] <urls...> --config <path>`.
//! It reports progress and the location of its results file on stdout, logs
//! on stderr as `... - LEVEL - ...`, and reads `pause`, `resume` and `stop`
//! commands from stdin, one per line.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};
use trawler_scanner::event::emit;
use trawler_scanner::{
    CrawlEvent, CrawlPolicy, CrawlStatus, EventSender, JobSnapshot, PageResult, RenderMode,
    Result, ScanError, Scheduler, normalize_url,
};

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Progress: (\d+)/(\d+)").unwrap());
static RESULTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Results saved to: (.+)").unwrap());
/// How long a killed worker may take to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Floor for the results-file poll period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

static LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"- (DEBUG|INFO|WARNING|WARN|ERROR|CRITICAL) -").unwrap()
});

/// How the bridge launches and supervises its worker.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: String,
    /// Passed as the first argument when set, e.g. a Python script.
    pub script: Option<PathBuf>,
    /// Where the worker config JSON is written before launch.
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    /// Grace period after `stop` before the worker is terminated.
    pub stop_timeout: Duration,
    /// Grace period after termination before the worker is killed.
    pub terminate_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        crate::config::BridgeSection::default().to_bridge_config()
    }
}

impl BridgeConfig {
    /// Copy with a config file of its own, for running several bridges at once.
    pub fn for_slot(&self, slot: usize) -> Self {
        let mut config = self.clone();
        let stem = self
            .config_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "worker".to_string());
        let name = match self.config_path.extension() {
            Some(ext) => format!("{}-{}.{}", stem, slot, ext.to_string_lossy()),
            None => format!("{}-{}", stem, slot),
        };
        config.config_path = self.config_path.with_file_name(name);
        config
    }
}

/// The JSON document handed to the worker. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_depth: usize,
    pub max_pages: usize,
    pub request_delay: f64,
    pub follow_external_links: bool,
    pub use_dynamic_crawling: bool,
    pub page_load_timeout: u64,
    pub allowed_domains: Vec<String>,
    pub url_filters: Vec<String>,
    pub output_dir: String,
}

impl WorkerConfig {
    pub fn from_policy(policy: &CrawlPolicy, output_dir: &Path) -> Self {
        Self {
            max_depth: policy.max_depth,
            max_pages: policy.max_pages,
            request_delay: policy.request_delay_ms as f64 / 1000.0,
            follow_external_links: policy.follow_external_links,
            use_dynamic_crawling: policy.use_dynamic_crawling,
            page_load_timeout: policy.page_load_timeout_ms / 1000,
            allowed_domains: policy.allowed_domains.clone(),
            url_filters: policy.url_filters.clone(),
            output_dir: output_dir.to_string_lossy().into_owned(),
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ScanError::ParseError(e.to_string()))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// A recognised line of worker stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Progress { crawled: usize, total: usize },
    ResultsSaved(PathBuf),
}

pub fn parse_stdout_line(line: &str) -> Option<WorkerMessage> {
    if let Some(caps) = PROGRESS_RE.captures(line) {
        let crawled = caps[1].parse().ok()?;
        let total = caps[2].parse().ok()?;
        return Some(WorkerMessage::Progress { crawled, total });
    }
    RESULTS_RE
        .captures(line)
        .map(|caps| WorkerMessage::ResultsSaved(PathBuf::from(caps[1].trim())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Severity of a worker stderr line, `None` when it carries no level marker.
pub fn classify_stderr_line(line: &str) -> Option<WorkerLogLevel> {
    let caps = LEVEL_RE.captures(line)?;
    match &caps[1] {
        "DEBUG" => Some(WorkerLogLevel::Debug),
        "INFO" => Some(WorkerLogLevel::Info),
        "WARN" | "WARNING" => Some(WorkerLogLevel::Warn),
        _ => Some(WorkerLogLevel::Error),
    }
}

/// One entry of the worker's results file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRecord {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WorkerRecord {
    pub fn into_page_result(self) -> PageResult {
        let metadata = self.metadata.unwrap_or_default();
        let render_mode = match metadata.get("dynamic_crawled") {
            Some(Value::Bool(true)) => RenderMode::Dynamic,
            _ => RenderMode::Static,
        };
        let fetched_at = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        PageResult {
            url: self.url,
            title: self.title.unwrap_or_default(),
            text_content: self.content.unwrap_or_default(),
            outbound_links: self.links.unwrap_or_default(),
            metadata,
            fetched_at,
            render_mode,
        }
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

enum BridgeCommand {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

struct Control {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    handle: JoinHandle<()>,
}

/// [`Scheduler`] backed by an external worker process.
pub struct ProcessBridge {
    config: BridgeConfig,
    policy: CrawlPolicy,
    events: EventSender,
    state: Arc<watch::Sender<JobSnapshot>>,
    control: Option<Control>,
}

impl ProcessBridge {
    pub fn new(config: BridgeConfig, events: EventSender) -> Self {
        let (state, _) = watch::channel(JobSnapshot::default());
        Self {
            config,
            policy: CrawlPolicy::default(),
            events,
            state: Arc::new(state),
            control: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.state.subscribe()
    }

    fn fail(&self, message: String) {
        error!("{}", message);
        self.state.send_modify(|s| s.status = CrawlStatus::Error);
        emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Error));
        emit(&self.events, CrawlEvent::Error(message));
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> BridgeCommand) {
        let Some(control) = &self.control else {
            warn!("Worker process is not running");
            return;
        };
        let (ack, done) = oneshot::channel();
        if control.commands.send(make(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn spawn_worker(&self, seeds: &[String]) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.program);
        if let Some(script) = &self.config.script {
            command.arg(script);
        }
        command
            .args(seeds)
            .arg("--config")
            .arg(&self.config.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.handle.abort();
        }
    }
}

#[async_trait]
impl Scheduler for ProcessBridge {
    async fn start(&mut self, seeds: &[String], policy: CrawlPolicy) -> Result<()> {
        if self.status().is_active() {
            warn!("Worker process is already running");
            return Err(ScanError::AlreadyRunning);
        }
        if let Some(previous) = self.control.take() {
            previous.handle.abort();
        }

        self.policy = policy;
        let url_policy = match self.policy.compile() {
            Ok(url_policy) => url_policy,
            Err(e) => {
                error!("Invalid crawl policy: {}", e);
                emit(&self.events, CrawlEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let seeds: Vec<String> = seeds
            .iter()
            .filter_map(|seed| normalize_url("", seed, &url_policy))
            .filter(|seed| seen.insert(seed.clone()))
            .collect();
        if seeds.is_empty() {
            error!("No valid URLs to crawl");
            emit(
                &self.events,
                CrawlEvent::Error("No valid URLs to crawl".to_string()),
            );
            return Err(ScanError::NoValidSeeds);
        }

        let worker_config = WorkerConfig::from_policy(&self.policy, &self.config.output_dir);
        let written = async {
            tokio::fs::create_dir_all(&self.config.output_dir).await?;
            worker_config.write(&self.config.config_path).await
        }
        .await;
        if let Err(e) = written {
            let message = format!("Failed to generate config file: {}", e);
            error!("{}", message);
            emit(&self.events, CrawlEvent::Error(message));
            return Err(e);
        }
        debug!("Wrote worker config to {}", self.config.config_path.display());

        let mut child = match self.spawn_worker(&seeds) {
            Ok(child) => child,
            Err(e) => {
                self.fail(format!("Failed to start worker process: {}", e));
                return Err(e.into());
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            self.fail("Worker process started without piped stdio".to_string());
            return Err(ScanError::Other("worker stdio unavailable".to_string()));
        };

        info!(
            "Started worker process {} with {} seed(s)",
            child.id().map(|id| id.to_string()).unwrap_or_default(),
            seeds.len()
        );

        self.state.send_replace(JobSnapshot {
            status: CrawlStatus::Running,
            crawled: 0,
            total: seeds.len(),
        });
        emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Running));

        let supervisor = Supervisor {
            child,
            stdin: Some(stdin),
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            total: seeds.len(),
            results_file: None,
            seen: HashSet::new(),
        };
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(supervisor.run(stdout, stderr, receiver));
        self.control = Some(Control { commands, handle });

        Ok(())
    }

    async fn pause(&mut self) {
        self.request(BridgeCommand::Pause).await;
    }

    async fn resume(&mut self) {
        self.request(BridgeCommand::Resume).await;
    }

    async fn stop(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if control.commands.send(BridgeCommand::Stop(ack)).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = control.handle.await
            && !e.is_cancelled()
        {
            error!("Worker supervisor failed: {}", e);
        }
    }

    async fn set_policy(&mut self, policy: CrawlPolicy) {
        if self.status().is_active() {
            // The worker reads its config once at startup
            let worker_config = WorkerConfig::from_policy(&policy, &self.config.output_dir);
            match worker_config.write(&self.config.config_path).await {
                Ok(()) => info!("Updated worker config; applies from the next launch"),
                Err(e) => warn!("Failed to update worker config: {}", e),
            }
        }
        self.policy = policy;
    }

    fn snapshot(&self) -> JobSnapshot {
        *self.state.borrow()
    }
}

/// Owns the worker process for the lifetime of one job.
struct Supervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    config: BridgeConfig,
    events: EventSender,
    state: Arc<watch::Sender<JobSnapshot>>,
    total: usize,
    results_file: Option<PathBuf>,
    seen: HashSet<String>,
}

impl Supervisor {
    async fn run(
        mut self,
        stdout: ChildStdout,
        stderr: ChildStderr,
        mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        let mut stdout = Some(BufReader::new(stdout).lines());
        let mut stderr = Some(BufReader::new(stderr).lines());
        let mut poll = interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => self.handle_stdout(&line).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => self.handle_stderr(&line),
                    None => stderr = None,
                },
                _ = poll.tick() => self.read_results().await,
                command = commands.recv() => match command {
                    Some(BridgeCommand::Pause(ack)) => {
                        self.transition(CrawlStatus::Running, CrawlStatus::Paused, "pause").await;
                        let _ = ack.send(());
                    }
                    Some(BridgeCommand::Resume(ack)) => {
                        self.transition(CrawlStatus::Paused, CrawlStatus::Running, "resume").await;
                        let _ = ack.send(());
                    }
                    Some(BridgeCommand::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        let _ = self.child.kill().await;
                        return;
                    }
                },
                status = self.child.wait() => {
                    self.drain(&mut stdout, &mut stderr).await;
                    self.read_results().await;
                    if self.status() == CrawlStatus::Paused
                        && matches!(&status, Ok(exit) if exit.success())
                    {
                        self.hold_completion(status, &mut commands).await;
                    } else {
                        self.finish(status);
                    }
                    return;
                }
            }
        }
    }

    fn status(&self) -> CrawlStatus {
        self.state.borrow().status
    }

    /// The worker finished while paused. Completion waits for `resume`.
    async fn hold_completion(
        &mut self,
        status: std::io::Result<ExitStatus>,
        commands: &mut mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        info!("Worker finished while paused, completing on resume");
        while let Some(command) = commands.recv().await {
            match command {
                BridgeCommand::Pause(ack) => {
                    let _ = ack.send(());
                }
                BridgeCommand::Resume(ack) => {
                    self.set_status(CrawlStatus::Running);
                    self.finish(status);
                    let _ = ack.send(());
                    return;
                }
                BridgeCommand::Stop(ack) => {
                    self.set_status(CrawlStatus::Idle);
                    info!("Worker process stopped");
                    let _ = ack.send(());
                    return;
                }
            }
        }
    }

    fn set_status(&self, status: CrawlStatus) {
        self.state.send_modify(|s| s.status = status);
        emit(&self.events, CrawlEvent::StatusChanged(status));
    }

    async fn handle_stdout(&mut self, line: &str) {
        match parse_stdout_line(line) {
            Some(WorkerMessage::Progress { crawled, total }) => {
                self.total = total;
                self.state.send_modify(|s| {
                    s.crawled = crawled;
                    s.total = total;
                });
                emit(&self.events, CrawlEvent::Progress { crawled, total });
            }
            Some(WorkerMessage::ResultsSaved(path)) => {
                info!("Worker results file: {}", path.display());
                self.results_file = Some(path);
                self.read_results().await;
            }
            None => debug!("Worker: {}", line),
        }
    }

    fn handle_stderr(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match classify_stderr_line(line) {
            Some(WorkerLogLevel::Debug) => debug!("Worker: {}", line),
            Some(WorkerLogLevel::Info) => info!("Worker: {}", line),
            Some(WorkerLogLevel::Warn) => warn!("Worker: {}", line),
            Some(WorkerLogLevel::Error) | None => {
                error!("Worker: {}", line);
                emit(&self.events, CrawlEvent::Error(line.to_string()));
            }
        }
    }

    /// Picks up results not yet reported. A file that is missing or not
    /// valid JSON yet is retried on the next poll.
    async fn read_results(&mut self) {
        let Some(path) = &self.results_file else {
            return;
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("Results file not readable yet: {}", e);
                return;
            }
        };
        let records: Vec<WorkerRecord> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!("Invalid JSON in results file {}: {}", path.display(), e);
                return;
            }
        };

        let mut added = 0;
        for record in records {
            if self.seen.insert(record.url.clone()) {
                added += 1;
                emit(
                    &self.events,
                    CrawlEvent::ResultReady(record.into_page_result()),
                );
            }
        }
        if added == 0 {
            return;
        }

        let crawled = self.seen.len();
        let total = self.total.max(crawled);
        self.state.send_modify(|s| {
            s.crawled = crawled;
            s.total = total;
        });
        emit(&self.events, CrawlEvent::Progress { crawled, total });
    }

    async fn write_command(&mut self, command: &str) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            warn!("Worker stdin is closed");
            return false;
        };
        let written = async {
            stdin.write_all(format!("{}\n", command).as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => {
                debug!("Sent '{}' to worker", command);
                true
            }
            Err(e) => {
                error!("Failed to send '{}' to worker: {}", command, e);
                self.stdin = None;
                false
            }
        }
    }

    async fn transition(&mut self, from: CrawlStatus, to: CrawlStatus, command: &str) {
        if self.status() != from {
            return;
        }
        if self.write_command(command).await {
            self.set_status(to);
        }
    }

    /// Asks the worker to stop, escalating to terminate and then kill.
    async fn shutdown(&mut self) {
        self.write_command("stop").await;
        // Closing stdin lets workers blocked on a read notice
        self.stdin = None;

        if timeout(self.config.stop_timeout, self.child.wait())
            .await
            .is_err()
        {
            warn!("Worker did not stop in time, terminating");
            self.terminate().await;
            if timeout(self.config.terminate_timeout, self.child.wait())
                .await
                .is_err()
            {
                error!("Worker did not terminate in time, killing");
                if !self.force_stop().await {
                    return;
                }
            }
        }

        if self.status().is_active() {
            self.set_status(CrawlStatus::Idle);
        }
        info!("Worker process stopped");
    }

    /// Last resort of a stop. A worker that survives it fails the job.
    async fn force_stop(&mut self) -> bool {
        match self.kill().await {
            Ok(()) => true,
            Err(message) => {
                error!("{}", message);
                self.set_status(CrawlStatus::Error);
                emit(&self.events, CrawlEvent::Error(message));
                false
            }
        }
    }

    /// Kills the worker and waits a bounded time for it to be reaped.
    async fn kill(&mut self) -> std::result::Result<(), String> {
        if let Err(e) = self.child.start_kill() {
            return Err(format!("Failed to kill worker process: {}", e));
        }
        match timeout(KILL_TIMEOUT, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("Failed to wait for killed worker process: {}", e)),
            Err(_) => Err(format!(
                "Worker process still running {} ms after kill",
                KILL_TIMEOUT.as_millis()
            )),
        }
    }

    #[cfg(unix)]
    async fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            warn!("Worker pid {} out of range", pid);
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to worker: {}", e);
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Reads whatever the worker wrote before exiting.
    async fn drain(
        &mut self,
        stdout: &mut Option<Lines<BufReader<ChildStdout>>>,
        stderr: &mut Option<Lines<BufReader<ChildStderr>>>,
    ) {
        let mut out_lines = Vec::new();
        let mut err_lines = Vec::new();
        let _ = timeout(Duration::from_secs(1), async {
            while let Some(line) = next_line(stdout).await {
                out_lines.push(line);
            }
            while let Some(line) = next_line(stderr).await {
                err_lines.push(line);
            }
        })
        .await;

        for line in out_lines {
            self.handle_stdout(&line).await;
        }
        for line in err_lines {
            self.handle_stderr(&line);
        }
    }

    fn finish(&mut self, status: std::io::Result<ExitStatus>) {
        match status {
            Ok(status) if status.success() => {
                info!("Worker process completed");
                self.set_status(CrawlStatus::Completed);
                emit(&self.events, CrawlEvent::Completed);
            }
            Ok(status) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none (terminated by signal)".to_string());
                let message = format!("Worker process exited with code {}", code);
                error!("{}", message);
                self.set_status(CrawlStatus::Error);
                emit(&self.events, CrawlEvent::Error(message));
            }
            Err(e) => {
                let message = format!("Failed to wait for worker process: {}", e);
                error!("{}", message);
                self.set_status(CrawlStatus::Error);
                emit(&self.events, CrawlEvent::Error(message));
            }
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines.as_mut()?.next_line().await {
        Ok(line) => line,
        Err(e) => {
            debug!("Worker stream closed: {}", e);
            None
        }
    }
}
