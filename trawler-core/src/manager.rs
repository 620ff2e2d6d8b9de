//! Bounded fan-out over single-seed crawl tasks.
//!
//! Each seed runs in its own [`Scheduler`] built by a [`SchedulerFactory`].
//! At most `workers` tasks are live at once; when one finishes, the next
//! queued seed is taken in the same critical section that records the
//! finish.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use trawler_scanner::event::emit;
use trawler_scanner::{
    CrawlEvent, CrawlPolicy, CrawlStatus, EventReceiver, EventSender, JobSnapshot, PageResult,
    Result, ScanError, Scheduler, event_channel, normalize_url,
};

/// Builds the scheduler for one task. The first argument is the slot the
/// task runs in, `0..workers`.
pub type SchedulerFactory = Arc<dyn Fn(usize, EventSender) -> Box<dyn Scheduler> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<String>,
    results: Vec<PageResult>,
    finished: usize,
    total: usize,
    status: CrawlStatus,
    policy: CrawlPolicy,
}

/// Everything a slot task needs, cloned into each one.
#[derive(Clone)]
struct SlotContext {
    factory: SchedulerFactory,
    shared: Arc<Mutex<Shared>>,
    state: Arc<watch::Sender<JobSnapshot>>,
    events: EventSender,
}

enum Outcome {
    Finished,
    Stopped,
}

/// Runs many seeds concurrently, each as an independent crawl.
pub struct CrawlManager {
    factory: SchedulerFactory,
    workers: usize,
    policy: CrawlPolicy,
    events: EventSender,
    shared: Arc<Mutex<Shared>>,
    state: Arc<watch::Sender<JobSnapshot>>,
    control: watch::Sender<Control>,
    slots: JoinSet<()>,
}

impl CrawlManager {
    pub fn new(factory: SchedulerFactory, workers: usize, events: EventSender) -> Self {
        let (state, _) = watch::channel(JobSnapshot::default());
        let (control, _) = watch::channel(Control::Run);
        Self {
            factory,
            workers: workers.max(1),
            policy: CrawlPolicy::default(),
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            state: Arc::new(state),
            control,
            slots: JoinSet::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.state.subscribe()
    }

    /// Every result gathered so far, in arrival order.
    pub async fn results(&self) -> Vec<PageResult> {
        self.shared.lock().await.results.clone()
    }

    /// At most `limit` results; `0` means all of them.
    pub async fn results_limited(&self, limit: usize) -> Vec<PageResult> {
        let shared = self.shared.lock().await;
        let take = if limit == 0 {
            shared.results.len()
        } else {
            limit.min(shared.results.len())
        };
        shared.results[..take].to_vec()
    }

    fn publish(&self, shared: &Shared) {
        publish(&self.state, shared);
    }
}

impl Drop for CrawlManager {
    fn drop(&mut self) {
        self.slots.abort_all();
    }
}

#[async_trait]
impl Scheduler for CrawlManager {
    async fn start(&mut self, seeds: &[String], policy: CrawlPolicy) -> Result<()> {
        if self.status().is_active() {
            warn!("Crawl manager is already running");
            return Err(ScanError::AlreadyRunning);
        }
        self.slots.abort_all();
        while self.slots.join_next().await.is_some() {}

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
        let seeds: VecDeque<String> = seeds
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

        info!(
            "Starting {} seed(s) across {} worker(s)",
            seeds.len(),
            self.workers.min(seeds.len())
        );

        self.control.send_replace(Control::Run);
        let first: Vec<String> = {
            let mut shared = self.shared.lock().await;
            *shared = Shared {
                total: seeds.len(),
                queue: seeds,
                status: CrawlStatus::Running,
                policy: self.policy.clone(),
                ..Default::default()
            };
            self.publish(&shared);
            emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Running));

            let n = self.workers.min(shared.queue.len());
            shared.queue.drain(..n).collect()
        };

        let ctx = SlotContext {
            factory: self.factory.clone(),
            shared: self.shared.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        };
        for (slot, seed) in first.into_iter().enumerate() {
            let control = self.control.subscribe();
            self.slots.spawn(run_slot(slot, seed, ctx.clone(), control));
        }

        Ok(())
    }

    async fn pause(&mut self) {
        let mut shared = self.shared.lock().await;
        if shared.status != CrawlStatus::Running {
            return;
        }
        shared.status = CrawlStatus::Paused;
        self.publish(&shared);
        emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Paused));
        self.control.send_replace(Control::Pause);
        info!("Crawl paused");
    }

    async fn resume(&mut self) {
        let mut shared = self.shared.lock().await;
        if shared.status != CrawlStatus::Paused {
            return;
        }
        shared.status = CrawlStatus::Running;
        self.publish(&shared);
        emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Running));
        self.control.send_replace(Control::Run);
        info!("Crawl resumed");

        // Every seed finished while paused
        if shared.finished >= shared.total {
            complete(&self.state, &self.events, &mut shared);
        }
    }

    async fn stop(&mut self) {
        {
            let mut shared = self.shared.lock().await;
            shared.queue.clear();
            if shared.status.is_active() {
                shared.status = CrawlStatus::Idle;
                self.publish(&shared);
                emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Idle));
                info!("Crawl stopped");
            }
        }
        self.control.send_replace(Control::Stop);
        while let Some(joined) = self.slots.join_next().await {
            if let Err(e) = joined
                && !e.is_cancelled()
            {
                error!("Crawl task failed: {}", e);
            }
        }
    }

    async fn set_policy(&mut self, policy: CrawlPolicy) {
        // Seeds not yet dispatched pick up the new policy
        self.shared.lock().await.policy = policy.clone();
        self.policy = policy;
    }

    fn snapshot(&self) -> JobSnapshot {
        *self.state.borrow()
    }
}

fn publish(state: &watch::Sender<JobSnapshot>, shared: &Shared) {
    state.send_replace(JobSnapshot {
        status: shared.status,
        crawled: shared.finished,
        total: shared.total,
    });
}

fn complete(state: &watch::Sender<JobSnapshot>, events: &EventSender, shared: &mut Shared) {
    shared.status = CrawlStatus::Completed;
    publish(state, shared);
    info!(
        "Crawl completed: {} seed(s), {} page(s)",
        shared.total,
        shared.results.len()
    );
    emit(events, CrawlEvent::StatusChanged(CrawlStatus::Completed));
    emit(events, CrawlEvent::Completed);
}

async fn run_slot(
    slot: usize,
    first: String,
    ctx: SlotContext,
    mut control: watch::Receiver<Control>,
) {
    let mut next = Some(first);
    while let Some(seed) = next {
        if !wait_until_running(&mut control).await {
            return;
        }
        match run_seed(slot, &seed, &ctx, &mut control).await {
            Outcome::Stopped => return,
            Outcome::Finished => next = ctx.finish_and_take_next(&seed).await,
        }
    }
    debug!("Slot {} idle", slot);
}

/// Waits out a pause. `false` once the job is stopped.
async fn wait_until_running(control: &mut watch::Receiver<Control>) -> bool {
    loop {
        let current = *control.borrow_and_update();
        match current {
            Control::Run => return true,
            Control::Stop => return false,
            Control::Pause => {
                if control.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_seed(
    slot: usize,
    seed: &str,
    ctx: &SlotContext,
    control: &mut watch::Receiver<Control>,
) -> Outcome {
    let policy = ctx.shared.lock().await.policy.clone();
    let (tx, mut rx) = event_channel();
    let mut scheduler = (ctx.factory)(slot, tx);

    debug!("Slot {} crawling {}", slot, seed);
    if let Err(e) = scheduler.start(&[seed.to_string()], policy).await {
        warn!("Failed to start crawl of {}: {}", seed, e);
        ctx.forward_pending(&mut rx).await;
        return Outcome::Finished;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(CrawlEvent::StatusChanged(status))
                    if matches!(status, CrawlStatus::Completed | CrawlStatus::Error) =>
                {
                    ctx.forward_pending(&mut rx).await;
                    return Outcome::Finished;
                }
                Some(event) => ctx.forward(event).await,
                None => return Outcome::Finished,
            },
            changed = control.changed() => {
                let current = if changed.is_ok() {
                    *control.borrow_and_update()
                } else {
                    Control::Stop
                };
                match current {
                    Control::Pause => scheduler.pause().await,
                    Control::Run => scheduler.resume().await,
                    Control::Stop => {
                        scheduler.stop().await;
                        return Outcome::Stopped;
                    }
                }
            }
        }
    }
}

impl SlotContext {
    async fn forward(&self, event: CrawlEvent) {
        match event {
            CrawlEvent::ResultReady(result) => {
                let mut shared = self.shared.lock().await;
                if !shared.status.is_active() {
                    return;
                }
                shared.results.push(result.clone());
                emit(&self.events, CrawlEvent::ResultReady(result));
            }
            CrawlEvent::Error(message) => emit(&self.events, CrawlEvent::Error(message)),
            // Per-task progress and status stay internal
            _ => {}
        }
    }

    /// Forwards whatever the task emitted alongside its terminal status.
    async fn forward_pending(&self, rx: &mut EventReceiver) {
        while let Ok(event) = rx.try_recv() {
            self.forward(event).await;
        }
    }

    /// Records a finished seed and hands out the next one.
    async fn finish_and_take_next(&self, seed: &str) -> Option<String> {
        let mut shared = self.shared.lock().await;
        if !shared.status.is_active() {
            return None;
        }

        shared.finished += 1;
        debug!("Finished seed {} ({}/{})", seed, shared.finished, shared.total);
        publish(&self.state, &shared);
        emit(
            &self.events,
            CrawlEvent::Progress {
                crawled: shared.finished,
                total: shared.total,
            },
        );

        if shared.finished >= shared.total {
            if shared.status == CrawlStatus::Running {
                complete(&self.state, &self.events, &mut shared);
            } else {
                info!("All seeds finished while paused, completing on resume");
            }
            return None;
        }

        shared.queue.pop_front()
    }
}
