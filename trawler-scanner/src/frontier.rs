//! In-process breadth-first crawl scheduler.
//!
//! A [`Frontier`] owns one driver task per job. The driver holds every piece
//! of job state and serially handles control commands, fetch completions and
//! the politeness timer, so nothing inside it needs a lock.

use crate::classifier::ContentClassifier;
use crate::error::{Result, ScanError};
use crate::event::{CrawlEvent, CrawlStatus, EventSender, JobSnapshot, emit};
use crate::extract::parse_static;
use crate::fetch::{HttpFetcher, PageFetcher};
use crate::policy::{CrawlPolicy, UrlPolicy, normalize_url};
use crate::result::PageResult;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

enum Command {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    UpdatePolicy(CrawlPolicy, UrlPolicy),
}

struct Driver {
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

/// Crawls from a set of seeds under a [`CrawlPolicy`].
pub struct Frontier {
    fetcher: Arc<dyn PageFetcher>,
    classifier: Arc<ContentClassifier>,
    events: EventSender,
    policy: CrawlPolicy,
    state: Arc<watch::Sender<JobSnapshot>>,
    driver: Option<Driver>,
}

impl Frontier {
    pub fn new(fetcher: Arc<dyn PageFetcher>, events: EventSender) -> Self {
        let (state, _) = watch::channel(JobSnapshot::default());
        Self {
            fetcher,
            classifier: Arc::new(ContentClassifier::new()),
            events,
            policy: CrawlPolicy::default(),
            state: Arc::new(state),
            driver: None,
        }
    }

    /// Frontier on a plain HTTP fetcher.
    pub fn http(events: EventSender) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpFetcher::new()?), events))
    }

    pub fn with_classifier(mut self, classifier: Arc<ContentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_policy(mut self, policy: CrawlPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &CrawlPolicy {
        &self.policy
    }

    /// Watches the job snapshot.
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.state.subscribe()
    }

    fn send(&self, command: Command) -> bool {
        match &self.driver {
            Some(driver) => driver.commands.send(command).is_ok(),
            None => false,
        }
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.send(make(ack)) {
            // A driver that already finished drops the ack
            let _ = done.await;
        }
    }
}

impl Drop for Frontier {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.handle.abort();
        }
    }
}

#[async_trait]
impl Scheduler for Frontier {
    async fn start(&mut self, seeds: &[String], policy: CrawlPolicy) -> Result<()> {
        if self.status().is_active() {
            warn!("Crawler is already running");
            return Err(ScanError::AlreadyRunning);
        }
        if let Some(previous) = self.driver.take() {
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

        info!(
            "Starting crawl with {} seed(s), max depth {}, max pages {}",
            seeds.len(),
            self.policy.max_depth,
            self.policy.max_pages
        );

        self.state.send_replace(JobSnapshot {
            status: CrawlStatus::Running,
            crawled: 0,
            total: seeds.len(),
        });
        emit(&self.events, CrawlEvent::StatusChanged(CrawlStatus::Running));

        let job = Job::new(
            self.fetcher.clone(),
            self.classifier.clone(),
            self.events.clone(),
            self.state.clone(),
            self.policy.clone(),
            url_policy,
            seeds,
        );
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(job.run(receiver));
        self.driver = Some(Driver { commands, handle });

        Ok(())
    }

    async fn pause(&mut self) {
        self.request(Command::Pause).await;
    }

    async fn resume(&mut self) {
        self.request(Command::Resume).await;
    }

    async fn stop(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if driver.commands.send(Command::Stop(ack)).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = driver.handle.await
            && !e.is_cancelled()
        {
            error!("Crawl driver failed: {}", e);
        }
    }

    async fn set_policy(&mut self, policy: CrawlPolicy) {
        if self.status().is_active() {
            match policy.compile() {
                Ok(url_policy) => {
                    self.send(Command::UpdatePolicy(policy.clone(), url_policy));
                }
                Err(e) => warn!("Ignoring invalid policy for the running job: {}", e),
            }
        }
        self.policy = policy;
    }

    fn snapshot(&self) -> JobSnapshot {
        *self.state.borrow()
    }
}

/// Everything a fetch task needs, detached from the driver.
#[derive(Clone)]
struct FetchContext {
    fetcher: Arc<dyn PageFetcher>,
    classifier: Arc<ContentClassifier>,
    url_policy: Arc<UrlPolicy>,
    use_dynamic: bool,
    page_load_timeout: Duration,
    js_analysis_timeout: Duration,
}

/// Fetches one URL and turns it into a result. `None` for non-HTML content.
async fn crawl_page(ctx: FetchContext, url: &str) -> Result<Option<PageResult>> {
    let page = ctx.fetcher.fetch(url).await?;
    if !page.is_html() {
        debug!(
            "Skipped non-HTML content: {} ({})",
            url,
            page.content_type.as_deref().unwrap_or("unknown")
        );
        return Ok(None);
    }

    if ctx.use_dynamic
        && ctx
            .classifier
            .needs_dynamic_crawling_within(url, &page.body, ctx.js_analysis_timeout)
            .await
    {
        info!("Using dynamic crawling for {}", url);
        match ctx
            .classifier
            .parse_dynamic(url, ctx.page_load_timeout, &ctx.url_policy)
            .await
        {
            Ok(result) => return Ok(Some(result)),
            Err(e) => warn!("Dynamic render of {} failed, using static HTML: {}", url, e),
        }
    }

    Ok(Some(parse_static(url, &page.body, &ctx.url_policy)))
}

type FetchOutcome = (String, Result<Option<PageResult>>);

struct Job {
    fetcher: Arc<dyn PageFetcher>,
    classifier: Arc<ContentClassifier>,
    events: EventSender,
    state: Arc<watch::Sender<JobSnapshot>>,
    policy: CrawlPolicy,
    url_policy: Arc<UrlPolicy>,
    status: CrawlStatus,

    queue: VecDeque<String>,
    queued: HashSet<String>,
    pending: HashSet<String>,
    crawled: HashSet<String>,
    depths: HashMap<String, usize>,
    crawled_count: usize,

    in_flight: JoinSet<FetchOutcome>,
    next_dispatch: Option<Instant>,
    last_dispatch: Option<Instant>,
}

impl Job {
    fn new(
        fetcher: Arc<dyn PageFetcher>,
        classifier: Arc<ContentClassifier>,
        events: EventSender,
        state: Arc<watch::Sender<JobSnapshot>>,
        policy: CrawlPolicy,
        url_policy: UrlPolicy,
        seeds: Vec<String>,
    ) -> Self {
        let depths = seeds.iter().map(|seed| (seed.clone(), 0)).collect();
        Self {
            fetcher,
            classifier,
            events,
            state,
            policy,
            url_policy: Arc::new(url_policy),
            status: CrawlStatus::Running,
            queued: seeds.iter().cloned().collect(),
            queue: seeds.into(),
            pending: HashSet::new(),
            crawled: HashSet::new(),
            depths,
            crawled_count: 0,
            in_flight: JoinSet::new(),
            next_dispatch: Some(Instant::now()),
            last_dispatch: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while self.status.is_active() {
            let timer_armed = self.next_dispatch.is_some();
            let deadline = self.next_dispatch.unwrap_or_else(Instant::now);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Frontier dropped, abandoning crawl");
                        self.in_flight.abort_all();
                        break;
                    }
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.handle_completion(joined);
                }
                _ = sleep_until(deadline), if timer_armed => {
                    self.next_dispatch = None;
                    self.dispatch_ready();
                }
            }
        }
        debug!("Crawl driver finished with status {}", self.status);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause(ack) => {
                if self.status == CrawlStatus::Running {
                    self.next_dispatch = None;
                    self.set_status(CrawlStatus::Paused);
                    info!("Crawler paused with {} fetch(es) in flight", self.pending.len());
                }
                let _ = ack.send(());
            }
            Command::Resume(ack) => {
                if self.status == CrawlStatus::Paused {
                    self.set_status(CrawlStatus::Running);
                    self.schedule_next();
                    info!("Crawler resumed");
                }
                let _ = ack.send(());
            }
            Command::Stop(ack) => {
                self.in_flight.abort_all();
                self.clear();
                self.set_status(CrawlStatus::Idle);
                info!("Crawler stopped");
                let _ = ack.send(());
            }
            Command::UpdatePolicy(policy, url_policy) => {
                debug!("Applying new policy to the running job");
                self.policy = policy;
                self.url_policy = Arc::new(url_policy);
            }
        }
    }

    fn dispatch_ready(&mut self) {
        while self.status == CrawlStatus::Running {
            if self.page_cap_reached() {
                info!(
                    "Crawler completed, reached maximum pages limit: {}",
                    self.policy.max_pages
                );
                self.complete();
                return;
            }
            // Hold back while the in-flight fetches could still fill the cap
            if self.policy.max_pages > 0
                && self.crawled_count + self.pending.len() >= self.policy.max_pages
            {
                return;
            }

            let Some(url) = self.queue.pop_front() else {
                if self.pending.is_empty() {
                    self.complete();
                }
                return;
            };
            self.queued.remove(&url);

            if !self.should_crawl(&url) {
                debug!("Skipping {}", url);
                continue;
            }

            self.pending.insert(url.clone());
            self.spawn_fetch(url);

            let now = Instant::now();
            self.last_dispatch = Some(now);
            self.next_dispatch = Some(now + self.policy.request_delay());
            return;
        }
    }

    fn spawn_fetch(&mut self, url: String) {
        debug!("Dispatching {}", url);
        let ctx = FetchContext {
            fetcher: self.fetcher.clone(),
            classifier: self.classifier.clone(),
            url_policy: self.url_policy.clone(),
            use_dynamic: self.policy.use_dynamic_crawling,
            page_load_timeout: self.policy.page_load_timeout(),
            js_analysis_timeout: self.policy.js_analysis_timeout(),
        };

        self.in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(crawl_page(ctx, &url))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ScanError::Other("crawl task panicked".to_string())));
            (url, outcome)
        });
    }

    fn handle_completion(&mut self, joined: std::result::Result<FetchOutcome, JoinError>) {
        let (url, outcome) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_cancelled() {
                    error!("Fetch task failed: {}", e);
                }
                return;
            }
        };

        self.pending.remove(&url);
        self.crawled.insert(url.clone());

        match outcome {
            Ok(Some(result)) => self.process_result(result),
            Ok(None) => {
                self.publish();
            }
            Err(e) => {
                warn!("Error crawling {}: {}", url, e);
                emit(
                    &self.events,
                    CrawlEvent::Error(format!("Error crawling {}: {}", url, e)),
                );
                self.publish();
            }
        }

        if self.status != CrawlStatus::Running {
            return;
        }
        if self.page_cap_reached() {
            info!(
                "Crawler completed, reached maximum pages limit: {}",
                self.policy.max_pages
            );
            self.complete();
        } else if self.queue.is_empty() && self.pending.is_empty() {
            self.complete();
        } else if self.next_dispatch.is_none() {
            self.schedule_next();
        }
    }

    fn process_result(&mut self, result: PageResult) {
        self.crawled_count += 1;

        let child_depth = self.depths.get(&result.url).copied().unwrap_or(0) + 1;
        for link in &result.outbound_links {
            // First discovery fixes the depth
            self.depths.entry(link.clone()).or_insert(child_depth);
            if !self.queued.contains(link) && self.should_crawl(link) {
                self.queue.push_back(link.clone());
                self.queued.insert(link.clone());
            }
        }

        debug!(
            "Crawled {} ({} links, {} queued)",
            result.url,
            result.outbound_links.len(),
            self.queue.len()
        );
        emit(&self.events, CrawlEvent::ResultReady(result));

        let snapshot = self.publish();
        emit(
            &self.events,
            CrawlEvent::Progress {
                crawled: snapshot.crawled,
                total: snapshot.total,
            },
        );
    }

    fn should_crawl(&self, url: &str) -> bool {
        if self.crawled.contains(url) || self.pending.contains(url) {
            return false;
        }
        if self.page_cap_reached() {
            return false;
        }
        let depth = self.depths.get(url).copied().unwrap_or(0);
        self.policy.max_depth == 0 || depth <= self.policy.max_depth
    }

    fn page_cap_reached(&self) -> bool {
        self.policy.max_pages > 0 && self.crawled_count >= self.policy.max_pages
    }

    fn schedule_next(&mut self) {
        let now = Instant::now();
        let at = match self.last_dispatch {
            Some(last) => (last + self.policy.request_delay()).max(now),
            None => now,
        };
        self.next_dispatch = Some(at);
    }

    fn complete(&mut self) {
        self.in_flight.abort_all();
        self.clear();
        info!("Crawler completed, crawled {} pages", self.crawled_count);
        self.set_status(CrawlStatus::Completed);
        emit(&self.events, CrawlEvent::Completed);
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.queued.clear();
        self.pending.clear();
        self.next_dispatch = None;
    }

    fn set_status(&mut self, status: CrawlStatus) {
        self.status = status;
        self.publish();
        emit(&self.events, CrawlEvent::StatusChanged(status));
    }

    fn publish(&self) -> JobSnapshot {
        let snapshot = JobSnapshot {
            status: self.status,
            crawled: self.crawled_count,
            total: self.crawled_count + self.queue.len() + self.pending.len(),
        };
        self.state.send_replace(snapshot);
        snapshot
    }
}
