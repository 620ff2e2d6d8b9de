use crate::error::Result;
use crate::event::{CrawlStatus, JobSnapshot};
use crate::policy::CrawlPolicy;
use async_trait::async_trait;

/// Control surface shared by every crawl backend.
///
/// Implementations report progress, results and status changes on the event
/// channel they were constructed with. Each job ends with exactly one terminal
/// status: `Completed`, `Idle` after [`Scheduler::stop`], or `Error`.
#[async_trait]
pub trait Scheduler: Send {
    /// Starts a job. Fails without side effects beyond an error event when a
    /// job is already active or the seeds or policy are unusable.
    async fn start(&mut self, seeds: &[String], policy: CrawlPolicy) -> Result<()>;

    /// Halts new dispatch. Work already in flight still completes.
    async fn pause(&mut self);

    async fn resume(&mut self);

    /// Cancels the job and discards everything not yet reported.
    async fn stop(&mut self);

    /// Replaces the policy for the next start and for the live job, if any.
    async fn set_policy(&mut self, policy: CrawlPolicy);

    fn snapshot(&self) -> JobSnapshot;

    fn status(&self) -> CrawlStatus {
        self.snapshot().status
    }
}
