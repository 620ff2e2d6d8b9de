//! Job status and the event stream every scheduler publishes.

use crate::result::PageResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Lifecycle state of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CrawlStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl CrawlStatus {
    /// Running or paused: the job still holds resources.
    pub fn is_active(self) -> bool {
        matches!(self, CrawlStatus::Running | CrawlStatus::Paused)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrawlStatus::Idle => "idle",
            CrawlStatus::Running => "running",
            CrawlStatus::Paused => "paused",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Error => "error",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a job's state and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobSnapshot {
    pub status: CrawlStatus,
    pub crawled: usize,
    pub total: usize,
}

/// Messages emitted by a running scheduler.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    Progress { crawled: usize, total: usize },
    StatusChanged(CrawlStatus),
    ResultReady(PageResult),
    Completed,
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<CrawlEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CrawlEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Sends an event, ignoring a dropped receiver.
pub fn emit(events: &EventSender, event: CrawlEvent) {
    let _ = events.send(event);
}
