pub mod analyzer;
pub mod classifier;
pub mod error;
pub mod event;
pub mod extract;
pub mod fetch;
pub mod frontier;
pub mod policy;
pub mod result;
pub mod sandbox;
pub mod scheduler;

pub use analyzer::{DynamicThresholds, JsExecutionAnalyzer, JsExecutionSample};
pub use classifier::{Assessment, ContentClassifier, Signal, Verdict, assess};
pub use error::{Result, ScanError};
pub use event::{CrawlEvent, CrawlStatus, EventReceiver, EventSender, JobSnapshot, event_channel};
pub use extract::parse_static;
pub use fetch::{FetchedPage, HttpFetcher, PageFetcher};
pub use frontier::Frontier;
pub use policy::{CrawlPolicy, UrlPolicy, normalize_url};
pub use result::{PageResult, RenderMode};
pub use sandbox::{RenderSandbox, RenderedPage};
pub use scheduler::Scheduler;

#[cfg(feature = "browser")]
pub use sandbox::ChromiumSandbox;
