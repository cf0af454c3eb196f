//! # Rewrite Queue
//!
//! Bounded-concurrency queue that sends units of text (paragraphs,
//! selections) to a remote LLM for rewriting and streams the results back
//! incrementally.
//!
//! ## Features
//!
//! - Priority-based dispatch (High, Normal, Low) with FIFO ordering inside a tier
//! - Hard ceiling on concurrent streams, held through retry backoff
//! - Streaming over SSE from any OpenAI-compatible `/chat/completions` endpoint
//! - Automatic retry with exponential backoff, jitter and `Retry-After` support
//! - Immediate cancellation: a cancelled job is never written to again
//! - Progress estimation (percentage, throughput, ETA) while streaming
//! - State changes broadcast as [`QueueEvent`]s
//!
//! ## Quick Start
//!
//! 1. Build a [`QueueConfig`] and a [`CompletionConfig`]
//! 2. Create a [`QueueManager`] and [`subscribe()`](QueueManager::subscribe) to events
//! 3. Call [`start()`](QueueManager::start) and submit text with [`QueueManager::submit()`]
//!
//! ```no_run
//! use rewrite_queue::{CompletionConfig, Priority, QueueConfig, QueueEvent, QueueManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = QueueManager::new(
//!         QueueConfig::builder().with_max_concurrent(2).build(),
//!         CompletionConfig::from_env().with_system_prompt("Rewrite in plain English."),
//!     );
//!     let mut events = manager.subscribe();
//!     manager.start();
//!
//!     manager.submit("intro", "Heretofore the aforementioned party...", Priority::High);
//!
//!     while let Ok(event) = events.recv().await {
//!         if let QueueEvent::Completed { result_text, .. } = event {
//!             println!("{}", result_text);
//!             break;
//!         }
//!     }
//! }
//! ```
//!
//! Custom transports implement [`CompletionBackend`] and are plugged in with
//! [`QueueManager::with_backend()`].

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod progress;
pub mod prompt;
pub mod queue;
pub mod retry;

mod stream;

pub use client::{CompletionBackend, CompletionConfig, CompletionRequest, Frame, FrameStream, HttpBackend};
pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::{ErrorKind, JobError, Result, RewriteError};
pub use events::QueueEvent;
pub use job::{Job, JobStatus, Priority};
pub use progress::{ProgressEstimator, StreamProgress};
pub use queue::{QueueManager, QueueStats};
pub use retry::{calculate_retry_delay, should_retry, RetryPolicy};
