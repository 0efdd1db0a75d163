//! # sluice
//!
//! Request scheduling for a generative model provider: one shared,
//! priority-ordered queue that paces calls below the provider's rate limit,
//! plus an exponential-backoff retrier for the throttling that slips through.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde_json::json;
//! use sluice::{ModelClient, ModelRequest, RequestQueue, TransportError};
//! use sluice::queue::QueueConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One queue for the whole process; every caller gets a clone.
//!     let queue = RequestQueue::in_memory(QueueConfig::from_env());
//!     let client = ModelClient::new(queue, |req: ModelRequest| async move {
//!         // Perform the real provider call here.
//!         Ok::<_, TransportError>(json!({ "operation": req.operation }))
//!     });
//!
//!     let analysis = client.analyze_image(json!({ "image": "…" })).await?;
//!     println!("{analysis}");
//!     Ok(())
//! }
//! ```

// ── Scheduling core ───────────────────────────────────────────────────────────
pub mod queue;
pub mod retry;
pub mod storage;

// ── Caller-facing composition ─────────────────────────────────────────────────
pub mod client;
pub mod error;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{CallProfile, ModelClient, ModelRequest, Operation, Transport};
pub use error::{Error, ProviderCode, QueueError, TransportError};
pub use queue::{QueueConfig, RequestQueue};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use storage::{DispatchStore, FileStore, MemoryStore};
