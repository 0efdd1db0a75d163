//! Model client: the caller-facing composition of queue, retry, and transport.
//!
//! Each operation wraps one transport call in a [`RetryPolicy`] and submits the
//! wrapped call to the shared [`RequestQueue`] at the operation's priority:
//!
//! | Operation                | Priority | Retries | Initial delay |
//! |--------------------------|----------|---------|---------------|
//! | `AnalyzeImage`           | 10       | 3       | 5 s           |
//! | `GenerateFragments`      | 8        | 3       | 4 s           |
//! | `AnalyzeWord`            | 1        | 2       | 2 s           |
//!
//! Image analysis and fragment generation are primary, user-initiated actions
//! and surface every failure. Word analysis runs in the background and falls
//! back to a caller-supplied placeholder instead of failing.
//!
//! Building prompts, response schemas, and image payloads is the caller's job;
//! the client only moves an opaque [`ModelRequest`] body to the transport.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, TransportError};
use crate::queue::RequestQueue;
use crate::retry::RetryPolicy;

/// Boxed future returned by a [`Transport`] call.
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<Value, TransportError>> + Send>>;

/// The operation a request performs against the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Describe a user photo as the basis of a receipt.
    AnalyzeImage,
    /// Look up a single word for its dictionary-style breakdown.
    AnalyzeWord,
    /// Generate collage fragments from an analyzed image.
    GenerateFragments,
}

impl Operation {
    /// Returns the operation name as used in logs and serialized requests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnalyzeImage => "analyze_image",
            Self::AnalyzeWord => "analyze_word",
            Self::GenerateFragments => "generate_fragments",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request for the model transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub operation: Operation,
    /// Prompt, schema, and inline media, already assembled by the caller.
    pub body: Value,
}

impl ModelRequest {
    pub fn new(operation: Operation, body: Value) -> Self {
        Self { operation, body }
    }
}

/// The external model transport.
///
/// Implementors perform the actual network call. Any failure should be
/// reported as a [`TransportError`]; [`TransportError::from_value`] helps when
/// the provider returns a JSON error body.
///
/// Closures of the shape `Fn(ModelRequest) -> impl Future<Output =
/// Result<Value, TransportError>>` implement this trait automatically.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` to the model and returns its response payload.
    fn call(&self, request: ModelRequest) -> TransportFuture;
}

impl<T, F> Transport for T
where
    T: Fn(ModelRequest) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Value, TransportError>> + Send + 'static,
{
    fn call(&self, request: ModelRequest) -> TransportFuture {
        Box::pin((self)(request))
    }
}

/// Scheduling parameters for one kind of call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallProfile {
    /// Queue priority; higher is served sooner.
    pub priority: i32,
    pub retry: RetryPolicy,
}

impl CallProfile {
    pub fn new(priority: i32, retry: RetryPolicy) -> Self {
        Self { priority, retry }
    }

    /// Built-in profile for `operation`.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::AnalyzeImage => Self::new(10, RetryPolicy::new(3, Duration::from_secs(5))),
            Operation::GenerateFragments => {
                Self::new(8, RetryPolicy::new(3, Duration::from_secs(4)))
            }
            Operation::AnalyzeWord => Self::new(1, RetryPolicy::new(2, Duration::from_secs(2))),
        }
    }
}

/// Client that routes every model call through the shared queue.
///
/// Cheap to clone; clones share the queue and the transport.
pub struct ModelClient<T> {
    queue: RequestQueue,
    transport: Arc<T>,
    profiles: HashMap<Operation, CallProfile>,
}

impl<T> Clone for ModelClient<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            transport: Arc::clone(&self.transport),
            profiles: self.profiles.clone(),
        }
    }
}

impl<T: Transport> ModelClient<T> {
    /// Creates a client that submits to `queue` and calls `transport`.
    pub fn new(queue: RequestQueue, transport: T) -> Self {
        Self {
            queue,
            transport: Arc::new(transport),
            profiles: HashMap::new(),
        }
    }

    /// Overrides the built-in profile for `operation`.
    #[must_use]
    pub fn with_profile(mut self, operation: Operation, profile: CallProfile) -> Self {
        self.profiles.insert(operation, profile);
        self
    }

    /// Returns the profile in effect for `operation`.
    pub fn profile(&self, operation: Operation) -> CallProfile {
        self.profiles
            .get(&operation)
            .copied()
            .unwrap_or_else(|| CallProfile::for_operation(operation))
    }

    /// Returns the shared queue this client submits to.
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Analyzes a user photo. Failures are returned to the caller.
    ///
    /// Like every operation here, the request joins the queue when this is
    /// called, not when the returned future is first polled.
    ///
    /// # Errors
    ///
    /// [`Error::RetryExhausted`] if the provider stays throttled, or
    /// [`Error::Transport`] for any other transport failure.
    pub fn analyze_image(
        &self,
        body: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send + use<T> {
        self.submit(ModelRequest::new(Operation::AnalyzeImage, body))
    }

    /// Generates collage fragments. Failures are returned to the caller.
    ///
    /// # Errors
    ///
    /// Same as [`analyze_image`](Self::analyze_image).
    pub fn generate_fragments(
        &self,
        body: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send + use<T> {
        self.submit(ModelRequest::new(Operation::GenerateFragments, body))
    }

    /// Looks up a word in the background, substituting `fallback` on any
    /// failure so one feature's outage never blocks the rest.
    pub fn analyze_word(
        &self,
        body: Value,
        fallback: Value,
    ) -> impl Future<Output = Value> + Send + use<T> {
        let pending = self.submit(ModelRequest::new(Operation::AnalyzeWord, body));
        async move {
            match pending.await {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "word analysis failed; using fallback");
                    fallback
                }
            }
        }
    }

    /// Queues `request` under its operation's profile.
    ///
    /// # Errors
    ///
    /// Whatever the retried transport call produced, unchanged.
    pub fn submit(
        &self,
        request: ModelRequest,
    ) -> impl Future<Output = Result<Value, Error>> + Send + use<T> {
        let operation = request.operation;
        let profile = self.profile(operation);
        let transport = Arc::clone(&self.transport);
        debug!(%operation, priority = profile.priority, "submitting model request");

        self.queue.add(
            move || async move {
                profile
                    .retry
                    .run(|| transport.call(request.clone()))
                    .await
            },
            profile.priority,
        )
    }
}
