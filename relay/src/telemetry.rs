//! Tracing context — ambient span/generation propagation.
//!
//! The runtime emits spans through an exchangeable [`TraceBackend`]. The
//! backend installed via [`set_trace_backend`] is process-wide; when none
//! is installed every handle is a no-op, so the core runs unobserved
//! without configuration.
//!
//! Ambient propagation uses a task-local scope: [`with_trace`] establishes
//! a trace root for the duration of a future, and [`contextual_span`] /
//! [`contextual_generation`] nest under the innermost open span (or the
//! trace root). Spans must end in LIFO order within a run; nested runs
//! (an agent used as a tool) nest naturally.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use crate::usage::Usage;

/// Options for creating a trace root.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Trace name.
    pub name: String,
    /// Input recorded on the trace.
    pub input: Option<Value>,
    /// Arbitrary metadata.
    pub metadata: Option<Value>,
    /// Tags for filtering.
    pub tags: Vec<String>,
    /// Session correlation id.
    pub session_id: Option<String>,
    /// User correlation id.
    pub user_id: Option<String>,
}

impl TraceOptions {
    /// Create options with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Options for creating a span.
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    /// Span name.
    pub name: String,
    /// Input recorded on the span.
    pub input: Option<Value>,
    /// Arbitrary metadata.
    pub metadata: Option<Value>,
}

impl SpanOptions {
    /// Create options with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Attach input.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Options for creating a generation (model-call span).
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Generation name.
    pub name: String,
    /// Model identifier.
    pub model: Option<String>,
    /// Input recorded on the generation.
    pub input: Option<Value>,
    /// Arbitrary metadata.
    pub metadata: Option<Value>,
}

/// Severity recorded when a span ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpanLevel {
    /// Normal completion.
    #[default]
    Default,
    /// Completed with a warning.
    Warning,
    /// Completed with an error.
    Error,
}

/// Terminal data recorded when a span ends.
#[derive(Debug, Clone, Default)]
pub struct SpanEnd {
    /// Output recorded on the span.
    pub output: Option<Value>,
    /// Severity of the completion.
    pub level: SpanLevel,
    /// Status message (e.g. the error text).
    pub status_message: Option<String>,
}

impl SpanEnd {
    /// A normal completion with output.
    #[must_use]
    pub fn output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// An error completion with a message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: None,
            level: SpanLevel::Error,
            status_message: Some(message.into()),
        }
    }
}

/// Backend capable of materializing traces.
pub trait TraceBackend: Send + Sync {
    /// Create a new trace root.
    fn create_trace(&self, options: &TraceOptions) -> Arc<dyn TraceHandle>;
}

/// A live trace root.
pub trait TraceHandle: Send + Sync {
    /// Open a span under this trace.
    fn span(&self, options: &SpanOptions) -> Arc<dyn SpanHandle>;

    /// Open a generation directly under this trace.
    fn generation(&self, options: &GenerationOptions) -> Arc<dyn GenerationHandle>;

    /// End the trace with optional output.
    fn end(&self, output: Option<Value>);
}

/// A live span.
pub trait SpanHandle: Send + Sync {
    /// Open a child span.
    fn child(&self, options: &SpanOptions) -> Arc<dyn SpanHandle>;

    /// Open a generation under this span.
    fn generation(&self, options: &GenerationOptions) -> Arc<dyn GenerationHandle>;

    /// End the span.
    fn end(&self, end: SpanEnd);
}

/// A live generation.
pub trait GenerationHandle: Send + Sync {
    /// End the generation with output and token usage.
    fn end(&self, output: Option<Value>, usage: Usage);
}

// ---------------------------------------------------------------------------
// Disabled backend
// ---------------------------------------------------------------------------

/// Backend whose handles do nothing; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

struct NoopTrace;
struct NoopSpan;
struct NoopGeneration;

impl TraceBackend for NoopBackend {
    fn create_trace(&self, _options: &TraceOptions) -> Arc<dyn TraceHandle> {
        Arc::new(NoopTrace)
    }
}

impl TraceHandle for NoopTrace {
    fn span(&self, _options: &SpanOptions) -> Arc<dyn SpanHandle> {
        Arc::new(NoopSpan)
    }

    fn generation(&self, _options: &GenerationOptions) -> Arc<dyn GenerationHandle> {
        Arc::new(NoopGeneration)
    }

    fn end(&self, _output: Option<Value>) {}
}

impl SpanHandle for NoopSpan {
    fn child(&self, _options: &SpanOptions) -> Arc<dyn SpanHandle> {
        Arc::new(NoopSpan)
    }

    fn generation(&self, _options: &GenerationOptions) -> Arc<dyn GenerationHandle> {
        Arc::new(NoopGeneration)
    }

    fn end(&self, _end: SpanEnd) {}
}

impl GenerationHandle for NoopGeneration {
    fn end(&self, _output: Option<Value>, _usage: Usage) {}
}

// ---------------------------------------------------------------------------
// Process-wide backend slot
// ---------------------------------------------------------------------------

static BACKEND: OnceLock<RwLock<Arc<dyn TraceBackend>>> = OnceLock::new();

fn backend_slot() -> &'static RwLock<Arc<dyn TraceBackend>> {
    BACKEND.get_or_init(|| RwLock::new(Arc::new(NoopBackend)))
}

/// Install the process-wide trace backend (write-last-wins).
pub fn set_trace_backend(backend: Arc<dyn TraceBackend>) {
    if let Ok(mut slot) = backend_slot().write() {
        *slot = backend;
    }
}

/// The currently installed trace backend.
#[must_use]
pub fn trace_backend() -> Arc<dyn TraceBackend> {
    backend_slot()
        .read()
        .map_or_else(|_| Arc::new(NoopBackend) as Arc<dyn TraceBackend>, |b| b.clone())
}

// ---------------------------------------------------------------------------
// Ambient scope
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TraceScope {
    trace: Option<Arc<dyn TraceHandle>>,
    spans: Vec<Arc<dyn SpanHandle>>,
}

tokio::task_local! {
    static CURRENT: RefCell<TraceScope>;
}

/// Establish a new trace root for the duration of `fut`.
///
/// The trace is created from the installed backend, made ambient for the
/// future, and ended with the future's completion.
pub async fn with_trace<T, Fut>(options: TraceOptions, fut: Fut) -> T
where
    Fut: std::future::Future<Output = T>,
{
    let trace = trace_backend().create_trace(&options);
    let scope = TraceScope {
        trace: Some(Arc::clone(&trace)),
        spans: Vec::new(),
    };
    let result = CURRENT.scope(RefCell::new(scope), fut).await;
    trace.end(None);
    result
}

/// The ambient trace root, if one is established.
#[must_use]
pub fn current_trace() -> Option<Arc<dyn TraceHandle>> {
    CURRENT
        .try_with(|scope| scope.borrow().trace.clone())
        .ok()
        .flatten()
}

/// The innermost open span, if any.
#[must_use]
pub fn current_span() -> Option<Arc<dyn SpanHandle>> {
    CURRENT
        .try_with(|scope| scope.borrow().spans.last().cloned())
        .ok()
        .flatten()
}

/// Push a span onto the ambient stack, making it current.
pub fn push_span(span: Arc<dyn SpanHandle>) {
    let _ = CURRENT.try_with(|scope| scope.borrow_mut().spans.push(span));
}

/// Pop the innermost span from the ambient stack.
///
/// Spans end in LIFO order; the caller pops before ending.
pub fn pop_span() -> Option<Arc<dyn SpanHandle>> {
    CURRENT
        .try_with(|scope| scope.borrow_mut().spans.pop())
        .ok()
        .flatten()
}

/// Replace the innermost span (pushes when the stack is empty).
pub fn set_current_span(span: Arc<dyn SpanHandle>) {
    let _ = CURRENT.try_with(|scope| {
        let mut scope = scope.borrow_mut();
        scope.spans.pop();
        scope.spans.push(span);
    });
}

/// Run `fut` with `span` as its innermost ambient span.
///
/// The future gets its own scope binding (sharing the ambient trace), so
/// concurrently polled futures — parallel tool executions, race branches
/// — each see their own span without contending over one stack.
pub async fn scoped_under<T, Fut>(span: Arc<dyn SpanHandle>, fut: Fut) -> T
where
    Fut: std::future::Future<Output = T>,
{
    let scope = TraceScope {
        trace: current_trace(),
        spans: vec![span],
    };
    CURRENT.scope(RefCell::new(scope), fut).await
}

/// Run `fut` with its own empty span stack, inheriting the ambient trace.
///
/// Coordination primitives wrap each fan-out branch in this so sibling
/// runs cannot interleave pushes and pops on a shared stack.
pub async fn scoped_fresh<T, Fut>(fut: Fut) -> T
where
    Fut: std::future::Future<Output = T>,
{
    let scope = TraceScope {
        trace: current_trace(),
        spans: Vec::new(),
    };
    CURRENT.scope(RefCell::new(scope), fut).await
}

/// Create a span nested under the current span or the trace root.
///
/// Outside any trace scope a no-op span is returned, so callers need no
/// conditional paths.
#[must_use]
pub fn contextual_span(options: &SpanOptions) -> Arc<dyn SpanHandle> {
    if let Some(span) = current_span() {
        span.child(options)
    } else if let Some(trace) = current_trace() {
        trace.span(options)
    } else {
        Arc::new(NoopSpan)
    }
}

/// Create a generation nested under the current span or the trace root.
#[must_use]
pub fn contextual_generation(options: &GenerationOptions) -> Arc<dyn GenerationHandle> {
    if let Some(span) = current_span() {
        span.generation(options)
    } else if let Some(trace) = current_trace() {
        trace.generation(options)
    } else {
        Arc::new(NoopGeneration)
    }
}
