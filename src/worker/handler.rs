//! Polymorphic invocation of user handlers.
//!
//! A handler takes one of four shapes, fixed when the worker is
//! constructed: a blocking function, an async function, a finite iterator
//! of partials, or a finite async stream of partials. Blocking shapes run
//! on the same scheduler as the rest of the worker and will pause it; that
//! is the documented contract, and why async handlers are preferred.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::error::Error as _;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, FutureExt, Stream, StreamExt};
use serde_json::Value;

use crate::config::Endpoints;
use crate::job::{ErrorEnvelope, Job, JobResult, StreamFragment};
use crate::transport::Transport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a single handler invocation (or stream item) produces.
pub type HandlerOutput = std::result::Result<Value, BoxError>;

type SyncFn = dyn Fn(Job) -> HandlerOutput + Send + Sync;
type AsyncFn = dyn Fn(Job) -> BoxFuture<'static, HandlerOutput> + Send + Sync;
type StreamFn = dyn Fn(Job) -> Box<dyn Iterator<Item = HandlerOutput> + Send> + Send + Sync;
type AsyncStreamFn = dyn Fn(Job) -> BoxStream<'static, HandlerOutput> + Send + Sync;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = RefCell::new(None);
}

static PANIC_CAPTURE: Once = Once::new();

/// Record the backtrace from inside the panic hook, while the failing
/// handler's frames are still on the stack. `catch_unwind` only hands back
/// the payload after unwinding, at which point the call chain is gone; the
/// hook runs on the panicking thread, so the thread-local pairs each
/// capture with the `catch_unwind` that recovers it.
fn install_panic_capture() {
    PANIC_CAPTURE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
    Stream(Arc<StreamFn>),
    AsyncStream(Arc<AsyncStreamFn>),
}

impl Handler {
    /// Blocking function returning a single output.
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(Job) -> HandlerOutput + Send + Sync + 'static,
    {
        install_panic_capture();
        Handler::Sync(Arc::new(handler))
    }

    /// Async function returning a single output.
    pub fn async_fn<F, Fut>(handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutput> + Send + 'static,
    {
        install_panic_capture();
        Handler::Async(Arc::new(move |job| handler(job).boxed()))
    }

    /// Finite sequence of partial outputs, streamed to the control plane.
    pub fn stream<F, I>(handler: F) -> Self
    where
        F: Fn(Job) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = HandlerOutput>,
        I::IntoIter: Send + 'static,
    {
        install_panic_capture();
        Handler::Stream(Arc::new(move |job| Box::new(handler(job).into_iter())))
    }

    /// Finite async stream of partial outputs.
    pub fn async_stream<F, S>(handler: F) -> Self
    where
        F: Fn(Job) -> S + Send + Sync + 'static,
        S: Stream<Item = HandlerOutput> + Send + 'static,
    {
        install_panic_capture();
        Handler::AsyncStream(Arc::new(move |job| handler(job).boxed()))
    }

    /// Whether partials from this handler go to the stream endpoint.
    pub fn is_stream(&self) -> bool {
        matches!(self, Handler::Stream(_) | Handler::AsyncStream(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Handler::Sync(_) => "Sync",
            Handler::Async(_) => "Async",
            Handler::Stream(_) => "Stream",
            Handler::AsyncStream(_) => "AsyncStream",
        };
        f.write_str(name)
    }
}

enum HandlerFailure {
    Error(BoxError),
    Panic {
        message: String,
        backtrace: Option<String>,
    },
}

impl HandlerFailure {
    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            text.to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "handler panicked".to_string()
        };
        // Stashed by the panic hook on this thread before unwinding began.
        let backtrace = PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
        HandlerFailure::Panic { message, backtrace }
    }

    fn into_envelope(self, endpoints: &Endpoints) -> ErrorEnvelope {
        let (error_type, error_message, error_traceback) = match self {
            HandlerFailure::Error(err) => {
                // A returned error carries no backtrace to recover after
                // the fact; the most context available is its source chain.
                let mut chain = err.to_string();
                let mut source = err.source();
                while let Some(cause) = source {
                    chain.push_str("\ncaused by: ");
                    chain.push_str(&cause.to_string());
                    source = cause.source();
                }
                ("HandlerError".to_string(), err.to_string(), chain)
            }
            HandlerFailure::Panic { message, backtrace } => {
                let trace = backtrace.unwrap_or_else(|| format!("panicked: {message}"));
                ("HandlerPanic".to_string(), message, trace)
            }
        };

        ErrorEnvelope {
            error_type,
            error_message,
            error_traceback,
            hostname: endpoints.hostname.clone(),
            worker_id: endpoints.worker_id.clone(),
            runpod_version: crate::VERSION.to_string(),
        }
    }
}

/// Run a unary (non-streaming) handler to its terminal result.
///
/// A returned mapping is inspected for the reserved keys: `error` turns the
/// result into a user error (error wins over any output), and
/// `refresh_worker: true` is lifted onto the result flag. Uncaught errors
/// and panics become a runtime-error envelope carrying the worker identity.
pub async fn run_job(
    handler: &Handler,
    job: &Job,
    endpoints: &Endpoints,
    max_output_bytes: usize,
) -> JobResult {
    tracing::info!(job_id = %job.id, "Job started");

    let invoked = match handler {
        Handler::Sync(f) => {
            let f = f.clone();
            let job = job.clone();
            std::panic::catch_unwind(AssertUnwindSafe(move || f(job)))
                .map_err(HandlerFailure::from_panic)
        }
        Handler::Async(f) => {
            let f = f.clone();
            let job = job.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(job))) {
                Ok(fut) => AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .map_err(HandlerFailure::from_panic),
                Err(payload) => Err(HandlerFailure::from_panic(payload)),
            }
        }
        Handler::Stream(_) | Handler::AsyncStream(_) => {
            tracing::error!(job_id = %job.id, "Streaming handler invoked on the unary path");
            Ok(Err("streaming handler invoked on the unary path".into()))
        }
    };

    let result = match invoked {
        Ok(Ok(output)) => classify_output(output, max_output_bytes),
        Ok(Err(err)) => JobResult::runtime_error(
            HandlerFailure::Error(err).into_envelope(endpoints),
        ),
        Err(failure) => JobResult::runtime_error(failure.into_envelope(endpoints)),
    };

    if result.is_error() {
        tracing::warn!(job_id = %job.id, "Job finished with error");
    } else {
        tracing::debug!(job_id = %job.id, "Job finished");
    }
    result
}

/// Run a streaming handler: post each partial to the stream endpoint, then
/// produce the terminal result. A mid-stream error abandons the sequence
/// and becomes the runtime-error terminal; already-posted partials stand.
pub async fn run_stream_job(
    handler: &Handler,
    job: &Job,
    endpoints: &Endpoints,
    transport: &Transport,
    aggregate: bool,
    max_output_bytes: usize,
) -> JobResult {
    tracing::info!(job_id = %job.id, "Streaming job started");

    let stream: BoxStream<'static, HandlerOutput> = match handler {
        Handler::Stream(f) => {
            let f = f.clone();
            let job = job.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(job))) {
                Ok(iter) => futures::stream::iter(iter).boxed(),
                Err(payload) => {
                    return JobResult::runtime_error(
                        HandlerFailure::from_panic(payload).into_envelope(endpoints),
                    )
                }
            }
        }
        Handler::AsyncStream(f) => {
            let f = f.clone();
            let job = job.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(job))) {
                Ok(stream) => stream,
                Err(payload) => {
                    return JobResult::runtime_error(
                        HandlerFailure::from_panic(payload).into_envelope(endpoints),
                    )
                }
            }
        }
        Handler::Sync(_) | Handler::Async(_) => {
            tracing::error!(job_id = %job.id, "Unary handler invoked on the streaming path");
            return JobResult::runtime_error(
                HandlerFailure::Error("unary handler invoked on the streaming path".into())
                    .into_envelope(endpoints),
            );
        }
    };

    let mut stream = AssertUnwindSafe(stream).catch_unwind();
    let mut aggregated = Vec::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(Ok(partial)) => {
                tracing::debug!(job_id = %job.id, "Stream partial");
                transport
                    .stream_result(
                        job,
                        &StreamFragment {
                            output: partial.clone(),
                        },
                    )
                    .await;
                if aggregate {
                    aggregated.push(partial);
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(job_id = %job.id, error = %err, "Stream handler error");
                return JobResult::runtime_error(
                    HandlerFailure::Error(err).into_envelope(endpoints),
                );
            }
            Err(payload) => {
                return JobResult::runtime_error(
                    HandlerFailure::from_panic(payload).into_envelope(endpoints),
                )
            }
        }
    }

    tracing::debug!(job_id = %job.id, "Finished running stream");
    if aggregate {
        classify_output(Value::Array(aggregated), max_output_bytes)
    } else {
        JobResult::success(Value::Null)
    }
}

/// Map a raw handler return onto the terminal result shape.
fn classify_output(output: Value, max_output_bytes: usize) -> JobResult {
    match output {
        Value::Object(mut map) => {
            let error = map.remove("error");
            let refresh = matches!(map.remove("refresh_worker"), Some(Value::Bool(true)));

            if let Some(message) = error {
                return JobResult::user_error(message).with_refresh(refresh);
            }

            let rest = if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            };
            check_size(rest, max_output_bytes).with_refresh(refresh)
        }
        other => check_size(other, max_output_bytes),
    }
}

fn check_size(output: Value, max_output_bytes: usize) -> JobResult {
    if output.is_null() {
        return JobResult::success(output);
    }

    let size = output.to_string().len();
    if size > max_output_bytes {
        tracing::warn!(size, limit = max_output_bytes, "Handler output too large");
        return JobResult::user_error(Value::String(format!(
            "Handler output of {size} bytes exceeds the {max_output_bytes} byte limit. \
             Upload large outputs to storage and return the object URL instead."
        )));
    }
    JobResult::success(output)
}
