//! Per-request orchestration.
//!
//! Each inbound request runs as one state machine: a phase of concurrent
//! outbound calls is dispatched, every call reports its outcome over a
//! channel, and once the phase is complete a decision closure either
//! finishes the request or opens the next phase. Transient call failures
//! are redispatched with an exponentially growing delay, bounded by the
//! phase deadline and the overall request deadline. The deadline timer is
//! the only other wake-up source; when it fires with calls still
//! outstanding the request finishes with 504 and late results are dropped
//! with the channel.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use http::{Response, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::error::GatewayError;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Delay before redispatching attempt `attempt` (zero-based): 50 ms,
/// doubling each time.
pub fn retry_delay(attempt: u32) -> Duration {
    INITIAL_RETRY_DELAY.saturating_mul(1u32 << attempt.min(16))
}

/// Terminal HTTP answer of a request state machine.
#[derive(Clone, Debug)]
pub struct HttpAnswer {
    pub status: StatusCode,
    pub content_type: String,
    /// Extra headers beyond content type (for example rewritten Location).
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpAnswer {
    pub fn new(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Self {
        match serde_json::to_vec(data) {
            Ok(body) => Self::new(status, "application/json", body),
            Err(e) => Self::error(&GatewayError::Internal(format!(
                "response serialization failed: {e}"
            ))),
        }
    }

    pub fn text(status: StatusCode, body: &str) -> Self {
        Self::new(status, "text/plain", body.as_bytes().to_vec())
    }

    pub fn error(err: &GatewayError) -> Self {
        Self::new(err.status(), "application/json", err.to_json_body())
    }

    pub fn gateway_timeout() -> Self {
        Self::error(&GatewayError::Timeout("request deadline exceeded".into()))
    }

    pub fn into_response(self) -> Response<Vec<u8>> {
        let mut builder = Response::builder()
            .status(self.status)
            .header(http::header::CONTENT_TYPE, &self.content_type);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.body(self.body).unwrap_or_else(|e| {
            log::error!("Failed to build response: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Vec::new())
                .unwrap()
        })
    }
}

/// A call failure, classified for the retry policy.
#[derive(Debug)]
pub struct CallError {
    pub transient: bool,
    pub error: GatewayError,
}

impl CallError {
    pub fn transient(error: GatewayError) -> Self {
        Self {
            transient: true,
            error,
        }
    }

    pub fn terminal(error: GatewayError) -> Self {
        Self {
            transient: false,
            error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Any failure is final.
    None,
    /// Transient failures are redispatched with backoff.
    Transient,
}

/// One outbound call of a phase. The dispatch closure is re-invocable so
/// a retry replays the same call.
pub struct Call<E> {
    pub name: String,
    pub dispatch: Arc<dyn Fn() -> BoxFuture<'static, Result<E, CallError>> + Send + Sync>,
    pub retry: RetryPolicy,
}

impl<E> Call<E> {
    pub fn new<F>(name: &str, retry: RetryPolicy, dispatch: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<E, CallError>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            dispatch: Arc::new(dispatch),
            retry,
        }
    }
}

pub struct Phase<E> {
    pub calls: Vec<Call<E>>,
}

impl<E> Phase<E> {
    pub fn new(calls: Vec<Call<E>>) -> Self {
        Self { calls }
    }
}

pub enum Decision<E> {
    Next(Phase<E>),
    Finish(HttpAnswer),
}

struct Message<E> {
    seq: u64,
    idx: usize,
    outcome: Result<E, CallError>,
}

fn spawn_attempt<E: Send + 'static>(
    tx: mpsc::UnboundedSender<Message<E>>,
    seq: u64,
    idx: usize,
    dispatch: Arc<dyn Fn() -> BoxFuture<'static, Result<E, CallError>> + Send + Sync>,
    delay: Duration,
) {
    tokio::spawn(async move {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let outcome = dispatch().await;
        // the receiver is gone once the request finished; drop late results
        let _ = tx.send(Message { seq, idx, outcome });
    });
}

pub struct Orchestrator {
    deadline: Instant,
    phase_timeout: Duration,
}

impl Orchestrator {
    pub fn new(request_timeout: Duration, phase_timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + request_timeout,
            phase_timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Drive phases to completion. `decide` receives one outcome per call
    /// of the finished phase, in call order.
    pub async fn run<E, F>(&self, mut phase: Phase<E>, mut decide: F) -> HttpAnswer
    where
        E: Send + 'static,
        F: FnMut(Vec<Result<E, GatewayError>>) -> Decision<E>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<E>>();
        let mut seq: u64 = 0;

        loop {
            seq += 1;
            let phase_deadline = std::cmp::min(Instant::now() + self.phase_timeout, self.deadline);
            let calls = std::mem::take(&mut phase.calls);
            let total = calls.len();
            let mut outcomes: Vec<Option<Result<E, GatewayError>>> =
                (0..total).map(|_| None).collect();
            let mut attempts: Vec<u32> = vec![0; total];
            let mut pending = total;

            for (idx, call) in calls.iter().enumerate() {
                spawn_attempt(tx.clone(), seq, idx, call.dispatch.clone(), Duration::ZERO);
            }

            while pending > 0 {
                tokio::select! {
                    _ = tokio::time::sleep_until(self.deadline) => {
                        log::info!("request deadline hit with {pending} calls outstanding");
                        return HttpAnswer::gateway_timeout();
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else {
                            return HttpAnswer::error(&GatewayError::Internal(
                                "orchestrator channel closed".into(),
                            ));
                        };
                        // a message from an earlier phase; drop it
                        if msg.seq != seq || outcomes[msg.idx].is_some() {
                            continue;
                        }
                        match msg.outcome {
                            Ok(event) => {
                                outcomes[msg.idx] = Some(Ok(event));
                                pending -= 1;
                            }
                            Err(err) => {
                                let call = &calls[msg.idx];
                                let attempt = attempts[msg.idx];
                                attempts[msg.idx] += 1;
                                let delay = retry_delay(attempt);
                                let retryable = err.transient
                                    && call.retry == RetryPolicy::Transient
                                    && Instant::now() + delay < phase_deadline;
                                if retryable {
                                    log::debug!(
                                        "call {} failed ({}), retrying in {delay:?}",
                                        call.name, err.error
                                    );
                                    spawn_attempt(
                                        tx.clone(),
                                        seq,
                                        msg.idx,
                                        call.dispatch.clone(),
                                        delay,
                                    );
                                } else {
                                    outcomes[msg.idx] = Some(Err(err.error));
                                    pending -= 1;
                                }
                            }
                        }
                    }
                }
            }

            let results: Vec<Result<E, GatewayError>> = outcomes.into_iter().flatten().collect();
            match decide(results) {
                Decision::Finish(answer) => return answer,
                Decision::Next(next) => phase = next,
            }
        }
    }
}

/// Run independent futures concurrently, returning outcomes in input order.
pub async fn fan_out<T: Send + 'static>(tasks: Vec<BoxFuture<'static, T>>) -> Vec<T> {
    let mut indexed: FuturesUnordered<_> = tasks
        .into_iter()
        .enumerate()
        .map(|(i, task)| async move { (i, task.await) })
        .collect();

    let mut slots: Vec<Option<T>> = Vec::new();
    slots.resize_with(indexed.len(), || None);
    while let Some((i, value)) = indexed.next().await {
        slots[i] = Some(value);
    }
    slots.into_iter().flatten().collect()
}
