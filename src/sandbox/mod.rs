//! Bounded evaluator: runs one snippet per request under a hard budget.
//!
//! Each evaluation gets a fresh engine context on a worker of its own, so
//! a snippet stuck in a tight loop never blocks the async runtime or other
//! requests. Two kinds of worker exist:
//!
//! - `process` (default): a child copy of the executable, see [`worker`].
//!   When the budget expires the child is killed, whatever it is doing.
//! - `thread`: a named host thread. When the budget expires the host
//!   reports `TimedOut`, releases the concurrency slot and flags the worker
//!   as abandoned. The engine cannot be preempted from outside, so a worker
//!   spinning in nested loops keeps its thread until it finishes. Such
//!   runaways are counted and capped by `sandbox.max_runaway_workers`.
//!
//! Capability sets built from injected collaborators cannot be rebuilt in
//! another process and always run on threads.

pub mod compile;
mod context;
mod driver;
pub mod outcome;
pub mod timers;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::CapabilitySet;
use crate::config::SandboxConfig;
use crate::report::{Failure, FailureKind};

use context::{ContextSetup, ExecutionContext};

pub use compile::UnitForm;
pub use outcome::{Caller, EvalValue, Evaluation, EvaluationOutcome, EvaluationRequest};

/// Where an evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// A child process per evaluation, killed when the budget runs out
    #[default]
    Process,
    /// A host thread per evaluation
    Thread,
}

impl Isolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Process => "process",
            Isolation::Thread => "thread",
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Sandbox {
    capabilities: Arc<CapabilitySet>,
    config: SandboxConfig,
    isolation: Isolation,
    permits: Arc<Semaphore>,
    /// One entry per timed-out thread worker; dead entries are pruned
    runaways: Mutex<Vec<Weak<()>>>,
}

/// Everything a worker thread takes with it.
struct Job {
    capabilities: Arc<CapabilitySet>,
    config: SandboxConfig,
    request: EvaluationRequest,
    request_id: String,
    runtime: Handle,
    deadline: Instant,
    budget: Duration,
    abandoned: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn new(capabilities: Arc<CapabilitySet>, config: SandboxConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let isolation = match config.isolation {
            Isolation::Process if capabilities.config().is_none() => {
                debug!("Injected capabilities cannot leave this process, evaluating on threads");
                Isolation::Thread
            }
            isolation => isolation,
        };
        Self {
            capabilities,
            config,
            isolation,
            permits,
            runaways: Mutex::new(Vec::new()),
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The isolation actually used, which may differ from the configured one.
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Timed-out thread workers that are still running.
    pub fn runaway_workers(&self) -> usize {
        let mut runaways = self.runaways.lock().unwrap_or_else(PoisonError::into_inner);
        runaways.retain(|alive| alive.strong_count() > 0);
        runaways.len()
    }

    /// Evaluates a snippet under the configured budget.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationOutcome {
        self.run(request).await.outcome
    }

    /// Evaluates a snippet under an explicit wall-clock budget.
    pub async fn evaluate_with_timeout(
        &self,
        request: &EvaluationRequest,
        budget: Duration,
    ) -> EvaluationOutcome {
        self.run_with_timeout(request, budget).await.outcome
    }

    /// Like [`Sandbox::evaluate`], keeping console output and timing.
    pub async fn run(&self, request: &EvaluationRequest) -> Evaluation {
        self.run_with_timeout(request, self.config.timeout()).await
    }

    /// Like [`Sandbox::evaluate_with_timeout`], keeping console output and
    /// timing. Time spent waiting for a concurrency slot counts against
    /// the budget.
    pub async fn run_with_timeout(&self, request: &EvaluationRequest, budget: Duration) -> Evaluation {
        self.run_as(short_id(), request, budget).await
    }

    pub(crate) async fn run_as(
        &self,
        request_id: String,
        request: &EvaluationRequest,
        budget: Duration,
    ) -> Evaluation {
        let started = Instant::now();
        let deadline = started + budget;

        info!(
            "[{request_id}] Evaluating {} bytes for {} (budget {} ms, {} isolation)",
            request.code().len(),
            request.caller().id,
            budget.as_millis(),
            self.isolation
        );

        let evaluation = match acquire(&self.permits, deadline).await {
            Ok(Some(permit)) => {
                let evaluation = self.dispatch(&request_id, request, deadline, budget).await;
                // Released here even when a thread worker is still spinning
                drop(permit);
                evaluation
            }
            Ok(None) => {
                warn!("[{request_id}] No evaluation slot freed up within the budget");
                Evaluation::new(EvaluationOutcome::TimedOut { budget })
            }
            Err(failure) => Evaluation::new(EvaluationOutcome::Failure(failure)),
        };
        let evaluation = Evaluation {
            elapsed: started.elapsed(),
            ..evaluation
        };

        info!(
            "[{request_id}] Evaluation {} in {} ms",
            evaluation.outcome.label(),
            evaluation.elapsed.as_millis()
        );
        evaluation
    }

    async fn dispatch(
        &self,
        request_id: &str,
        request: &EvaluationRequest,
        deadline: Instant,
        budget: Duration,
    ) -> Evaluation {
        match (self.isolation, self.capabilities.config()) {
            (Isolation::Process, Some(capabilities)) => {
                let job = worker::WorkerJob {
                    request_id: request_id.to_string(),
                    budget: deadline.saturating_duration_since(Instant::now()),
                    sandbox: self.config.clone(),
                    capabilities: capabilities.clone(),
                    request: request.clone(),
                };
                worker::run_in_process(&job, self.config.worker_path.as_deref(), deadline, budget).await
            }
            _ => self.run_in_thread(request_id, request, deadline, budget).await,
        }
    }

    async fn run_in_thread(
        &self,
        request_id: &str,
        request: &EvaluationRequest,
        deadline: Instant,
        budget: Duration,
    ) -> Evaluation {
        let runaways = self.runaway_workers();
        if runaways >= self.config.max_runaway_workers {
            warn!("[{request_id}] {runaways} timed-out evaluations still running, refusing");
            return Evaluation::new(EvaluationOutcome::Failure(Failure::new(
                FailureKind::RuntimeError,
                format!("{runaways} timed-out evaluations are still running, try again later"),
                "",
            )));
        }

        let abandoned = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(());
        let liveness = Arc::downgrade(&alive);
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            capabilities: Arc::clone(&self.capabilities),
            config: self.config.clone(),
            request: request.clone(),
            request_id: request_id.to_string(),
            runtime: Handle::current(),
            deadline,
            budget,
            abandoned: Arc::clone(&abandoned),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("eval-{request_id}"))
            .spawn(move || {
                let _alive = alive;
                let request_id = job.request_id.clone();
                let evaluation = job.run();
                if reply_tx.send(evaluation).is_err() {
                    debug!("[{request_id}] Discarding result of abandoned evaluation");
                }
            });
        if let Err(e) = spawned {
            let error = anyhow::Error::from(e).context("could not start evaluation worker");
            return Evaluation::new(EvaluationOutcome::Failure(Failure::host(
                FailureKind::RuntimeError,
                &error,
            )));
        }

        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), reply_rx).await {
            Ok(Ok(evaluation)) => evaluation,
            // The worker dropped its sender without replying: it panicked
            Ok(Err(_)) => Evaluation::new(EvaluationOutcome::Failure(Failure::new(
                FailureKind::RuntimeError,
                "evaluation worker terminated unexpectedly",
                "",
            ))),
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                self.runaways
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(liveness);
                Evaluation::new(EvaluationOutcome::TimedOut { budget })
            }
        }
    }
}

/// Waits for a concurrency slot until `deadline`. `Ok(None)` means the
/// deadline passed first.
async fn acquire(
    permits: &Arc<Semaphore>,
    deadline: Instant,
) -> Result<Option<OwnedSemaphorePermit>, Failure> {
    let wait = Arc::clone(permits).acquire_owned();
    match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), wait).await {
        Ok(Ok(permit)) => Ok(Some(permit)),
        Ok(Err(_)) => Err(Failure::new(
            FailureKind::RuntimeError,
            "the evaluator is shutting down",
            "",
        )),
        Err(_) => Ok(None),
    }
}

impl Job {
    fn run(self) -> Evaluation {
        let setup = ContextSetup {
            capabilities: &self.capabilities,
            config: &self.config,
            request: &self.request,
            request_id: &self.request_id,
            runtime: self.runtime.clone(),
            deadline: self.deadline,
            budget: self.budget,
            abandoned: Arc::clone(&self.abandoned),
        };
        let mut exec = match ExecutionContext::build(setup) {
            Ok(exec) => exec,
            Err(failure) => return Evaluation::new(EvaluationOutcome::Failure(failure)),
        };
        let outcome = driver::run(&mut exec, self.request.code(), self.config.max_code_size);
        Evaluation {
            console: exec.take_console(),
            ..Evaluation::new(outcome)
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
