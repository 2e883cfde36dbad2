//! Process isolation.
//!
//! The host starts a child copy of the executable with [`WORKER_FLAG`],
//! writes one [`WorkerJob`] as JSON on its stdin and reads one
//! [`Evaluation`] back from its stdout. Inside the child the job runs on
//! a thread-isolated [`Sandbox`]. When the budget expires the host kills
//! the child, which also stops a loop the engine itself cannot break.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capabilities::CapabilitySet;
use crate::config::{CapabilitiesConfig, SandboxConfig};
use crate::report::{Failure, FailureKind};

use super::{Evaluation, EvaluationOutcome, EvaluationRequest, Isolation, Sandbox};

/// Command-line flag that turns the executable into a one-shot worker.
pub const WORKER_FLAG: &str = "--worker";

/// One evaluation handed to a worker process.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerJob {
    pub request_id: String,
    /// Time left when the job was handed over
    pub budget: Duration,
    pub sandbox: SandboxConfig,
    pub capabilities: CapabilitiesConfig,
    pub request: EvaluationRequest,
}

impl WorkerJob {
    /// Runs the job on a thread inside the current process.
    pub async fn evaluate(self) -> Evaluation {
        let config = SandboxConfig {
            isolation: Isolation::Thread,
            max_concurrent: 1,
            ..self.sandbox
        };
        let capabilities = Arc::new(CapabilitySet::from_config(&self.capabilities));
        Sandbox::new(capabilities, config)
            .run_as(self.request_id, &self.request, self.budget)
            .await
    }
}

/// Worker entry point: reads one job from stdin, writes the evaluation
/// to stdout.
pub async fn serve() -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("reading worker job")?;
    let job: WorkerJob = serde_json::from_slice(&input).context("malformed worker job")?;

    let evaluation = job.evaluate().await;

    let reply = serde_json::to_vec(&evaluation)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&reply).await?;
    stdout.flush().await?;
    Ok(())
}

/// Runs `job` in a child process, killing it at `deadline`. `budget` is
/// the full budget of the request, reported on timeout.
pub(crate) async fn run_in_process(
    job: &WorkerJob,
    worker_path: Option<&Path>,
    deadline: Instant,
    budget: Duration,
) -> Evaluation {
    match exchange(job, worker_path, deadline).await {
        Ok(Some(evaluation)) => match evaluation.outcome {
            EvaluationOutcome::TimedOut { .. } => Evaluation {
                outcome: EvaluationOutcome::TimedOut { budget },
                ..evaluation
            },
            _ => evaluation,
        },
        Ok(None) => Evaluation::new(EvaluationOutcome::TimedOut { budget }),
        Err(e) => {
            warn!("[{}] Worker process failed: {e:#}", job.request_id);
            Evaluation::new(EvaluationOutcome::Failure(Failure::host(
                FailureKind::RuntimeError,
                &e,
            )))
        }
    }
}

/// `Ok(None)` means the deadline passed and the child was killed.
async fn exchange(
    job: &WorkerJob,
    worker_path: Option<&Path>,
    deadline: Instant,
) -> Result<Option<Evaluation>> {
    let program = match worker_path {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe().context("could not locate the worker executable")?,
    };
    let payload = serde_json::to_vec(job)?;

    let mut child = Command::new(&program)
        .arg(WORKER_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("could not start worker process {}", program.display()))?;
    let mut stdin = child.stdin.take().context("worker stdin is not piped")?;
    let mut stdout = child.stdout.take().context("worker stdout is not piped")?;

    let conversation = async {
        stdin.write_all(&payload).await?;
        drop(stdin);
        let mut reply = Vec::new();
        stdout.read_to_end(&mut reply).await?;
        let status = child.wait().await?;
        anyhow::Ok((status, reply))
    };

    let exchanged =
        tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), conversation).await;
    let (status, reply) = match exchanged {
        Ok(exchanged) => exchanged?,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("[{}] Could not kill worker process: {e}", job.request_id);
            }
            debug!("[{}] Killed worker process at the deadline", job.request_id);
            return Ok(None);
        }
    };

    if reply.is_empty() {
        bail!("worker process exited with {status} without a reply");
    }
    let evaluation = serde_json::from_slice(&reply)
        .with_context(|| format!("worker process sent an unreadable reply ({status})"))?;
    Ok(Some(evaluation))
}
