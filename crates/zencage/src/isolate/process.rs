//! Parent side of a process-isolated call
//!
//! Spawns the worker, hands it the job and watches for its reply. Captured
//! streams are spooled to files in a temporary directory the parent owns, so
//! whatever the unit wrote before dying can still be read back.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::isolate::protocol::{RejectKind, WORKER_FLAG, WorkerJob, WorkerReply};
use crate::isolate::{CallError, PartialOutput, TimeoutStrategy};
use crate::redirect::read_sink_file;
use crate::types::{CallRequest, Capacities, RawCapture};

/// Run one call of `unit` in a fresh worker process
#[instrument(skip(worker, request, capacities), fields(binary = %worker.display()))]
pub async fn run_isolated(
    worker: &Path,
    unit: &str,
    request: &CallRequest,
    capacities: Capacities,
    timeout: Option<Duration>,
    on_timeout: TimeoutStrategy,
) -> Result<RawCapture, CallError> {
    let spool = tempfile::Builder::new().prefix("zencage-").tempdir()?;
    let job = WorkerJob {
        unit: unit.to_string(),
        request: request.clone(),
        capacities,
        output_sink: spool.path().join("stdout.txt"),
        logs_sink: spool.path().join("stderr.txt"),
    };
    let payload = serde_json::to_vec(&job).map_err(|e| CallError::Protocol(e.to_string()))?;

    let mut child = Command::new(worker)
        .arg(WORKER_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| CallError::Spawn {
            path: worker.to_path_buf(),
            source,
        })?;
    let pid = child.id();
    debug!(?pid, "worker started");

    let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(CallError::Protocol("worker pipes unavailable".to_string()));
    };

    let exchange = async {
        // A worker that dies before reading its job surfaces as a missing reply.
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(?pid, "failed to send job: {e}");
        }
        drop(stdin);

        let mut reply = Vec::new();
        stdout.read_to_end(&mut reply).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((reply, status))
    };

    let finished = match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange).await.ok(),
        None => Some(exchange.await),
    };

    match finished {
        Some(Ok((reply, status))) => settle(&reply, status, &job),
        Some(Err(e)) => Err(CallError::Io(e)),
        None => {
            let after = timeout.unwrap_or_default();
            match on_timeout {
                TimeoutStrategy::Kill => {
                    if let Err(e) = child.kill().await {
                        warn!(?pid, "failed to kill worker after timeout: {e}");
                    } else {
                        debug!(?pid, "killed worker after timeout");
                    }
                }
                TimeoutStrategy::Abandon => {
                    warn!(?pid, ?after, "abandoning worker still running after timeout");
                }
            }
            Err(CallError::Timeout {
                after,
                partial: recover_partial(&job),
            })
        }
    }
}

fn settle(reply: &[u8], status: ExitStatus, job: &WorkerJob) -> Result<RawCapture, CallError> {
    let crash = |reason: String, partial: PartialOutput| CallError::Crash {
        reason,
        exit_code: status.code(),
        signal: status.signal(),
        partial,
    };

    let reply = match WorkerReply::decode(reply) {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            return Err(crash(
                format!("worker exited without a result ({})", describe(status)),
                recover_partial(job),
            ));
        }
        Err(e) => {
            return Err(crash(
                format!("unreadable worker reply ({}): {e}", describe(status)),
                recover_partial(job),
            ));
        }
    };

    match reply {
        WorkerReply::Completed { capture } if status.success() => {
            debug!(status = capture.status, "worker completed");
            Ok(capture)
        }
        WorkerReply::Completed { capture } => Err(crash(
            format!("worker failed after replying ({})", describe(status)),
            capture.into(),
        )),
        WorkerReply::Panicked { reason } => Err(crash(reason, recover_partial(job))),
        WorkerReply::Rejected {
            kind: RejectKind::UnknownUnit,
            ..
        } => Err(CallError::UnknownUnit(job.unit.clone())),
        WorkerReply::Rejected { kind, message } => Err(CallError::Rejected { kind, message }),
    }
}

/// Read back whatever reached the sink files, best effort
fn recover_partial(job: &WorkerJob) -> PartialOutput {
    let read = |path: &Path, capacity: usize| {
        read_sink_file(path, capacity).unwrap_or_else(|e| {
            debug!(path = %path.display(), "failed to recover partial output: {e}");
            Default::default()
        })
    };
    PartialOutput {
        output: read(&job.output_sink, job.capacities.output),
        logs: read(&job.logs_sink, job.capacities.logs),
    }
}

fn describe(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (_, Some(signal)) => format!("killed by signal {signal}"),
        (Some(code), None) => format!("exit code {code}"),
        (None, None) => "unknown exit status".to_string(),
    }
}
