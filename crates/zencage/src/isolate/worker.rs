//! Worker side of a process-isolated call
//!
//! The worker reads one job from stdin, runs it with fds 1 and 2 pointed at
//! the parent's sink files, and writes its reply to a private duplicate of
//! the stdout it started with. If the native unit takes the process down,
//! no reply is written and the parent reports a crash.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use tracing::{debug, error};

use crate::isolate::protocol::{RejectKind, WorkerJob, WorkerReply};
use crate::isolate::{CallError, invoke};
use crate::native::UnitRegistry;
use crate::redirect::{CaptureWatch, Sinks, dup_cloexec};

/// Serve a single job and exit
pub fn serve(registry: &UnitRegistry) -> ExitCode {
    // Taken before any redirection so the reply can never land in a sink.
    let mut channel = match dup_cloexec(libc::STDOUT_FILENO) {
        Ok(fd) => File::from(fd),
        Err(e) => {
            error!("failed to open reply channel: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reply = handle(registry, io::stdin().lock());

    let written = serde_json::to_writer(&mut channel, &reply)
        .map_err(io::Error::from)
        .and_then(|()| channel.flush());
    match written {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("failed to send reply: {e}");
            ExitCode::FAILURE
        }
    }
}

fn handle(registry: &UnitRegistry, mut input: impl Read) -> WorkerReply {
    let mut bytes = Vec::new();
    if let Err(e) = input.read_to_end(&mut bytes) {
        return WorkerReply::rejected(RejectKind::Protocol, format!("failed to read job: {e}"));
    }
    let job: WorkerJob = match serde_json::from_slice(&bytes) {
        Ok(job) => job,
        Err(e) => {
            return WorkerReply::rejected(RejectKind::Protocol, format!("malformed job: {e}"));
        }
    };

    let Some(unit) = registry.get(&job.unit) else {
        return WorkerReply::rejected(RejectKind::UnknownUnit, &job.unit);
    };
    debug!(unit = %job.unit, "serving job");

    let sinks = Sinks::Files {
        output: job.output_sink,
        logs: job.logs_sink,
    };
    match invoke(unit.as_ref(), &job.request, job.capacities, &sinks, &CaptureWatch::new()) {
        Ok(capture) => WorkerReply::Completed { capture },
        // The sinks already hold what it wrote; the parent reads them back.
        Err(CallError::Crash { reason, .. }) => WorkerReply::Panicked { reason },
        Err(CallError::Marshal(e)) => WorkerReply::rejected(RejectKind::Marshal, e),
        Err(CallError::Redirect(e)) => WorkerReply::rejected(RejectKind::Redirect, e),
        Err(e) => WorkerReply::rejected(RejectKind::Protocol, e),
    }
}
