//! Fault and hang containment around a single native call
//!
//! Two policies are offered. [`IsolationPolicy::Process`] hands the call to a
//! fresh `zencage-worker` process and watches it from the outside, so an
//! abort or segfault in the native unit only takes the worker down.
//! [`IsolationPolicy::InProcess`] calls the unit on a blocking thread of
//! the current process; it is faster but a native fault kills the caller.

use std::any::Any;
use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use crate::isolate::process::run_isolated;
pub use crate::isolate::protocol::{RejectKind, WORKER_FLAG, WorkerJob, WorkerReply};
use crate::marshal::{MarshalError, marshal};
use crate::native::NativeUnit;
use crate::redirect::{self, CaptureWatch, CapturedStream, RedirectError, Sinks};
use crate::types::{CallOutcome, CallRequest, Capacities, RawCapture};

mod process;
mod protocol;
pub mod worker;

/// Where a call runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// Directly in the calling process; no protection against native faults
    InProcess,

    /// In a fresh worker process per call
    #[default]
    Process,
}

/// What to do with a worker that outlives its timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Stop waiting and leave the worker to exit on its own
    #[default]
    Abandon,

    /// Kill the worker and reap it
    Kill,
}

/// Whatever a failed call managed to write before it went away
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutput {
    pub output: CapturedStream,
    pub logs: CapturedStream,
}

impl PartialOutput {
    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.logs.is_empty()
    }

    pub fn output_text(&self) -> Cow<'_, str> {
        self.output.text()
    }

    pub fn logs_text(&self) -> Cow<'_, str> {
        self.logs.text()
    }
}

impl From<RawCapture> for PartialOutput {
    fn from(capture: RawCapture) -> Self {
        Self {
            output: capture.output,
            logs: capture.logs,
        }
    }
}

/// Errors returned to the caller of a native call
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("native call crashed: {reason}")]
    Crash {
        reason: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        partial: PartialOutput,
    },

    #[error("no result within {after:?}")]
    Timeout {
        after: Duration,
        partial: PartialOutput,
    },

    #[error("native unit '{0}' is not registered")]
    UnknownUnit(String),

    #[error("worker rejected the call ({kind}): {message}")]
    Rejected { kind: RejectKind, message: String },

    #[error("failed to spawn worker {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CallError {
    /// The outcome this failure represents, for failures that happened
    /// after the call was started
    pub fn outcome(&self) -> Option<CallOutcome> {
        match self {
            CallError::Crash { .. } => Some(CallOutcome::Crashed),
            CallError::Timeout { .. } => Some(CallOutcome::TimedOut),
            _ => None,
        }
    }

    /// Partial output attached to a crash or timeout
    pub fn partial(&self) -> Option<&PartialOutput> {
        match self {
            CallError::Crash { partial, .. } | CallError::Timeout { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

/// Marshal `request`, call `unit` with both streams captured into `sinks`,
/// and collect everything it wrote.
///
/// For buffer-shaped units the buffer contents come first in each output,
/// followed by anything the unit also wrote to the stream. A panic in the
/// unit is a [`CallError::Crash`] carrying whatever it wrote first.
pub fn invoke(
    unit: &dyn NativeUnit,
    request: &CallRequest,
    capacities: Capacities,
    sinks: &Sinks,
    watch: &CaptureWatch,
) -> Result<RawCapture, CallError> {
    let mut call = marshal(request, unit.shape(), capacities)?;

    let (status, mut output, mut logs) =
        redirect::capture(sinks, capacities, watch, || unit.invoke(&mut call))?;

    if let Some(buffers) = call.buffers.take() {
        let mut from_buffer = buffers.output.contents();
        from_buffer.append(output, capacities.output);
        output = from_buffer;

        let mut from_buffer = buffers.logs.contents();
        from_buffer.append(logs, capacities.logs);
        logs = from_buffer;
    }

    match status {
        Ok(status) => Ok(RawCapture {
            status,
            output,
            logs,
        }),
        Err(payload) => Err(CallError::Crash {
            reason: panic_reason(payload.as_ref()),
            exit_code: None,
            signal: None,
            partial: PartialOutput { output, logs },
        }),
    }
}

/// Run one call on a blocking thread of this process.
///
/// A panic in the unit is reported as a crash. On timeout both streams are
/// put back before this returns and the thread is left running; what it
/// writes from then on reaches the restored streams, and later calls wait
/// for it to return.
pub async fn run_in_process(
    unit: Arc<dyn NativeUnit>,
    request: CallRequest,
    capacities: Capacities,
    timeout: Option<Duration>,
) -> Result<RawCapture, CallError> {
    let watch = CaptureWatch::new();
    let task = {
        let watch = watch.clone();
        tokio::task::spawn_blocking(move || {
            invoke(unit.as_ref(), &request, capacities, &Sinks::Anonymous, &watch)
        })
    };

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                let partial = match watch.abandon() {
                    Ok((output, logs)) => PartialOutput { output, logs },
                    Err(e) => {
                        warn!("failed to reclaim streams after timeout: {e}");
                        PartialOutput::default()
                    }
                };
                debug!(?limit, "in-process call timed out");
                return Err(CallError::Timeout {
                    after: limit,
                    partial,
                });
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| {
        let reason = if e.is_panic() {
            "native unit panicked".to_string()
        } else {
            e.to_string()
        };
        Err(CallError::Crash {
            reason,
            exit_code: None,
            signal: None,
            partial: PartialOutput::default(),
        })
    })
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match message {
        Some(message) => format!("native unit panicked: {message}"),
        None => "native unit panicked".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_of_failures() {
        let crash = CallError::Crash {
            reason: "signal 6".to_string(),
            exit_code: None,
            signal: Some(6),
            partial: PartialOutput::default(),
        };
        let timeout = CallError::Timeout {
            after: Duration::from_secs(1),
            partial: PartialOutput::default(),
        };
        assert_eq!(crash.outcome(), Some(CallOutcome::Crashed));
        assert_eq!(timeout.outcome(), Some(CallOutcome::TimedOut));
        assert_eq!(CallError::UnknownUnit("x".into()).outcome(), None);
        assert_eq!(
            CallError::Marshal(MarshalError::EmptySeed).outcome(),
            None
        );
    }

    #[test]
    fn partial_is_attached_only_to_crash_and_timeout() {
        let partial = PartialOutput {
            output: CapturedStream::new(b"before".to_vec(), false),
            logs: CapturedStream::default(),
        };
        let crash = CallError::Crash {
            reason: "eof".to_string(),
            exit_code: Some(134),
            signal: None,
            partial: partial.clone(),
        };
        assert_eq!(crash.partial().unwrap().output_text(), "before");
        assert!(CallError::Protocol("x".into()).partial().is_none());
    }

    #[test]
    fn policy_names() {
        assert_eq!(
            serde_json::to_string(&IsolationPolicy::InProcess).unwrap(),
            "\"in_process\""
        );
        assert_eq!(IsolationPolicy::default(), IsolationPolicy::Process);
        assert_eq!(TimeoutStrategy::default(), TimeoutStrategy::Abandon);
    }

    #[test]
    fn panic_reason_names_the_message() {
        let literal: Box<dyn Any + Send> = Box::new("bad input");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        let opaque: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_reason(literal.as_ref()), "native unit panicked: bad input");
        assert_eq!(panic_reason(owned.as_ref()), "native unit panicked: bad state");
        assert_eq!(panic_reason(opaque.as_ref()), "native unit panicked");
    }

    #[test]
    fn partial_from_capture_drops_status() {
        let partial = PartialOutput::from(RawCapture {
            status: 3,
            output: CapturedStream::new(b"o".to_vec(), false),
            logs: CapturedStream::new(b"l".to_vec(), true),
        });
        assert_eq!(partial.output_text(), "o");
        assert!(partial.logs.overflowed);
        assert!(!partial.is_empty());
    }
}
