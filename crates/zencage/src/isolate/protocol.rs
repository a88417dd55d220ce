//! Messages exchanged with the worker process
//!
//! The parent writes one [`WorkerJob`] as JSON to the worker's stdin and
//! closes it. The worker answers with at most one [`WorkerReply`] on its
//! original stdout; anything else (no reply, a garbled reply) means the
//! worker died mid-call.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{CallRequest, Capacities, RawCapture};

/// Argument that tells the worker binary to serve one job
pub const WORKER_FLAG: &str = "--zencage-worker";

/// One call, as handed to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    /// Registry name of the native unit
    pub unit: String,
    pub request: CallRequest,
    pub capacities: Capacities,

    /// Sink for fd 1, owned by the parent
    pub output_sink: PathBuf,

    /// Sink for fd 2, owned by the parent
    pub logs_sink: PathBuf,
}

/// The worker's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The unit returned and its output was collected
    Completed { capture: RawCapture },

    /// The unit panicked; its output is left in the sinks
    Panicked { reason: String },

    /// The call never reached the unit
    Rejected { kind: RejectKind, message: String },
}

/// Why the worker refused a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    Marshal,
    Redirect,
    UnknownUnit,
    Protocol,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectKind::Marshal => "marshal",
            RejectKind::Redirect => "redirect",
            RejectKind::UnknownUnit => "unknown unit",
            RejectKind::Protocol => "protocol",
        })
    }
}

impl WorkerReply {
    pub fn rejected(kind: RejectKind, message: impl fmt::Display) -> Self {
        WorkerReply::Rejected {
            kind,
            message: message.to_string(),
        }
    }

    /// Decode whatever the worker wrote before exiting.
    ///
    /// Returns `Ok(None)` when it wrote nothing at all.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(bytes).map(Some)
    }
}
