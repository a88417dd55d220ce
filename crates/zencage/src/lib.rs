//! A library for isolated calls into crash-capable native script engines.
//!
//! Zencage drives a native computation unit (a C entry point that reads a
//! script plus a handful of text fields and writes to stdout/stderr) without
//! letting it corrupt, crash or hang the caller.
//!
//! # Features
//!
//! - **Process isolation**: each call runs in a fresh worker process; aborts, segfaults and hangs are reported, not inherited.
//! - **Stream capture**: fd-level redirection of stdout and stderr with guaranteed restoration.
//! - **Both call shapes**: units that only write to the streams, and units that also fill caller-supplied buffers.
//! - **Classified results**: JSON output is decoded, diagnostic lines are sorted by level.
//! - **TOML configuration**: worker path, policy, timeout, overflow handling and capacities.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use harness::Harness;
pub use isolate::{CallError, IsolationPolicy, PartialOutput, RejectKind, TimeoutStrategy};
pub use marshal::{CallShape, MarshalError, OverflowPolicy};
pub use native::{Entry, ForeignUnit, NativeUnit, UnitRegistry};
pub use redirect::{CapturedStream, Redirect, RedirectError, StdStream};
pub use types::{
    CallOutcome, CallRequest, CallResult, Capacities, LogBuckets, LogEntry, LogLevel, RawCapture,
    Truncated,
};

pub mod classify;
pub mod config;
pub mod harness;
pub mod isolate;
pub mod marshal;
pub mod native;
pub mod redirect;
pub mod types;
