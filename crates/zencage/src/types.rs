use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redirect::CapturedStream;

/// One call into a native unit.
///
/// Built once through the `with_*` methods and never mutated afterwards;
/// the harness only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    script: String,
    #[serde(default)]
    conf: Option<String>,
    #[serde(default)]
    keys: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    extra: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    seed: Option<Vec<u8>>,
    #[serde(default)]
    verbosity: Option<u8>,
}

impl CallRequest {
    /// Highest verbosity level understood by the engine configuration.
    pub const MAX_VERBOSITY: u8 = 3;

    /// Create a request carrying only a script
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            conf: None,
            keys: None,
            data: None,
            extra: None,
            context: None,
            seed: None,
            verbosity: None,
        }
    }

    /// Set the engine configuration text
    pub fn with_conf(mut self, conf: impl Into<String>) -> Self {
        self.conf = Some(conf.into());
        self
    }

    /// Set the key material
    pub fn with_keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = Some(keys.into());
        self
    }

    /// Set the data input
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the first extension field
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Set the second extension field
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set a deterministic random seed
    pub fn with_seed(mut self, seed: impl Into<Vec<u8>>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    /// Set the engine verbosity (0 to [`MAX_VERBOSITY`](Self::MAX_VERBOSITY))
    pub fn with_verbosity(mut self, level: u8) -> Self {
        self.verbosity = Some(level);
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn conf(&self) -> Option<&str> {
        self.conf.as_deref()
    }

    pub fn keys(&self) -> Option<&str> {
        self.keys.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn extra(&self) -> Option<&str> {
        self.extra.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn seed(&self) -> Option<&[u8]> {
        self.seed.as_deref()
    }

    pub fn verbosity(&self) -> Option<u8> {
        self.verbosity
    }
}

/// Fixed byte capacities for the primary and diagnostic outputs of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacities {
    /// Primary output capacity in bytes
    #[serde(default = "default_output_capacity")]
    pub output: usize,

    /// Diagnostic output capacity in bytes
    #[serde(default = "default_logs_capacity")]
    pub logs: usize,
}

impl Capacities {
    /// 1 kibibyte in bytes
    pub const KIB: usize = 1024;
    /// 1 mebibyte in bytes
    pub const MIB: usize = 1024 * 1024;

    pub fn new(output: usize, logs: usize) -> Self {
        Self { output, logs }
    }
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            output: default_output_capacity(),
            logs: default_logs_capacity(),
        }
    }
}

fn default_output_capacity() -> usize {
    2 * Capacities::MIB
}

fn default_logs_capacity() -> usize {
    64 * Capacities::KIB
}

/// How a call ended, as observed by the isolator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The unit returned and its output was collected
    Completed,

    /// The worker went away without delivering a result
    Crashed,

    /// No result arrived within the allotted time
    TimedOut,
}

/// Severity of one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// All levels, lowest first
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
    ];

    /// Map the marker character found at [`MARKER_POSITION`] to a level
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '.' | 'F' => Some(LogLevel::Trace),
            'D' => Some(LogLevel::Debug),
            '*' => Some(LogLevel::Info),
            'W' => Some(LogLevel::Warning),
            '!' => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// The prefix the engine writes in front of a line of this level
    pub fn prefix(self) -> &'static str {
        match self {
            LogLevel::Trace => " .  ",
            LogLevel::Debug => "[D] ",
            LogLevel::Info => "[*] ",
            LogLevel::Warning => "[W] ",
            LogLevel::Error => "[!] ",
        }
    }
}

/// Byte offset of the level marker inside a diagnostic line.
pub const MARKER_POSITION: usize = 1;

/// Width of the level prefix that precedes the message text.
pub const PREFIX_WIDTH: usize = 4;

/// A classified diagnostic line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Diagnostic lines grouped by level, in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBuckets {
    pub trace: Vec<String>,
    pub debug: Vec<String>,
    pub info: Vec<String>,
    pub warning: Vec<String>,
    pub error: Vec<String>,

    /// Non-empty lines without a recognised marker, kept verbatim
    pub unclassified: Vec<String>,
}

impl LogBuckets {
    /// Messages recorded at `level`
    pub fn get(&self, level: LogLevel) -> &[String] {
        match level {
            LogLevel::Trace => &self.trace,
            LogLevel::Debug => &self.debug,
            LogLevel::Info => &self.info,
            LogLevel::Warning => &self.warning,
            LogLevel::Error => &self.error,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        let bucket = match entry.level {
            LogLevel::Trace => &mut self.trace,
            LogLevel::Debug => &mut self.debug,
            LogLevel::Info => &mut self.info,
            LogLevel::Warning => &mut self.warning,
            LogLevel::Error => &mut self.error,
        };
        bucket.push(entry.message);
    }

    /// Every classified line as a [`LogEntry`], lowest level first
    pub fn entries(&self) -> impl Iterator<Item = LogEntry> + '_ {
        LogLevel::ALL.into_iter().flat_map(move |level| {
            self.get(level).iter().map(move |message| LogEntry {
                level,
                message: message.clone(),
            })
        })
    }

    /// True when no line of any kind was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        LogLevel::ALL.iter().all(|level| self.get(*level).is_empty())
            && self.unclassified.is_empty()
    }
}

/// Which outputs were cut at their capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncated {
    pub output: bool,
    pub logs: bool,
}

impl Truncated {
    #[must_use]
    pub fn any(&self) -> bool {
        self.output || self.logs
    }
}

/// Raw bytes collected for one call, before classification.
///
/// This is what crosses the worker boundary; classification happens on the
/// caller's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCapture {
    /// Return value of the native unit
    pub status: i32,

    /// Primary output
    pub output: CapturedStream,

    /// Diagnostic output
    pub logs: CapturedStream,
}

/// Classified result of a completed call
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Return value of the native unit
    pub status: i32,

    /// Primary output text, lossily decoded as UTF-8.
    ///
    /// Trailing `\n` and `\r` are removed, so this is not byte-exact.
    /// Leading whitespace and everything else is kept as written.
    pub output: String,

    /// Diagnostic output text
    pub logs: String,

    /// Primary output decoded as a JSON object or array, if it is one
    pub result: Option<Value>,

    /// Diagnostic lines by level
    pub buckets: LogBuckets,

    /// Outputs cut at their capacity under the truncate policy
    pub truncated: Truncated,
}

impl CallResult {
    /// Check if the unit reported success (returned 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Always [`CallOutcome::Completed`]; failed outcomes are errors
    pub fn outcome(&self) -> CallOutcome {
        CallOutcome::Completed
    }
}
