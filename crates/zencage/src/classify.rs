//! Turning raw captured bytes into a [`CallResult`]
//!
//! Nothing in here can fail: invalid UTF-8 is decoded lossily, output that
//! is not a JSON object or array simply has no structured result, and
//! diagnostic lines without a known marker are kept as unclassified text.

use serde_json::Value;

use crate::types::{
    CallResult, LogBuckets, LogEntry, LogLevel, MARKER_POSITION, PREFIX_WIDTH, RawCapture,
    Truncated,
};

/// Classify a raw capture
pub fn classify(raw: &RawCapture, truncated: Truncated) -> CallResult {
    let output = primary_text(&raw.output.bytes);
    let logs = String::from_utf8_lossy(&raw.logs.bytes).into_owned();

    CallResult {
        status: raw.status,
        result: structured(&output),
        buckets: bucket_lines(&logs),
        output,
        logs,
        truncated,
    }
}

/// Primary output with trailing line terminators removed
fn primary_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(['\n', '\r']).to_owned()
}

/// Decode the output as a JSON object or array.
///
/// Scalars are not structured results: `3` stays plain text.
pub fn structured(output: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Classify a single diagnostic line by its marker character
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let marker = line.chars().nth(MARKER_POSITION)?;
    let level = LogLevel::from_marker(marker)?;
    let message = match line.strip_prefix(level.prefix()) {
        Some(rest) => rest,
        None => line
            .char_indices()
            .nth(PREFIX_WIDTH)
            .map_or("", |(at, _)| &line[at..]),
    };
    Some(LogEntry {
        level,
        message: message.to_owned(),
    })
}

/// Split diagnostic text into per-level buckets
pub fn bucket_lines(logs: &str) -> LogBuckets {
    let mut buckets = LogBuckets::default();
    for line in logs.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(entry) => buckets.push(entry),
            None => buckets.unclassified.push(line.to_owned()),
        }
    }
    buckets
}
