//! Encoding of call requests into the native parameter shape
//!
//! Native units take six positional, NUL-terminated text parameters
//! (script, conf, keys, data, extra, context) where an unset field is a
//! null pointer. Units of the buffer shape additionally write into two
//! caller-owned, fixed-capacity regions.

use std::ffi::{CStr, CString, c_char};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redirect::{CapturedStream, StdStream};
use crate::types::{CallRequest, Capacities};

/// Number of positional text parameters a native unit takes
pub const PARAM_COUNT: usize = 6;

/// Errors that occur while encoding a request or settling its output
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("{field} contains a NUL byte at offset {position}")]
    InteriorNul { field: &'static str, position: usize },

    #[error("verbosity {0} is above the maximum of {max}", max = CallRequest::MAX_VERBOSITY)]
    Verbosity(u8),

    #[error("random seed is empty")]
    EmptySeed,

    #[error("{stream} exceeded its capacity of {capacity} bytes")]
    Overflow { stream: StdStream, capacity: usize },
}

/// How a native unit hands back its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    /// Writes to the process-wide stdout/stderr and returns a status code
    Streams,

    /// Also writes into caller-supplied output buffers
    Buffers,
}

/// What to do when a unit writes more than an output's capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep the first `capacity` bytes and flag the result as truncated
    #[default]
    Truncate,

    /// Fail the call with [`MarshalError::Overflow`]
    Reject,
}

impl OverflowPolicy {
    /// Apply the policy to one captured output.
    ///
    /// Returns whether the output was truncated.
    pub fn settle(
        self,
        stream: StdStream,
        captured: &CapturedStream,
        capacity: usize,
    ) -> Result<bool, MarshalError> {
        match (self, captured.overflowed) {
            (_, false) => Ok(false),
            (OverflowPolicy::Truncate, true) => Ok(true),
            (OverflowPolicy::Reject, true) => Err(MarshalError::Overflow { stream, capacity }),
        }
    }
}

/// The six positional parameters, in native order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeParams {
    slots: [Option<CString>; PARAM_COUNT],
}

impl NativeParams {
    /// Parameter names in positional order
    pub const NAMES: [&'static str; PARAM_COUNT] =
        ["script", "conf", "keys", "data", "extra", "context"];

    /// The parameter at `index`, `None` when absent
    pub fn get(&self, index: usize) -> Option<&CStr> {
        self.slots.get(index)?.as_deref()
    }

    /// Look a parameter up by name
    pub fn by_name(&self, name: &str) -> Option<&CStr> {
        let index = Self::NAMES.iter().position(|n| *n == name)?;
        self.get(index)
    }

    /// Raw pointers for the native call; absent parameters are null.
    ///
    /// The pointers borrow from `self` and are valid while it lives.
    pub fn as_ptrs(&self) -> [*const c_char; PARAM_COUNT] {
        std::array::from_fn(|i| {
            self.slots[i]
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr())
        })
    }
}

/// A zero-initialized, fixed-capacity region a native unit writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    bytes: Box<[u8]>,
}

impl OutputBuffer {
    pub fn zeroed(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_char {
        self.bytes.as_mut_ptr().cast()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The text the unit left behind, up to the first NUL.
    ///
    /// A buffer without any NUL was filled to the brim, which is reported
    /// as an overflow.
    pub fn contents(&self) -> CapturedStream {
        match self.bytes.iter().position(|b| *b == 0) {
            Some(end) => CapturedStream::new(self.bytes[..end].to_vec(), false),
            None => CapturedStream::new(self.bytes.to_vec(), true),
        }
    }
}

/// The two output regions handed to a buffer-shaped unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffers {
    pub output: OutputBuffer,
    pub logs: OutputBuffer,
}

/// Everything a native unit needs for one call
#[derive(Debug)]
pub struct MarshaledCall {
    pub params: NativeParams,

    /// Present only for [`CallShape::Buffers`]
    pub buffers: Option<OutputBuffers>,
}

/// Encode `request` for a unit of the given shape.
pub fn marshal(
    request: &CallRequest,
    shape: CallShape,
    capacities: Capacities,
) -> Result<MarshaledCall, MarshalError> {
    let conf = fold_conf(request)?;
    let fields = [
        Some(request.script()),
        conf.as_deref(),
        request.keys(),
        request.data(),
        request.extra(),
        request.context(),
    ];

    let mut slots: [Option<CString>; PARAM_COUNT] = Default::default();
    for (i, field) in fields.into_iter().enumerate() {
        slots[i] = field
            .map(|text| encode(NativeParams::NAMES[i], text))
            .transpose()?;
    }

    let buffers = match shape {
        CallShape::Streams => None,
        CallShape::Buffers => Some(OutputBuffers {
            output: OutputBuffer::zeroed(capacities.output),
            logs: OutputBuffer::zeroed(capacities.logs),
        }),
    };

    Ok(MarshaledCall {
        params: NativeParams { slots },
        buffers,
    })
}

/// Check that `request` can be encoded, without allocating any buffers.
pub fn validate(request: &CallRequest) -> Result<(), MarshalError> {
    marshal(request, CallShape::Streams, Capacities::default()).map(drop)
}

fn encode(field: &'static str, text: &str) -> Result<CString, MarshalError> {
    CString::new(text).map_err(|e| MarshalError::InteriorNul {
        field,
        position: e.nul_position(),
    })
}

/// Fold verbosity and seed into the engine configuration string
fn fold_conf(request: &CallRequest) -> Result<Option<String>, MarshalError> {
    if request.verbosity().is_none() && request.seed().is_none() {
        return Ok(request.conf().map(str::to_owned));
    }

    let mut parts: Vec<String> = request
        .conf()
        .filter(|conf| !conf.trim().is_empty())
        .map(str::to_owned)
        .into_iter()
        .collect();

    if let Some(level) = request.verbosity() {
        if level > CallRequest::MAX_VERBOSITY {
            return Err(MarshalError::Verbosity(level));
        }
        parts.push(format!("debug={level}"));
    }

    if let Some(seed) = request.seed() {
        if seed.is_empty() {
            return Err(MarshalError::EmptySeed);
        }
        parts.push(format!("rngseed=\"hex:{}\"", hex::encode(seed)));
    }

    Ok(Some(parts.join(",")))
}
