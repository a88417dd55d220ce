//! The seam to the native computation unit
//!
//! A native unit is anything implementing [`NativeUnit`]. Real engines are
//! plain C entry points wrapped in a [`ForeignUnit`]; the harness only ever
//! sees the trait, so it never learns which engine it is driving.

use std::collections::HashMap;
use std::ffi::{c_char, c_int};
use std::fmt;
use std::sync::Arc;

pub use crate::native::probe::{PROBE, PROBE_TOBUF};

use crate::marshal::{CallShape, MarshaledCall};

pub mod probe;

/// Status returned when a buffer-shaped unit is handed no buffers
pub const MISSING_BUFFERS: i32 = -1;

/// Entry point of a unit that only writes to the standard streams
pub type StreamEntry = unsafe extern "C" fn(
    script: *const c_char,
    conf: *const c_char,
    keys: *const c_char,
    data: *const c_char,
    extra: *const c_char,
    context: *const c_char,
) -> c_int;

/// Entry point of a unit that writes into caller-supplied buffers
pub type BufferEntry = unsafe extern "C" fn(
    script: *const c_char,
    conf: *const c_char,
    keys: *const c_char,
    data: *const c_char,
    extra: *const c_char,
    context: *const c_char,
    stdout_buf: *mut c_char,
    stdout_len: usize,
    stderr_buf: *mut c_char,
    stderr_len: usize,
) -> c_int;

/// A native computation unit the harness can call
pub trait NativeUnit: Send + Sync + fmt::Debug {
    /// Name the unit is registered under
    fn name(&self) -> &str;

    /// How the unit returns its output
    fn shape(&self) -> CallShape;

    /// Run one call and return the unit's status code.
    ///
    /// Called with both standard streams redirected; anything written to
    /// them ends up in the call's captured output.
    fn invoke(&self, call: &mut MarshaledCall) -> i32;
}

/// A raw C entry point of either shape
#[derive(Clone, Copy)]
pub enum Entry {
    Streams(StreamEntry),
    Buffers(BufferEntry),
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Streams(ptr) => write!(f, "Streams({:p})", *ptr as *const ()),
            Entry::Buffers(ptr) => write!(f, "Buffers({:p})", *ptr as *const ()),
        }
    }
}

/// A native unit reached through a C function pointer
#[derive(Debug, Clone)]
pub struct ForeignUnit {
    name: String,
    entry: Entry,
}

impl ForeignUnit {
    /// Wrap a C entry point.
    ///
    /// # Safety
    ///
    /// `entry` must accept the parameters its type declares: six pointers
    /// that are each either null or a NUL-terminated string, plus (for the
    /// buffer shape) two writable regions of the given lengths. It must not
    /// keep any of those pointers after returning.
    pub unsafe fn new(name: impl Into<String>, entry: Entry) -> Self {
        Self {
            name: name.into(),
            entry,
        }
    }
}

impl NativeUnit for ForeignUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> CallShape {
        match self.entry {
            Entry::Streams(_) => CallShape::Streams,
            Entry::Buffers(_) => CallShape::Buffers,
        }
    }

    fn invoke(&self, call: &mut MarshaledCall) -> i32 {
        let [script, conf, keys, data, extra, context] = call.params.as_ptrs();
        match self.entry {
            // SAFETY: the pointers come from `call.params`, which outlives the call;
            // the entry contract was asserted in `ForeignUnit::new`.
            Entry::Streams(entry) => unsafe { entry(script, conf, keys, data, extra, context) },
            Entry::Buffers(entry) => {
                let Some(buffers) = call.buffers.as_mut() else {
                    return MISSING_BUFFERS;
                };
                let (out_len, err_len) = (buffers.output.capacity(), buffers.logs.capacity());
                // SAFETY: as above; each buffer pointer is valid for its capacity.
                unsafe {
                    entry(
                        script,
                        conf,
                        keys,
                        data,
                        extra,
                        context,
                        buffers.output.as_mut_ptr(),
                        out_len,
                        buffers.logs.as_mut_ptr(),
                        err_len,
                    )
                }
            }
        }
    }
}

/// Native units by name
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<dyn NativeUnit>>,
}

impl UnitRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the two probe units
    pub fn with_probes() -> Self {
        Self::new()
            .with(probe::stream_unit())
            .with(probe::buffer_unit())
    }

    /// Add a unit, replacing any unit of the same name
    pub fn with(mut self, unit: impl NativeUnit + 'static) -> Self {
        self.register(Arc::new(unit));
        self
    }

    pub fn register(&mut self, unit: Arc<dyn NativeUnit>) {
        self.units.insert(unit.name().to_string(), unit);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeUnit>> {
        self.units.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
