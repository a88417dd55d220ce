//! Scoped capture of the process-wide standard streams
//!
//! Native units write straight to file descriptors 1 and 2. A [`Redirect`]
//! points one of those descriptors at a private sink file for the lifetime
//! of the guard and puts the original descriptor back when it is finished or
//! dropped, including during unwinding. A [`CaptureWatch`] lets a caller
//! that stops waiting on a capture put both streams back from its own
//! thread.
//!
//! Each stream has a process-wide lock. A second redirection of the same
//! stream waits for the first ([`Redirect::begin`]) or is refused
//! ([`Redirect::try_begin`]); it is never interleaved.

use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::Capacities;

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());
static DIAGNOSTIC_LOCK: Mutex<()> = Mutex::new(());

/// Errors that occur while moving a standard stream around
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("{0} is already being captured")]
    Busy(StdStream),

    #[error("capture of {0} was abandoned before it started")]
    Abandoned(StdStream),

    #[error("failed to duplicate {stream}: {source}")]
    Duplicate {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("failed to point {stream} at its capture sink: {source}")]
    Redirect {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("failed to restore {stream}: {source}")]
    Restore {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("failed to open capture sink {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read captured {stream}: {source}")]
    Read {
        stream: StdStream,
        #[source]
        source: io::Error,
    },
}

/// One of the two process-wide output streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    /// Primary output (fd 1)
    Output,

    /// Diagnostic output (fd 2)
    Diagnostic,
}

impl StdStream {
    /// The file descriptor this stream lives on
    pub fn fd(self) -> RawFd {
        match self {
            StdStream::Output => libc::STDOUT_FILENO,
            StdStream::Diagnostic => libc::STDERR_FILENO,
        }
    }

    fn lock(self) -> &'static Mutex<()> {
        match self {
            StdStream::Output => &OUTPUT_LOCK,
            StdStream::Diagnostic => &DIAGNOSTIC_LOCK,
        }
    }

    fn capacity(self, capacities: Capacities) -> usize {
        match self {
            StdStream::Output => capacities.output,
            StdStream::Diagnostic => capacities.logs,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdStream::Output => f.write_str("stdout"),
            StdStream::Diagnostic => f.write_str("stderr"),
        }
    }
}

/// Bytes captured from one stream (or buffer) during one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedStream {
    /// At most `capacity` bytes
    pub bytes: Vec<u8>,

    /// More than `capacity` bytes were written
    pub overflowed: bool,
}

impl CapturedStream {
    pub fn new(bytes: Vec<u8>, overflowed: bool) -> Self {
        Self { bytes, overflowed }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view of the bytes
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Append `other`, keeping the result within `capacity`
    pub fn append(&mut self, other: CapturedStream, capacity: usize) {
        self.overflowed |= other.overflowed;
        let room = capacity.saturating_sub(self.bytes.len());
        if other.bytes.len() > room {
            self.overflowed = true;
        }
        self.bytes
            .extend_from_slice(&other.bytes[..other.bytes.len().min(room)]);
    }
}

/// Where captured bytes are spooled while a call runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sinks {
    /// Unnamed temporary files, gone once the capture is read
    Anonymous,

    /// Named files, readable by another process if the call never returns
    Files { output: PathBuf, logs: PathBuf },
}

impl Sinks {
    /// Open (or create and truncate) the sink for `stream`
    pub fn open(&self, stream: StdStream) -> Result<File, RedirectError> {
        match self {
            Sinks::Anonymous => tempfile::tempfile().map_err(|source| RedirectError::Sink {
                path: std::env::temp_dir(),
                source,
            }),
            Sinks::Files { output, logs } => {
                let path = match stream {
                    StdStream::Output => output,
                    StdStream::Diagnostic => logs,
                };
                File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|source| RedirectError::Sink {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

/// An active redirection of one standard stream into a sink file.
///
/// While this value lives the stream's lock is held, and until it is
/// finished, dropped or [`Restore::restore`]d the stream's descriptor points
/// at the sink. [`finish`](Self::finish) restores the stream and returns what
/// was written; dropping it restores the stream and throws the capture away.
#[derive(Debug)]
pub struct Redirect {
    active: Restore,
    _guard: MutexGuard<'static, ()>,
}

/// A shareable handle on an active redirection.
///
/// Lets another thread put the stream back and look at the sink while the
/// owning [`Redirect`] is still in use. Restoring is idempotent; whichever
/// side gets there first does it.
#[derive(Debug, Clone)]
pub struct Restore {
    inner: Arc<Engaged>,
}

#[derive(Debug)]
struct Engaged {
    stream: StdStream,
    capacity: usize,
    sink: File,
    saved: Mutex<Option<OwnedFd>>,
}

impl Redirect {
    /// Redirect `stream` into `sink`, waiting for any other redirection of
    /// the same stream to finish first
    pub fn begin(stream: StdStream, sink: File, capacity: usize) -> Result<Self, RedirectError> {
        Self::engage(stream, sink, capacity, wait_for(stream))
    }

    /// Like [`begin`](Self::begin) but fails with [`RedirectError::Busy`]
    /// instead of waiting
    pub fn try_begin(
        stream: StdStream,
        sink: File,
        capacity: usize,
    ) -> Result<Self, RedirectError> {
        let guard = match stream.lock().try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(RedirectError::Busy(stream)),
        };
        Self::engage(stream, sink, capacity, guard)
    }

    fn engage(
        stream: StdStream,
        sink: File,
        capacity: usize,
        guard: MutexGuard<'static, ()>,
    ) -> Result<Self, RedirectError> {
        flush_stdio(stream);

        let saved = dup_cloexec(stream.fd())
            .map_err(|source| RedirectError::Duplicate { stream, source })?;

        if let Err(source) = dup2(sink.as_raw_fd(), stream.fd()) {
            // A failed dup2 should leave the mapping alone, but put it back anyway.
            let _ = dup2(saved.as_raw_fd(), stream.fd());
            return Err(RedirectError::Redirect { stream, source });
        }

        Ok(Self {
            active: Restore {
                inner: Arc::new(Engaged {
                    stream,
                    capacity,
                    sink,
                    saved: Mutex::new(Some(saved)),
                }),
            },
            _guard: guard,
        })
    }

    pub fn stream(&self) -> StdStream {
        self.active.inner.stream
    }

    /// A handle that can restore this stream from another thread
    pub fn handle(&self) -> Restore {
        self.active.clone()
    }

    /// Restore the stream and return everything written to it meanwhile
    pub fn finish(self) -> Result<CapturedStream, RedirectError> {
        let restored = self.active.restore();
        let captured = self.active.snapshot();
        restored?;
        captured
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        if let Err(e) = self.active.restore() {
            warn!(stream = %self.active.inner.stream, "{e}");
        }
    }
}

impl Restore {
    pub fn stream(&self) -> StdStream {
        self.inner.stream
    }

    /// Point the stream back at what it was before the redirection.
    ///
    /// Does nothing if it was already restored.
    pub fn restore(&self) -> Result<(), RedirectError> {
        let engaged = &self.inner;
        let mut saved = engaged.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(fd) = saved.take() else {
            return Ok(());
        };
        flush_stdio(engaged.stream);
        dup2(fd.as_raw_fd(), engaged.stream.fd()).map_err(|source| RedirectError::Restore {
            stream: engaged.stream,
            source,
        })
    }

    /// Everything in the sink so far, capped at the stream's capacity
    pub fn snapshot(&self) -> Result<CapturedStream, RedirectError> {
        read_capped(&self.inner.sink, self.inner.capacity).map_err(|source| {
            RedirectError::Read {
                stream: self.inner.stream,
                source,
            }
        })
    }
}

/// Restore handles of an in-flight [`capture`], for a caller that may stop
/// waiting on it.
///
/// Once [`abandon`](Self::abandon) has run, the capture it watches can no
/// longer redirect anything; streams it already redirected are restored.
#[derive(Debug, Clone, Default)]
pub struct CaptureWatch {
    state: Arc<Mutex<Watched>>,
}

#[derive(Debug, Default)]
struct Watched {
    abandoned: bool,
    active: Vec<Restore>,
}

impl CaptureWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore every stream the capture redirected and return what its
    /// sinks hold so far, as `(output, logs)`.
    ///
    /// The capture itself keeps running; whatever it writes from now on
    /// goes to the restored streams.
    pub fn abandon(&self) -> Result<(CapturedStream, CapturedStream), RedirectError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.abandoned = true;

        let mut failure = None;
        for active in state.active.iter().rev() {
            if let Err(e) = active.restore() {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut output = CapturedStream::default();
        let mut logs = CapturedStream::default();
        for active in &state.active {
            match active.stream() {
                StdStream::Output => output = active.snapshot()?,
                StdStream::Diagnostic => logs = active.snapshot()?,
            }
        }
        Ok((output, logs))
    }

    /// Wait for `stream`, then redirect it unless the watch was abandoned
    /// in the meantime
    fn begin(
        &self,
        stream: StdStream,
        sink: File,
        capacity: usize,
    ) -> Result<Redirect, RedirectError> {
        let guard = wait_for(stream);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.abandoned {
            return Err(RedirectError::Abandoned(stream));
        }
        let redirect = Redirect::engage(stream, sink, capacity, guard)?;
        state.active.push(redirect.handle());
        Ok(redirect)
    }
}

/// Run `call` with both standard streams captured into `sinks`.
///
/// The primary stream is always acquired before the diagnostic one, so
/// concurrent captures cannot deadlock on each other. Both streams are
/// restored and read back before this returns, whatever `call` does; a
/// panic in `call` is caught and handed back in place of its value.
pub fn capture<R>(
    sinks: &Sinks,
    capacities: Capacities,
    watch: &CaptureWatch,
    call: impl FnOnce() -> R,
) -> Result<(thread::Result<R>, CapturedStream, CapturedStream), RedirectError> {
    let output = watch.begin(
        StdStream::Output,
        sinks.open(StdStream::Output)?,
        StdStream::Output.capacity(capacities),
    )?;
    let logs = watch.begin(
        StdStream::Diagnostic,
        sinks.open(StdStream::Diagnostic)?,
        StdStream::Diagnostic.capacity(capacities),
    )?;

    let value = panic::catch_unwind(AssertUnwindSafe(call));

    let logs = logs.finish();
    let output = output.finish();
    Ok((value, output?, logs?))
}

/// Read a sink file left behind by another process.
///
/// A missing file yields an empty capture.
pub fn read_sink_file(path: &Path, capacity: usize) -> io::Result<CapturedStream> {
    match File::open(path) {
        Ok(file) => read_capped(&file, capacity),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CapturedStream::default()),
        Err(e) => Err(e),
    }
}

/// Read at most `capacity + 1` bytes from the start of `sink`.
///
/// Positional reads leave the file offset alone, so a sink that is still
/// some descriptor's write target can be read without disturbing it.
fn read_capped(sink: &File, capacity: usize) -> io::Result<CapturedStream> {
    let limit = capacity.saturating_add(1);
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 8192];
    while bytes.len() < limit {
        let want = (limit - bytes.len()).min(chunk.len());
        match sink.read_at(&mut chunk[..want], bytes.len() as u64) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let overflowed = bytes.len() > capacity;
    bytes.truncate(capacity);
    Ok(CapturedStream { bytes, overflowed })
}

// Restoration lives in Drop, so a poisoned lock still guards a sane mapping.
fn wait_for(stream: StdStream) -> MutexGuard<'static, ()> {
    stream
        .lock()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn flush_stdio(stream: StdStream) {
    let _ = match stream {
        StdStream::Output => io::stdout().flush(),
        StdStream::Diagnostic => io::stderr().flush(),
    };
    // SAFETY: fflush(NULL) flushes every open C stdio output stream.
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}

pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC only reads `fd` and returns a fresh descriptor.
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: new_fd was just returned by fcntl and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    loop {
        // SAFETY: dup2 does not touch memory; both descriptors are plain integers.
        if unsafe { libc::dup2(src, dst) } >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
