//! A scriptable stand-in for a native engine
//!
//! The probe is written as a pair of `extern "C"` entry points so it goes
//! through exactly the same FFI path as a real engine. Its scripts are one
//! command per line:
//!
//! | command              | effect                                             |
//! |----------------------|----------------------------------------------------|
//! | `print <arg>`        | write `<arg>` and a newline to the primary output  |
//! | `write <arg>`        | write `<arg>` with no newline                      |
//! | `trace`..`error <t>` | write a marker line to the diagnostic output       |
//! | `fill <n>`           | write `n` bytes of `x` to the primary output       |
//! | `exit <code>`        | stop and return `code`                             |
//! | `sleep <ms>`         | pause for `ms` milliseconds                        |
//! | `abort`              | abort the process                                  |
//! | `hang`               | never return                                       |
//!
//! `<arg>` may name an input field (`DATA`, `KEYS`, `CONF`, `EXTRA`,
//! `CONTEXT`), which is replaced by that field's text.

use std::ffi::{CStr, c_char, c_int};
use std::io::{self, Write};
use std::time::Duration;

use crate::native::{Entry, ForeignUnit};
use crate::types::LogLevel;

/// Registry name of the stream-shaped probe
pub const PROBE: &str = "probe";

/// Registry name of the buffer-shaped probe
pub const PROBE_TOBUF: &str = "probe-tobuf";

/// The probe writing to the standard streams
pub fn stream_unit() -> ForeignUnit {
    // SAFETY: probe_exec only reads its pointers as optional C strings.
    unsafe { ForeignUnit::new(PROBE, Entry::Streams(probe_exec)) }
}

/// The probe writing into output buffers
pub fn buffer_unit() -> ForeignUnit {
    // SAFETY: probe_exec_tobuf writes within the lengths it is given.
    unsafe { ForeignUnit::new(PROBE_TOBUF, Entry::Buffers(probe_exec_tobuf)) }
}

unsafe extern "C" fn probe_exec(
    script: *const c_char,
    conf: *const c_char,
    keys: *const c_char,
    data: *const c_char,
    extra: *const c_char,
    context: *const c_char,
) -> c_int {
    // SAFETY: callers pass null or NUL-terminated strings.
    let fields = unsafe { Fields::read([script, conf, keys, data, extra, context]) };
    run(
        &fields,
        &mut FdWriter(libc::STDOUT_FILENO),
        &mut FdWriter(libc::STDERR_FILENO),
    )
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn probe_exec_tobuf(
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
) -> c_int {
    // SAFETY: callers pass null or NUL-terminated strings, and buffers valid
    // for the given lengths.
    let (fields, mut out, mut err) = unsafe {
        (
            Fields::read([script, conf, keys, data, extra, context]),
            BufWriter::new(stdout_buf, stdout_len),
            BufWriter::new(stderr_buf, stderr_len),
        )
    };
    let status = run(&fields, &mut out, &mut err);
    out.terminate();
    err.terminate();
    status
}

#[derive(Debug, Default)]
struct Fields {
    script: Option<String>,
    conf: Option<String>,
    keys: Option<String>,
    data: Option<String>,
    extra: Option<String>,
    context: Option<String>,
}

impl Fields {
    /// # Safety
    ///
    /// Every pointer must be null or point at a NUL-terminated string.
    unsafe fn read(ptrs: [*const c_char; 6]) -> Self {
        let text = |ptr: *const c_char| {
            (!ptr.is_null())
                // SAFETY: upheld by the caller.
                .then(|| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        };
        Self {
            script: text(ptrs[0]),
            conf: text(ptrs[1]),
            keys: text(ptrs[2]),
            data: text(ptrs[3]),
            extra: text(ptrs[4]),
            context: text(ptrs[5]),
        }
    }

    fn resolve<'a>(&'a self, arg: &'a str) -> &'a str {
        let field = match arg {
            "DATA" => &self.data,
            "KEYS" => &self.keys,
            "CONF" => &self.conf,
            "EXTRA" => &self.extra,
            "CONTEXT" => &self.context,
            _ => return arg,
        };
        field.as_deref().unwrap_or("")
    }
}

fn run(fields: &Fields, out: &mut dyn Write, err: &mut dyn Write) -> c_int {
    let Some(script) = fields.script.as_deref() else {
        let _ = writeln!(err, "{}NULL string as script argument", LogLevel::Error.prefix());
        return 1;
    };
    if script.trim().is_empty() {
        let _ = writeln!(err, "{}Empty string as script argument", LogLevel::Error.prefix());
        return 1;
    }

    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));

        let level = match command {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        };
        if let Some(level) = level {
            let _ = writeln!(err, "{}{}", level.prefix(), fields.resolve(arg));
            continue;
        }

        match command {
            "print" => {
                let _ = writeln!(out, "{}", fields.resolve(arg));
            }
            "write" => {
                let _ = write!(out, "{}", fields.resolve(arg));
            }
            "fill" => {
                let Ok(count) = arg.parse::<usize>() else {
                    let _ = writeln!(err, "{}invalid fill count: {arg}", LogLevel::Error.prefix());
                    return 1;
                };
                let chunk = [b'x'; 4096];
                let mut left = count;
                while left > 0 {
                    let n = left.min(chunk.len());
                    if out.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                    left -= n;
                }
            }
            "exit" => return arg.parse().unwrap_or(1),
            "sleep" => {
                let Ok(millis) = arg.parse::<u64>() else {
                    let _ = writeln!(err, "{}invalid sleep: {arg}", LogLevel::Error.prefix());
                    return 1;
                };
                std::thread::sleep(Duration::from_millis(millis));
            }
            "abort" => std::process::abort(),
            "hang" => loop {
                std::thread::sleep(Duration::from_secs(60));
            },
            _ => {
                let _ = writeln!(err, "{}unknown command: {command}", LogLevel::Error.prefix());
                return 1;
            }
        }
    }
    0
}

/// Unbuffered writes straight to a file descriptor, like C `write(2)`
struct FdWriter(c_int);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid slice for buf.len() bytes.
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes into a fixed C buffer, dropping whatever does not fit
struct BufWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl BufWriter<'_> {
    /// # Safety
    ///
    /// `ptr` must be null or valid for writes of `len` bytes for the
    /// writer's lifetime.
    unsafe fn new(ptr: *mut c_char, len: usize) -> Self {
        let buf: &mut [u8] = if ptr.is_null() {
            Default::default()
        } else {
            // SAFETY: upheld by the caller.
            unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len) }
        };
        Self { buf, pos: 0 }
    }

    /// NUL-terminate if there is room; a full buffer stays unterminated
    fn terminate(&mut self) {
        if self.pos < self.buf.len() {
            self.buf[self.pos] = 0;
        }
    }
}

impl Write for BufWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.buf.len() - self.pos;
        let n = data.len().min(room);
        self.buf[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
        // Report everything as written so callers keep going, like a C engine would.
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
