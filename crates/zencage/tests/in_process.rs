//! In-process calls with real redirection of this process's stdout/stderr.
//!
//! Everything runs inside a single test so the test harness never writes to
//! fd 1 or fd 2 while a capture is active.

use std::time::Duration;

use zencage::marshal::MarshaledCall;
use zencage::native::PROBE_TOBUF;
use zencage::redirect::{CaptureWatch, Sinks, capture};
use zencage::{
    CallError, CallOutcome, CallRequest, CallShape, Capacities, Config, Harness, IsolationPolicy,
    NativeUnit, Redirect, RedirectError, StdStream, UnitRegistry,
};

/// Device and inode behind a file descriptor
fn identity(fd: i32) -> (u64, u64) {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    assert_eq!(rc, 0, "fstat({fd}) failed");
    (stat.st_dev as u64, stat.st_ino as u64)
}

fn std_identities() -> [(u64, u64); 2] {
    [identity(1), identity(2)]
}

/// Write straight to a descriptor, bypassing Rust's stdout buffering
fn write_fd(fd: i32, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    assert_eq!(n, bytes.len() as isize, "write({fd}) failed");
}

#[derive(Debug)]
struct Panicking;

impl NativeUnit for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn shape(&self) -> CallShape {
        CallShape::Streams
    }

    fn invoke(&self, _call: &mut MarshaledCall) -> i32 {
        write_fd(1, b"before\n");
        panic!("native unit blew up");
    }
}

fn harness_for(unit: &str) -> Harness {
    let config = Config {
        unit: unit.to_string(),
        policy: IsolationPolicy::InProcess,
        ..Config::empty()
    };
    Harness::new(config, UnitRegistry::with_probes().with(Panicking))
}

#[tokio::test]
async fn in_process_calls_restore_std_streams() {
    let before = std_identities();
    let harness = harness_for("probe");

    // Repeated calls leave the streams exactly where they were
    for i in 0..20 {
        let request = CallRequest::new("print DATA\nwarn w\nerror e").with_data(i.to_string());
        let result = harness.run(request).await.expect("in-process call failed");
        assert_eq!(result.output, i.to_string());
        assert_eq!(result.buckets.warning, ["w"]);
        assert_eq!(result.buckets.error, ["e"]);
        assert_eq!(std_identities(), before);
    }

    // Structured output
    let result = harness
        .run(CallRequest::new("print DATA").with_data(r#"{"k":[1,2]}"#))
        .await
        .expect("in-process call failed");
    assert_eq!(result.result, Some(serde_json::json!({"k": [1, 2]})));

    // Buffer-shaped unit
    let result = harness_for(PROBE_TOBUF)
        .run(CallRequest::new("print from buffer\ninfo noted"))
        .await
        .expect("in-process buffer call failed");
    assert_eq!(result.output, "from buffer");
    assert_eq!(result.buckets.info, ["noted"]);
    assert_eq!(std_identities(), before);

    // A panic is a crash that keeps what was written before it, and the
    // streams still come back
    let err = harness_for("panicking")
        .run(CallRequest::new("anything"))
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), Some(CallOutcome::Crashed));
    assert!(err.to_string().ends_with("native unit blew up"));
    assert_eq!(err.partial().unwrap().output_text(), "before\n");
    assert_eq!(std_identities(), before);

    // The same stream cannot be captured twice at once
    let held = Redirect::begin(
        StdStream::Diagnostic,
        tempfile::tempfile().expect("tempfile"),
        64,
    )
    .expect("redirect stderr");
    let second = Redirect::try_begin(
        StdStream::Diagnostic,
        tempfile::tempfile().expect("tempfile"),
        64,
    );
    let captured = held.finish().expect("finish redirect");
    assert!(captured.is_empty());
    assert!(matches!(second, Err(RedirectError::Busy(StdStream::Diagnostic))));
    assert_eq!(std_identities(), before);

    // Concurrent captures take turns and never see each other's bytes
    let captures: Vec<_> = std::thread::scope(|scope| {
        let threads: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|byte| {
                scope.spawn(move || {
                    let captured = capture(
                        &Sinks::Anonymous,
                        Capacities::default(),
                        &CaptureWatch::new(),
                        || {
                            for _ in 0..5 {
                                write_fd(1, &[byte; 16]);
                                std::thread::sleep(Duration::from_millis(5));
                            }
                        },
                    )
                    .expect("capture");
                    (byte, captured)
                })
            })
            .collect();
        threads
            .into_iter()
            .map(|thread| thread.join().expect("capture thread"))
            .collect()
    });
    for (byte, (value, output, logs)) in captures {
        assert!(value.is_ok());
        assert_eq!(output.bytes, vec![byte; 80]);
        assert!(!output.overflowed);
        assert!(logs.is_empty());
    }
    assert_eq!(std_identities(), before);

    // A timed-out call hands the streams back before returning, with what
    // the unit wrote so far; the next call waits for the unit to return
    let err = harness
        .execute(
            CallRequest::new("print early\nsleep 300"),
            IsolationPolicy::InProcess,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(std_identities(), before);
    match &err {
        CallError::Timeout { partial, .. } => assert_eq!(partial.output_text(), "early\n"),
        other => panic!("expected Timeout, got {other:?}"),
    }

    let result = harness
        .run(CallRequest::new("print after timeout"))
        .await
        .expect("in-process call after timeout failed");
    assert_eq!(result.output, "after timeout");
    assert_eq!(std_identities(), before);
}
