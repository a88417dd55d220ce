use std::time::{Duration, Instant};

use serde_json::json;
use zencage::marshal::MarshalError;
use zencage::native::{PROBE, PROBE_TOBUF};
use zencage::{
    CallError, CallOutcome, CallRequest, Capacities, Harness, IsolationPolicy, OverflowPolicy,
    StdStream, TimeoutStrategy, UnitRegistry,
};

use super::test_config;

const SIGABRT: i32 = 6;

fn harness() -> Harness {
    Harness::new(test_config(), UnitRegistry::with_probes())
}

async fn run(harness: &Harness, request: CallRequest) -> Result<zencage::CallResult, CallError> {
    harness
        .execute(request, IsolationPolicy::Process, Some(Duration::from_secs(20)))
        .await
}

#[tokio::test]
async fn test_hello_world() {
    let result = run(&harness(), CallRequest::new("print Hello world"))
        .await
        .expect("call failed");

    assert!(result.is_success());
    assert_eq!(result.outcome(), CallOutcome::Completed);
    assert_eq!(result.output, "Hello world");
    assert!(result.result.is_none());
    assert!(result.buckets.is_empty());
}

#[tokio::test]
async fn test_data_is_passed_through() {
    let request = CallRequest::new("print DATA").with_data("3");
    let result = run(&harness(), request).await.expect("call failed");

    assert_eq!(result.output, "3");
    assert!(result.result.is_none());
}

#[tokio::test]
async fn test_structured_output() {
    let request = CallRequest::new("print DATA").with_data(r#"{"a":1}"#);
    let result = run(&harness(), request).await.expect("call failed");

    assert_eq!(result.result, Some(json!({"a": 1})));
}

#[tokio::test]
async fn test_log_levels_are_bucketed() {
    let script = "trace t1\ndebug d1\ninfo i1\nwarn w1\nerror e1\nprint done";
    let result = run(&harness(), CallRequest::new(script))
        .await
        .expect("call failed");

    assert_eq!(result.output, "done");
    assert_eq!(result.buckets.trace, ["t1"]);
    assert_eq!(result.buckets.debug, ["d1"]);
    assert_eq!(result.buckets.info, ["i1"]);
    assert_eq!(result.buckets.warning, ["w1"]);
    assert_eq!(result.buckets.error, ["e1"]);
    assert!(result.buckets.unclassified.is_empty());
}

#[tokio::test]
async fn test_verbosity_and_seed_reach_conf() {
    let request = CallRequest::new("print CONF")
        .with_verbosity(2)
        .with_seed(vec![0xab, 0x01]);
    let result = run(&harness(), request).await.expect("call failed");

    assert_eq!(result.output, r#"debug=2,rngseed="hex:ab01""#);
}

#[tokio::test]
async fn test_nonzero_status_is_completed_not_failed() {
    let result = run(&harness(), CallRequest::new("error bad input\nexit 3"))
        .await
        .expect("call failed");

    assert_eq!(result.status, 3);
    assert!(!result.is_success());
    assert_eq!(result.buckets.error, ["bad input"]);
}

#[tokio::test]
async fn test_abort_is_crash_with_partial_output() {
    let harness = harness();
    let err = run(&harness, CallRequest::new("print before\nwarn going down\nabort"))
        .await
        .unwrap_err();

    assert_eq!(err.outcome(), Some(CallOutcome::Crashed));
    match &err {
        CallError::Crash {
            signal, partial, ..
        } => {
            assert_eq!(*signal, Some(SIGABRT));
            assert_eq!(partial.output_text(), "before\n");
            assert_eq!(partial.logs_text(), "[W] going down\n");
        }
        other => panic!("expected Crash, got {other:?}"),
    }

    // The harness is still usable after a crash
    let result = run(&harness, CallRequest::new("print after"))
        .await
        .expect("call after crash failed");
    assert_eq!(result.output, "after");
}

#[tokio::test]
async fn test_hang_times_out_and_is_killed() {
    let mut config = test_config();
    config.on_timeout = TimeoutStrategy::Kill;
    let harness = Harness::new(config, UnitRegistry::with_probes());

    let started = Instant::now();
    let err = harness
        .execute(
            CallRequest::new("print started\nhang"),
            IsolationPolicy::Process,
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(err.outcome(), Some(CallOutcome::TimedOut));
    match &err {
        CallError::Timeout { after, partial } => {
            assert_eq!(*after, Duration::from_millis(500));
            assert_eq!(partial.output_text(), "started\n");
        }
        other => panic!("expected Timeout, got {other:?}"),
    }

    let result = run(&harness, CallRequest::new("print responsive"))
        .await
        .expect("call after timeout failed");
    assert_eq!(result.output, "responsive");
}

#[tokio::test]
async fn test_slow_call_times_out_and_is_abandoned() {
    let harness = harness();
    assert_eq!(harness.config().on_timeout, TimeoutStrategy::Abandon);

    let err = harness
        .execute(
            CallRequest::new("sleep 2000\nprint late"),
            IsolationPolicy::Process,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { .. }));

    let result = run(&harness, CallRequest::new("print responsive"))
        .await
        .expect("call after timeout failed");
    assert_eq!(result.output, "responsive");
}

#[tokio::test]
async fn test_concurrent_calls_are_scoped() {
    let harness = harness();
    let calls = (0..4).map(|i| {
        let harness = harness.clone();
        tokio::spawn(async move {
            let request = CallRequest::new("print DATA\nwarn KEYS")
                .with_data(format!("call-{i}"))
                .with_keys(format!("key-{i}"));
            (i, run(&harness, request).await)
        })
    });

    for call in calls.collect::<Vec<_>>() {
        let (i, result) = call.await.expect("task panicked");
        let result = result.expect("call failed");
        assert_eq!(result.output, format!("call-{i}"));
        assert_eq!(result.buckets.warning, [format!("key-{i}")]);
    }
}

fn buffer_harness(overflow: OverflowPolicy) -> Harness {
    let mut config = test_config();
    config.unit = PROBE_TOBUF.to_string();
    config.overflow = overflow;
    config.capacities = Capacities::new(16, 64);
    Harness::new(config, UnitRegistry::with_probes())
}

#[tokio::test]
async fn test_buffer_unit_output() {
    let harness = buffer_harness(OverflowPolicy::Truncate);
    let result = run(&harness, CallRequest::new("print DATA\ninfo ok").with_data("[1,2]"))
        .await
        .expect("call failed");

    assert_eq!(result.result, Some(json!([1, 2])));
    assert_eq!(result.buckets.info, ["ok"]);
    assert!(!result.truncated.any());
}

#[tokio::test]
async fn test_buffer_overflow_truncates() {
    let harness = buffer_harness(OverflowPolicy::Truncate);
    let result = run(&harness, CallRequest::new("fill 100"))
        .await
        .expect("call failed");

    assert_eq!(result.output, "x".repeat(16));
    assert!(result.truncated.output);
    assert!(!result.truncated.logs);
}

#[tokio::test]
async fn test_buffer_overflow_rejects() {
    let harness = buffer_harness(OverflowPolicy::Reject);
    let err = run(&harness, CallRequest::new("fill 100")).await.unwrap_err();

    match err {
        CallError::Marshal(MarshalError::Overflow { stream, capacity }) => {
            assert_eq!(stream, StdStream::Output);
            assert_eq!(capacity, 16);
        }
        other => panic!("expected Overflow, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_overflow_truncates() {
    let mut config = test_config();
    config.capacities = Capacities::new(1024, 1024);
    let harness = Harness::new(config, UnitRegistry::with_probes());

    let result = run(&harness, CallRequest::new("fill 5000"))
        .await
        .expect("call failed");
    assert_eq!(result.output.len(), 1024);
    assert!(result.truncated.output);
}

#[tokio::test]
async fn test_unknown_unit() {
    let mut config = test_config();
    config.unit = "zencode".to_string();
    let harness = Harness::new(config, UnitRegistry::with_probes());

    let err = run(&harness, CallRequest::new("print x")).await.unwrap_err();
    assert!(matches!(err, CallError::UnknownUnit(ref name) if name == "zencode"));
    assert_eq!(err.outcome(), None);
}

#[tokio::test]
async fn test_marshal_error_fails_fast() {
    let err = run(&harness(), CallRequest::new("print x").with_verbosity(4))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Marshal(MarshalError::Verbosity(4))));
}

#[tokio::test]
async fn test_run_uses_configured_policy() {
    let harness = harness();
    assert_eq!(harness.config().unit, PROBE);
    let result = harness
        .run(CallRequest::new("print via run"))
        .await
        .expect("call failed");
    assert_eq!(result.output, "via run");
}
