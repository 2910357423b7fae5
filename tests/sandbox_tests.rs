//! End-to-end tests for script evaluation.
//!
//! Each test drives a real V8 isolate through the public API and checks the
//! envelope the caller would see.

use std::time::{Duration, Instant};

use js_eval_sandbox_rs::prelude::*;
use serde_json::{json, Value};

/// Helper to create a sandbox with default settings.
fn sandbox() -> JsSandbox {
    JsSandbox::new(SandboxConfig::default()).unwrap()
}

async fn run(source: &str) -> ExecutionOutcome {
    sandbox()
        .execute(ExecutionRequest::new(source).with_timeout_ms(5_000))
        .await
}

fn value_of(outcome: &ExecutionOutcome) -> &Value {
    match outcome {
        ExecutionOutcome::Success { value, .. } => value,
        ExecutionOutcome::Failure { message, .. } => panic!("expected success, got failure: {message}"),
    }
}

#[tokio::test]
async fn test_simple_expression() {
    let outcome = run("1+1").await;
    assert_eq!(value_of(&outcome), &json!(2));
    assert!(!outcome.stats().timed_out);
    assert!(!outcome.stats().aborted);
}

#[tokio::test]
async fn test_sync_throw_is_runtime_failure() {
    let outcome = run("throw new Error('x')").await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
    assert!(outcome.error_message().unwrap().contains('x'));
}

#[tokio::test]
async fn test_top_level_await_with_timer() {
    let outcome = run("await new Promise(r=>setTimeout(()=>r('done'),10))").await;
    assert_eq!(value_of(&outcome), &json!("done"));
    assert!(outcome.logs().iter().any(|l| l.contains("promise resolved")));
}

#[tokio::test]
async fn test_completion_value_of_declarations() {
    let outcome = run("const o={a:1,b:2}; o").await;
    assert_eq!(value_of(&outcome), &json!({"a": 1, "b": 2}));
}

#[tokio::test]
async fn test_never_settling_promise_times_out() {
    let started = Instant::now();
    let outcome = sandbox()
        .execute(ExecutionRequest::new("await new Promise(()=>{})").with_timeout_ms(50))
        .await;
    let elapsed = started.elapsed();

    assert!(!outcome.is_success());
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    assert!(outcome.error_message().unwrap().contains("timeout"));
    assert!(elapsed >= Duration::from_millis(50), "returned after {elapsed:?}");
    assert!(outcome.stats().timed_out);
    assert!(outcome.stats().aborted);
}

#[tokio::test]
async fn test_top_level_return() {
    let outcome = run("const x = 21;\nreturn x * 2;").await;
    assert_eq!(value_of(&outcome), &json!(42));
}

#[tokio::test]
async fn test_bare_return_is_null_without_log_fallback() {
    let outcome = run("console.log(JSON.stringify({a: 1}));\nreturn;").await;
    assert_eq!(value_of(&outcome), &Value::Null);
}

#[tokio::test]
async fn test_object_literal_source() {
    let outcome = run("{a: 1, b: [true, null]}").await;
    assert_eq!(value_of(&outcome), &json!({"a": 1, "b": [true, null]}));
}

#[tokio::test]
async fn test_rejected_promise_is_failure() {
    let outcome = run("await Promise.reject(new Error('nope'))").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
    assert!(outcome.error_message().unwrap().contains("nope"));
    assert!(outcome.logs().iter().any(|l| l.contains("promise rejected")));
}

#[tokio::test]
async fn test_compile_error() {
    let outcome = run("const = 5").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Compile));
    assert!(outcome.error_message().unwrap().contains("SyntaxError"));
}

#[tokio::test]
async fn test_script_only_syntax_error_is_compile_error() {
    let outcome = run("new.target").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Compile));
}

#[tokio::test]
async fn test_syntax_error_thrown_at_runtime_is_runtime_error() {
    let outcome = run("JSON.parse('{')").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
    assert!(outcome.error_message().unwrap().contains("SyntaxError"));
}

#[tokio::test]
async fn test_replaced_builtins_do_not_break_results() {
    let source = "JSON.stringify = () => { throw new Error('no'); };\nObject.keys = () => [];\nArray.from = null;\nglobalThis.Set = null;\n({a: [1, 2], b: {c: 'd'}})";
    let started = Instant::now();
    let outcome = sandbox()
        .execute(ExecutionRequest::new(source).with_timeout_ms(5_000))
        .await;

    assert_eq!(value_of(&outcome), &json!({"a": [1, 2], "b": {"c": "d"}}));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_logs_are_captured_in_order() {
    let outcome = run("console.log('one'); console.warn('two'); console.error('three'); 1").await;
    let logs = outcome.logs();
    let position = |needle: &str| logs.iter().position(|l| l.ends_with(needle)).unwrap();

    assert!(position("[log] one") < position("[warn] two"));
    assert!(position("[warn] two") < position("[error] three"));
}

#[tokio::test]
async fn test_structural_preservation() {
    let source = r#"({
        when: new Date(0),
        tags: new Set([1, 2]),
        lookup: new Map([['a', 1]]),
        bytes: new Uint8Array([1, 2, 3]),
        add: function add(a, b) { return a + b; },
        re: /ab+c/gi,
        big: 10n,
        missing: undefined,
    })"#;

    let outcome = run(source).await;
    assert_eq!(
        value_of(&outcome),
        &json!({
            "when": "1970-01-01T00:00:00.000Z",
            "tags": [1, 2],
            "lookup": {"a": 1},
            "bytes": {"type": "Uint8Array", "length": 3, "preview": "01 02 03", "truncated": false},
            "add": {"type": "function", "name": "add", "arity": 2},
            "re": "/ab+c/gi",
            "big": "10n",
            "missing": null,
        })
    );
}

#[tokio::test]
async fn test_circular_and_deep_values() {
    let outcome = run("const o = {name: 'loop'}; o.self = o; o").await;
    assert_eq!(value_of(&outcome), &json!({"name": "loop", "self": "[Circular]"}));

    let config = SandboxConfig::builder().max_depth(2).build();
    let outcome = JsSandbox::new(config)
        .unwrap()
        .execute(ExecutionRequest::new("({a: {b: {c: 1}}, list: [[1]]})"))
        .await;
    assert_eq!(
        value_of(&outcome),
        &json!({"a": {"b": "[Object]"}, "list": ["[Array]"]})
    );
}

#[tokio::test]
async fn test_buffer_preview_is_bounded() {
    let config = SandboxConfig::builder().buffer_preview_bytes(4).build();
    let outcome = JsSandbox::new(config)
        .unwrap()
        .execute(ExecutionRequest::new("new Uint8Array(100).fill(255)"))
        .await;
    assert_eq!(
        value_of(&outcome),
        &json!({"type": "Uint8Array", "length": 100, "preview": "ff ff ff ff ...", "truncated": true})
    );
}

#[tokio::test]
async fn test_requests_are_isolated() {
    let sandbox = sandbox();
    let first = sandbox
        .execute(ExecutionRequest::new("globalThis.leak = 1; 1"))
        .await;
    let second = sandbox
        .execute(ExecutionRequest::new("typeof leak"))
        .await;
    assert_eq!(value_of(&first), &json!(1));
    assert_eq!(value_of(&second), &json!("undefined"));

    let again = sandbox
        .execute(ExecutionRequest::new("globalThis.leak = 1; 1"))
        .await;
    assert_eq!(value_of(&first), value_of(&again));
}

#[tokio::test]
async fn test_env_overlay_is_per_request() {
    let outcome = sandbox()
        .execute(
            ExecutionRequest::new("process.env.SANDBOX_WRITE_ONLY = 'x'; [process.env.SANDBOX_DEMO_KEY, sandbox.env.SANDBOX_WRITE_ONLY]")
                .with_env("SANDBOX_DEMO_KEY", "v"),
        )
        .await;
    assert_eq!(value_of(&outcome), &json!(["v", "x"]));
    assert!(std::env::var("SANDBOX_WRITE_ONLY").is_err());

    let outcome = run("process.env.SANDBOX_WRITE_ONLY ?? 'unset'").await;
    assert_eq!(value_of(&outcome), &json!("unset"));
}

#[tokio::test]
async fn test_args_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = sandbox()
        .execute(
            ExecutionRequest::new("({ args: sandbox.args, argv: process.argv.slice(2), cwd: process.cwd() })")
                .with_args(["a", "b"])
                .with_working_directory(dir.path()),
        )
        .await;
    assert_eq!(
        value_of(&outcome),
        &json!({
            "args": ["a", "b"],
            "argv": ["a", "b"],
            "cwd": dir.path().to_string_lossy(),
        })
    );
}

#[tokio::test]
async fn test_read_text_file_relative_to_cwd() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();

    let outcome = sandbox()
        .execute(
            ExecutionRequest::new("await sandbox.readTextFile('hello.txt')")
                .with_working_directory(dir.path()),
        )
        .await;
    assert_eq!(value_of(&outcome), &json!("hello"));
}

#[tokio::test]
async fn test_interval_and_clear() {
    let source = "let n = 0;\nawait new Promise(r => { const id = setInterval(() => { n++; if (n === 3) { clearInterval(id); r(n); } }, 5); });";
    let outcome = run(source).await;
    assert_eq!(value_of(&outcome), &json!(3));
}

#[tokio::test]
async fn test_caller_abort() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = sandbox()
        .execute_with_cancellation(
            ExecutionRequest::new("await new Promise(()=>{})").with_timeout_ms(10_000),
            token,
        )
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Aborted));
    assert!(outcome.stats().aborted);
    assert!(!outcome.stats().timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_signal_observes_abort() {
    let token = CancellationToken::new();
    token.cancel();
    let outcome = sandbox()
        .execute_with_cancellation(ExecutionRequest::new("sandbox.signal.aborted"), token)
        .await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Aborted));
}

#[tokio::test]
async fn test_soft_deadline_note() {
    let config = SandboxConfig::builder().soft_deadline_ratio(0.1).build();
    let outcome = JsSandbox::new(config)
        .unwrap()
        .execute(
            ExecutionRequest::new("await new Promise(r => setTimeout(r, 400));\n'ok'")
                .with_timeout_ms(2_000),
        )
        .await;
    assert_eq!(value_of(&outcome), &json!("ok"));
    assert!(outcome.logs().iter().any(|l| l.contains("soft deadline")));
}

#[tokio::test]
async fn test_cpu_bound_loop_is_terminated() {
    let started = Instant::now();
    let outcome = sandbox()
        .execute(ExecutionRequest::new("while (true) {}").with_timeout_ms(100))
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_heap_limit() {
    let config = SandboxConfig::builder()
        .max_heap_size(16 * 1024 * 1024)
        .build();
    let outcome = JsSandbox::new(config)
        .unwrap()
        .execute(
            ExecutionRequest::new("const keep = []; while (true) { keep.push(new Array(100000).fill('x')); }")
                .with_timeout_ms(30_000),
        )
        .await;

    assert!(!outcome.is_success());
    assert!(
        matches!(outcome.error_kind(), Some(ErrorKind::MemoryLimit) | Some(ErrorKind::Runtime)),
        "expected heap limit failure, got {:?}",
        outcome.error_kind()
    );
}

#[tokio::test]
async fn test_expected_failure_heuristic() {
    let source = "console.log('this call is expected to fail'); throw new Error('bad input')";
    let outcome = run(source).await;
    assert_eq!(value_of(&outcome), &json!("bad input"));

    let strict = SandboxConfig::builder()
        .expected_failure_heuristic(false)
        .build();
    let outcome = JsSandbox::new(strict)
        .unwrap()
        .execute(ExecutionRequest::new(source))
        .await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
}

#[tokio::test]
async fn test_expect_failure_flag() {
    let outcome = sandbox()
        .execute(ExecutionRequest::new("null.x").expecting_failure())
        .await;
    let message = value_of(&outcome).as_str().unwrap();
    assert!(message.contains("null"), "unexpected message: {message}");
}

#[tokio::test]
async fn test_explicit_result_channel() {
    let outcome = run("sandbox.setResult({rows: 3, at: new Date(0)});").await;
    assert_eq!(
        value_of(&outcome),
        &json!({"rows": 3, "at": "1970-01-01T00:00:00.000Z"})
    );
}

#[tokio::test]
async fn test_log_scrape_fallback() {
    let source = "console.log(JSON.stringify({count: 3})); console.log('done');";
    let outcome = run(source).await;
    assert_eq!(value_of(&outcome), &json!({"count": 3}));

    let config = SandboxConfig::builder().log_value_fallback(false).build();
    let outcome = JsSandbox::new(config)
        .unwrap()
        .execute(ExecutionRequest::new(source))
        .await;
    assert_eq!(value_of(&outcome), &Value::Null);
}

#[tokio::test]
async fn test_detached_rejection_is_logged() {
    let outcome = run("Promise.reject(new Error('detached failure')); 7").await;
    assert_eq!(value_of(&outcome), &json!(7));
    assert!(outcome.logs().iter().any(|l| l.contains("detached failure")));
}

#[tokio::test]
async fn test_invalid_request() {
    let outcome = sandbox()
        .execute(ExecutionRequest::new("1").with_timeout_ms(0))
        .await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Internal));
}

#[tokio::test]
async fn test_concurrent_requests_share_permits() {
    let config = SandboxConfig::builder().max_concurrent(2).build();
    let sandbox = JsSandbox::new(config).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox
                    .execute(ExecutionRequest::new(format!("await new Promise(r => setTimeout(() => r({i}), 20))")))
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap();
        assert_eq!(value_of(&outcome), &json!(i));
    }
}

#[tokio::test]
async fn test_envelope_serialization() {
    let outcome = run("'hi'").await;
    let wire = serde_json::to_value(&outcome).unwrap();
    assert_eq!(wire["success"], json!(true));
    assert_eq!(wire["value"], json!("hi"));
    assert!(wire["stats"]["durationMs"].is_u64());
    assert!(wire.get("errorKind").is_none());

    let outcome = run("throw new TypeError('bad')").await;
    let wire = serde_json::to_value(&outcome).unwrap();
    assert_eq!(wire["success"], json!(false));
    assert_eq!(wire["errorKind"], json!("RuntimeError"));
    assert!(wire["error"].as_str().unwrap().contains("TypeError: bad"));
}
