//! Host operations exposed to the isolate.
//!
//! Each op reads the request's [`ExecutionContext`] from the op state.
//! Fallible ops answer with a JSON envelope (`{"ok": ..}` or
//! `{"error": ".."}`) that the bootstrap script unpacks into a value or a
//! thrown error.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use deno_core::{extension, op2, OpState};
use serde_json::{json, Value};

use crate::sandbox::context::{ExecutionContext, HarnessEvent};
use crate::sandbox::io::LogLevel;

/// Longest delay a timer may request, matching the JS timer clamp.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

fn envelope(result: std::result::Result<Value, String>) -> String {
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(message) => json!({ "error": message }),
    }
    .to_string()
}

fn delay_from_ms(delay_ms: f64) -> Duration {
    let ms = if delay_ms.is_finite() {
        delay_ms.clamp(0.0, MAX_DELAY_MS)
    } else {
        0.0
    };
    Duration::from_micros((ms * 1000.0) as u64)
}

#[op2(fast)]
fn op_sandbox_log(state: &mut OpState, #[string] level: &str, #[string] message: &str) {
    let ctx = state.borrow::<ExecutionContext>();
    ctx.log.append(LogLevel::from_console_method(level), message);
}

#[op2(fast)]
fn op_sandbox_report(state: &mut OpState, #[string] payload: &str) {
    let ctx = state.borrow::<ExecutionContext>();
    match serde_json::from_str::<HarnessEvent>(payload) {
        Ok(event) => ctx.record(event),
        Err(e) => {
            tracing::warn!(error = %e, "malformed harness report");
            ctx.log.diagnostic(format!("malformed harness report: {}", e));
        }
    }
}

#[op2(fast)]
fn op_sandbox_cancelled(state: &mut OpState) -> bool {
    state.borrow::<ExecutionContext>().cancellation.is_cancelled()
}

#[op2]
#[string]
fn op_sandbox_settings(state: &mut OpState) -> String {
    state.borrow::<ExecutionContext>().settings_json()
}

/// Resolves `true` after the delay, or `false` if the request is cancelled
/// first.
#[op2(async)]
async fn op_sandbox_sleep(state: Rc<RefCell<OpState>>, delay_ms: f64) -> bool {
    let token = state
        .borrow()
        .borrow::<ExecutionContext>()
        .cancellation
        .clone();
    tokio::select! {
        _ = tokio::time::sleep(delay_from_ms(delay_ms)) => true,
        _ = token.cancelled() => false,
    }
}

#[op2]
#[string]
fn op_sandbox_env_get(state: &mut OpState, #[string] key: &str) -> String {
    let value = state.borrow::<ExecutionContext>().env.get(key);
    json!(value).to_string()
}

#[op2(fast)]
fn op_sandbox_env_set(state: &mut OpState, #[string] key: &str, #[string] value: &str) {
    state.borrow::<ExecutionContext>().env.set(key, value);
}

#[op2(fast)]
fn op_sandbox_env_delete(state: &mut OpState, #[string] key: &str) -> bool {
    state.borrow::<ExecutionContext>().env.remove(key)
}

#[op2]
#[string]
fn op_sandbox_env_keys(state: &mut OpState) -> String {
    json!(state.borrow::<ExecutionContext>().env.keys()).to_string()
}

/// Read a UTF-8 file relative to the request's working directory.
#[op2(async)]
#[string]
async fn op_sandbox_read_text(state: Rc<RefCell<OpState>>, #[string] path: String) -> String {
    let (full_path, token) = {
        let state = state.borrow();
        let ctx = state.borrow::<ExecutionContext>();
        (ctx.cwd.join(&path), ctx.cancellation.clone())
    };

    let result = tokio::select! {
        read = tokio::fs::read_to_string(&full_path) => read
            .map(Value::String)
            .map_err(|e| format!("cannot read {}: {}", full_path.display(), e)),
        _ = token.cancelled() => Err("The operation was aborted".to_string()),
    };
    envelope(result)
}

#[op2]
#[string]
fn op_bridge_materialize(state: &mut OpState, #[string] code: &str) -> String {
    let ctx = state.borrow::<ExecutionContext>();
    let result = ctx
        .bridge
        .materialize(code)
        .map(|module| {
            json!({
                "path": module.path.to_string_lossy(),
                "url": module.specifier.as_str(),
            })
        })
        .map_err(|e| e.message());
    envelope(result)
}

#[op2(fast)]
fn op_bridge_release(state: &mut OpState, #[string] path: &str) -> bool {
    let ctx = state.borrow::<ExecutionContext>();
    ctx.bridge.release(std::path::Path::new(path))
}

/// Loader failures recorded since the last call, as a JSON array.
#[op2]
#[string]
fn op_bridge_take_load_failures(state: &mut OpState) -> String {
    json!(state.borrow::<ExecutionContext>().bridge.take_load_failures()).to_string()
}

extension!(
    sandbox_host,
    ops = [
        op_sandbox_log,
        op_sandbox_report,
        op_sandbox_cancelled,
        op_sandbox_settings,
        op_sandbox_sleep,
        op_sandbox_env_get,
        op_sandbox_env_set,
        op_sandbox_env_delete,
        op_sandbox_env_keys,
        op_sandbox_read_text,
        op_bridge_materialize,
        op_bridge_release,
        op_bridge_take_load_failures,
    ],
    options = {
        context: ExecutionContext,
    },
    state = |state, options| {
        state.put(options.context);
    },
);
