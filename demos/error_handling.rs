//! Example demonstrating how failures are classified.
//!
//! This example shows the envelope produced for:
//! - thrown exceptions and rejected promises
//! - syntax errors
//! - timeouts and caller aborts
//! - failures the script announced as expected
//!
//! Run with: cargo run --example error_handling

use std::time::Duration;

use js_eval_sandbox_rs::prelude::*;

fn describe(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Success { value, .. } => format!("Success: {}", value),
        ExecutionOutcome::Failure {
            error_kind,
            message,
            ..
        } => format!("{}: {}", error_kind, message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let sandbox = JsSandbox::new(SandboxConfig::default())?;

    println!("--- Test 1: Thrown TypeError ---");
    let outcome = sandbox
        .execute(ExecutionRequest::new("null.property"))
        .await;
    println!("{}", describe(&outcome));
    if let Some(stack) = outcome.stack() {
        println!("  Has stack: {} lines", stack.lines().count());
    }
    println!();

    println!("--- Test 2: Rejected promise ---");
    let outcome = sandbox
        .execute(ExecutionRequest::new("await Promise.reject(new RangeError('out of range'))"))
        .await;
    println!("{}", describe(&outcome));
    println!();

    println!("--- Test 3: Syntax error ---");
    let outcome = sandbox
        .execute(ExecutionRequest::new("if (true { 1 }"))
        .await;
    println!("{}", describe(&outcome));
    println!();

    println!("--- Test 4: Timeout ---");
    let outcome = sandbox
        .execute(ExecutionRequest::new("await new Promise(() => {})").with_timeout_ms(100))
        .await;
    println!("{}", describe(&outcome));
    println!(
        "  timed_out: {}, aborted: {}",
        outcome.stats().timed_out,
        outcome.stats().aborted
    );
    println!();

    println!("--- Test 5: Caller abort ---");
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let outcome = sandbox
        .execute_with_cancellation(ExecutionRequest::new("await sandbox.sleep(10_000)"), token)
        .await;
    println!("{}", describe(&outcome));
    println!();

    println!("--- Test 6: Expected failure ---");
    let outcome = sandbox
        .execute(ExecutionRequest::new("JSON.parse('{broken')").expecting_failure())
        .await;
    println!("{}", describe(&outcome));
    println!();

    println!("--- Test 7: Classification table ---");
    let test_cases = [
        ("6 * 7", "Simple expression"),
        ("undefinedVariable", "Reference error"),
        ("const = 1", "Syntax error"),
        ("function f() { f(); } f()", "Stack overflow"),
    ];
    for (code, description) in test_cases {
        let outcome = sandbox.execute(ExecutionRequest::new(code)).await;
        let classification = match outcome.error_kind() {
            None => "Success".to_string(),
            Some(kind) => kind.to_string(),
        };
        println!("  {}: {}", description, classification);
    }

    println!("\n=== Error Handling Example Complete ===");
    Ok(())
}
