//! Basic example of evaluating JavaScript in the sandbox.
//!
//! Run with: cargo run --example basic_execution

use js_eval_sandbox_rs::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let config = SandboxConfig::builder()
        .max_heap_size(32 * 1024 * 1024) // 32MB
        .build();

    println!("Creating sandbox with config: {:?}", config);
    let sandbox = JsSandbox::new(config)?;

    println!("\n=== Test 1: Simple expression ===");
    let outcome = sandbox.execute(ExecutionRequest::new("1 + 1")).await;
    println!("value: {:?}", outcome.value());
    println!("duration: {}ms", outcome.stats().duration_ms);

    println!("\n=== Test 2: Top-level return and logs ===");
    let code = r#"
for (let i = 0; i < 3; i++) {
    console.log(`Count: ${i}`);
}
return { total: 3 };
"#;
    let outcome = sandbox.execute(ExecutionRequest::new(code)).await;
    for line in outcome.logs() {
        println!("log: {}", line);
    }
    println!("value: {:?}", outcome.value());

    println!("\n=== Test 3: Awaiting a timer ===");
    let outcome = sandbox
        .execute(
            ExecutionRequest::new("await new Promise(r => setTimeout(() => r('done'), 10))")
                .with_timeout_ms(1_000),
        )
        .await;
    println!("value: {:?}", outcome.value());

    println!("\n=== Test 4: Full envelope ===");
    let outcome = sandbox
        .execute(ExecutionRequest::new("({ when: new Date(0), tags: new Set(['a', 'b']) })"))
        .await;
    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize outcome: {}", e),
    }

    Ok(())
}
