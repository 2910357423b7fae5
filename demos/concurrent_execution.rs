//! Example of concurrent evaluation sharing one sandbox.
//!
//! Each request gets its own isolate; the sandbox only bounds how many run
//! at once.
//!
//! Run with: cargo run --example concurrent_execution

use std::time::Instant;

use js_eval_sandbox_rs::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Concurrent Execution Example ===\n");

    let config = SandboxConfig::builder().max_concurrent(4).build();
    let sandbox = JsSandbox::new(config)?;

    let tasks = vec![
        (
            "Task 1",
            "Array.from({length: 100}, (_, i) => i ** 2).reduce((a, b) => a + b)",
            "Sum of squares",
        ),
        (
            "Task 2",
            "Array.from({length: 1000}, (_, i) => i).filter(x => x % 3 === 0).length",
            "Count divisible by 3",
        ),
        (
            "Task 3",
            "Array.from({length: 50}, (_, i) => String.fromCharCode(65 + i % 26)).join('')",
            "Generate letters",
        ),
        (
            "Task 4",
            "await new Promise(r => setTimeout(() => r(Math.max(...Array.from({length: 101}, (_, i) => i * (100 - i)))), 50))",
            "Maximum product (delayed)",
        ),
    ];

    println!("Starting {} concurrent tasks...\n", tasks.len());
    let start = Instant::now();

    let handles: Vec<_> = tasks
        .into_iter()
        .map(|(name, code, description)| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                let outcome = sandbox.execute(ExecutionRequest::new(code)).await;
                (name, description, outcome)
            })
        })
        .collect();

    println!("Results:");
    println!("{:-<60}", "");
    for handle in handles {
        match handle.await {
            Ok((name, description, outcome)) => match outcome.value() {
                Some(value) => println!(
                    "{}: {} = {} (took {}ms)",
                    name,
                    description,
                    value,
                    outcome.stats().duration_ms
                ),
                None => println!(
                    "{}: failed with {}",
                    name,
                    outcome.error_message().unwrap_or("unknown error")
                ),
            },
            Err(e) => println!("Join error: {}", e),
        }
    }
    println!("{:-<60}", "");

    println!("\nTotal wall-clock time: {:?}", start.elapsed());
    println!("(Tasks ran concurrently, so total time < sum of individual times)");

    Ok(())
}
