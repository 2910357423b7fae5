//! Example of evaluating ES module sources.
//!
//! Module-syntax input is written to a temporary file in the working
//! directory, imported, and removed again. Set `RUST_LOG=debug` to watch
//! the bridge at work.
//!
//! Run with: cargo run --example module_bridge

use js_eval_sandbox_rs::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = std::env::temp_dir().join(format!("module-bridge-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        dir.join("math.mjs"),
        "export const square = (x) => x * x;\nexport const PI = 3.14159;\n",
    )?;

    let sandbox = JsSandbox::new(SandboxConfig::default())?;

    println!("=== Default export importing a sibling module ===");
    let outcome = sandbox
        .execute(
            ExecutionRequest::new(
                "import { square, PI } from './math.mjs';\nexport default { area: PI * square(2) };",
            )
            .with_working_directory(&dir),
        )
        .await;
    println!("value: {:?}", outcome.value());

    println!("\n=== Named exports ===");
    let outcome = sandbox
        .execute(
            ExecutionRequest::new("export const name = 'bridge';\nexport const ok = true;")
                .with_working_directory(&dir),
        )
        .await;
    println!("value: {:?}", outcome.value());

    println!("\n=== Importing from a script ===");
    let outcome = sandbox
        .execute(
            ExecutionRequest::new(
                "const m = await sandbox.importModule(\"export default [1, 2, 3];\");\nm.default.length",
            )
            .with_working_directory(&dir),
        )
        .await;
    println!("value: {:?}", outcome.value());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
