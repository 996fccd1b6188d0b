//! Supervised child process. Launched by `taskroot` with its launch
//! parameters in the environment; exits when stdin closes.

use taskroot_supervisor::{run_component, ComponentRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    run_component(&ComponentRegistry::with_builtins()).await?;
    Ok(())
}
