// physdbtool/src/stage.rs
use anyhow::Result;
use std::future::Future;
use std::time::Instant;
use tracing::{error, info};

/// Runs one named protocol step, logging its outcome and duration.
/// A failure carries the step name on top of its cause.
pub async fn run_step<T, F>(name: &'static str, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!(step = name, "▶ {}", name);
    let started = Instant::now();
    match step.await {
        Ok(value) => {
            info!(
                step = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "✓ {}",
                name
            );
            Ok(value)
        }
        Err(e) => {
            error!(
                step = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "❌ {} failed: {:#}",
                name,
                e
            );
            Err(e.context(format!("Step '{}' failed", name)))
        }
    }
}
