use std::sync::Arc;
use tracing::{error, info};
use verse_core::{EngineConfig, SynthesisEngine, WorkerConfig, WorkerRuntime, WorkerSupervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,verse_core=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut speed = 1.0f32;
    let mut words: Vec<String> = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--speed" {
            if let Some(v) = iter.next() {
                speed = v.parse().unwrap_or(1.0);
            }
        } else {
            words.push(arg);
        }
    }
    let text = words.join(" ");
    if text.trim().is_empty() {
        eprintln!("usage: speak [--speed 1.0] <text to synthesize>");
        std::process::exit(2);
    }

    info!(chars = text.chars().count(), speed, "starting synthesis");

    let runtime = WorkerRuntime::from_env()?;
    let supervisor = WorkerSupervisor::new(runtime, WorkerConfig::default());
    let engine = SynthesisEngine::new(Arc::new(supervisor.clone()), EngineConfig::default());

    let result = engine.generate(&text, speed).await;
    supervisor.shutdown().await;

    match result {
        Ok(done) => {
            info!(
                path = %done.path.display(),
                duration_s = done.duration_seconds,
                bytes = done.byte_length,
                device = done.device.as_deref().unwrap_or("unknown"),
                "synthesis complete"
            );
            println!("{}", done.path.display());
            Ok(())
        }
        Err(e) => {
            error!(retryable = e.is_retryable(), "synthesis failed: {e}");
            Err(e.into())
        }
    }
}
