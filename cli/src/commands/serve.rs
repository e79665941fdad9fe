use anyhow::Result;
use pictor_core::OutputStore;
use pictor_daemon::{AppState, Generator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub async fn execute(host: Option<String>, port: Option<u16>, cpu: bool) -> Result<()> {
    let config = super::load_config(cpu)?;
    let host = host.unwrap_or_else(|| config.daemon.host.clone());
    let port = port.unwrap_or(config.daemon.port);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    println!("Configuring {}...", config.model.base_model);
    let pipeline = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || pictor_runtime_diffusion::configure(&config)).await??
    };
    println!(
        "Pipeline ready ({:?}, {:?}, optimizations: {:?}, fine-tune overlay: {})",
        pipeline.config.device,
        pipeline.config.precision,
        pipeline.applied,
        if pipeline.overlay_applied { "yes" } else { "no" }
    );

    let store = Arc::new(OutputStore::new(config.outputs.directory.clone()));
    let timeout = Duration::from_secs(config.daemon.request_timeout_secs);
    let generator = Generator::from_pipeline(&pipeline, store, timeout);

    println!("Listening on http://{}", addr);
    println!("\nAPI endpoints:");
    println!("  GET  /health              - Health check");
    println!("  POST /generate            - Generate an image (JSON prompt, negative_prompt)");
    println!("  GET  /generate            - Generate an image (query parameters)");
    println!("  GET  /history             - List generated images, newest first");
    println!("  GET  /outputs/<file>      - Fetch a generated image");
    println!("\nPress Ctrl+C to stop.\n");

    pictor_daemon::run_server(addr, AppState::new(generator)).await?;

    Ok(())
}
