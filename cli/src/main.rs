mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pictor")]
#[command(author, version, about = "Generate images with Stable Diffusion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the image generation server
    Serve {
        /// Host to bind to (default from config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default from config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// Generate one image into the outputs directory
    Generate {
        /// Text prompt, supports (emphasis)+, (de-emphasis)- and (text)1.3 weights
        prompt: String,

        /// What the image should not contain
        #[arg(short, long, default_value = "")]
        negative_prompt: String,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// Caption and resize training images, writing metadata.jsonl
    PrepareDataset {
        /// Directory with the raw images (default from config)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Output directory (default: <source>/processed)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// View or set configuration
    Config {
        /// Config key (e.g., "daemon.port", "model.base_model")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, cpu } => {
            commands::serve::execute(host, port, cpu).await?;
        }
        Commands::Generate {
            prompt,
            negative_prompt,
            cpu,
        } => {
            commands::generate::execute(&prompt, &negative_prompt, cpu).await?;
        }
        Commands::PrepareDataset {
            source,
            output,
            cpu,
        } => {
            commands::prepare::execute(source, output, cpu).await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref())?;
        }
    }

    Ok(())
}
