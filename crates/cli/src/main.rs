use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rtspmux::{AdapterKind, ManagerConfig, StreamManager};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-mux",
    about = "Supervised RTSP camera multiplexer with an HTTP relay"
)]
struct Args {
    /// HTTP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8080")]
    bind: String,

    /// JSON manager configuration, applied before the flags below
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Source adapter: ffmpeg or synthetic
    #[arg(long)]
    adapter: Option<AdapterKind>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    retry_interval_ms: Option<u64>,

    #[arg(long)]
    connection_timeout_ms: Option<u64>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<String>,
}

impl Args {
    fn manager_config(&self) -> Result<ManagerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => ManagerConfig::default(),
        };
        if let Some(adapter) = self.adapter {
            config.adapter = adapter;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.retry_interval_ms {
            config.retry_interval_ms = ms;
        }
        if let Some(ms) = self.connection_timeout_ms {
            config.connection_timeout_ms = ms;
        }
        if let Some(path) = &self.ffmpeg {
            config.ffmpeg_path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("rtsp-mux: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let manager = StreamManager::new(args.manager_config()?)?;
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(bind = %args.bind, "HTTP relay listening, Ctrl-C to stop");

    rtspmux::http::serve(listener, manager, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!("shut down");
    Ok(())
}
