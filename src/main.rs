// src/main.rs - PrePrintService entry point
use clap::{Parser, Subcommand};
use preprint_service::config::{self, Config};
use preprint_service::gcode::analyze_gcode_async;
use preprint_service::jobs::JobRegistry;
use preprint_service::pipeline::{Pipeline, PipelineRequest, DEFAULT_TWEAK_OPTION};
use preprint_service::relay::{ArtifactRelay, HttpRelay, RelayTarget};
use preprint_service::web;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG: &str = "service.toml";

/// Tweak, slice and relay 3D models through external tools.
#[derive(Parser, Debug)]
#[command(name = "preprint-service", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API (default)
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one pipeline and print its summary as JSON
    Run {
        #[arg(long)]
        model: PathBuf,
        /// Slicer profile; omit to skip slicing
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_TWEAK_OPTION)]
        tweak_option: String,
        /// Override the g-code file name
        #[arg(long)]
        output_name: Option<String>,
        /// Relay the artifacts to this server
        #[arg(long)]
        relay_url: Option<String>,
        #[arg(long, requires = "relay_url")]
        api_key: Option<String>,
    },
    /// Print the analysis of a g-code file as JSON
    Analyze { path: PathBuf },
    /// Check whether a remote server answers
    Probe { url: String },
}

fn init_logging(log_file: Option<&Path>) -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_file.is_none())
        .init();
    Ok(())
}

fn load_config(path: &Path) -> Result<Config, BoxError> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        tracing::info!("No '{}' found, using the default configuration", DEFAULT_CONFIG);
        return Ok(Config::default());
    }
    tracing::info!("Loading configuration from: {}", path.display());
    config::load_config(path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", path.display(), e);
        Box::new(e) as BoxError
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let config = load_config(&cli.config)?;
    let relay: Arc<dyn ArtifactRelay> = Arc::new(HttpRelay::new(config.relay.timeout())?);

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(config, relay, port).await,
        Commands::Run {
            model,
            profile,
            tweak_option,
            output_name,
            relay_url,
            api_key,
        } => {
            let pipeline = Pipeline::from_config(&config, JobRegistry::new(), relay);
            let request = PipelineRequest::new(model, &tweak_option)?
                .with_profile(profile)
                .with_output_name(output_name)
                .with_relay(relay_url.map(|url| RelayTarget::new(url, api_key)));
            let outcome = pipeline.run(&request).await;
            println!("{}", serde_json::to_string_pretty(&outcome.summary())?);
            if outcome.is_success() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Commands::Analyze { path } => {
            let analysis = analyze_gcode_async(path).await;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(())
        }
        Commands::Probe { url } => {
            let reachable = relay.check_connection(&url).await;
            println!("{}", serde_json::json!({ "url": url, "reachable": reachable }));
            if reachable {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

async fn serve(config: Config, relay: Arc<dyn ArtifactRelay>, port: Option<u16>) -> Result<(), BoxError> {
    let addr = format!("{}:{}", config.server.host, port.unwrap_or(config.server.port));
    let state = web::api::build_state(config, relay);
    state.files.ensure_dirs().await?;
    if !state.config.tools.tweaker_available() {
        tracing::warn!("The tweaker can't be found, tweaking requests will fail");
    }

    let app = web::api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
