mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::{build_catalog, run_server};

#[derive(Parser)]
#[command(name = "promcat")]
#[command(about = "Service catalog feeding file-based monitoring discovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Server {
        /// Path to configuration file (optional)
        #[arg(short, long, default_value = "promcat.yaml")]
        config: String,

        /// Develop mode: do not run the expiration sweep in this process
        #[arg(long, default_value_t = false)]
        develop: bool,
    },
    /// Remove expired entries once and exit
    Sweep {
        /// Path to configuration file (optional)
        #[arg(short, long, default_value = "promcat.yaml")]
        config: String,
    },
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(cfg) => cfg,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promcat=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config, develop } => {
            tracing::info!("Starting promcat server with config: {}", config);
            let cfg = load_config(&config);

            if let Err(error) = run_server(cfg, develop).await {
                tracing::error!("Server error: {}", error);
                std::process::exit(1);
            }
        }
        Commands::Sweep { config } => {
            let cfg = load_config(&config);

            let catalog = match build_catalog(&cfg) {
                Ok(catalog) => catalog,
                Err(error) => {
                    tracing::error!("Failed to open catalog: {}", error);
                    std::process::exit(1);
                }
            };

            match catalog.sweep_expired().await {
                Ok(removed) => tracing::info!("Sweep removed {} expired entries", removed),
                Err(error) => {
                    tracing::error!("Sweep failed: {}", error);
                    std::process::exit(1);
                }
            }
        }
    }
}
