use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use failover_router::config::{Config, ConfigError};
use failover_router::utils::parse_host_list;
use failover_router::{ClientBuilder, Request, RequestOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "failover-router")]
#[command(about = "Client-side load balancing and leader failover for replicated databases")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send requests through the router and report who served them
    Probe {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 6)]
        requests: usize,
        /// Allow followers to answer reads
        #[arg(long)]
        dirty_read: bool,
        /// Request path
        #[arg(short, long, default_value = "/_admin/status")]
        path: String,
        /// Comma separated hosts replacing the configured ones
        #[arg(long)]
        hosts: Option<String>,
    },
    /// Generate example configuration files
    Config {
        /// Deployment profile (cluster or single)
        #[arg(short, long, default_value = "cluster")]
        profile: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Probe {
            config,
            requests,
            dirty_read,
            path,
            hosts,
        } => probe(config, requests, dirty_read, path, hosts).await,
        Commands::Config { profile, output } => generate_config(profile, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

async fn probe(
    config_path: PathBuf,
    requests: usize,
    dirty_read: bool,
    path: String,
    hosts: Option<String>,
) -> Result<()> {
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);

    if let Some(hosts) = hosts {
        let endpoints = parse_host_list(&hosts).context("Invalid --hosts")?;
        info!("Overriding configured hosts with {} endpoints", endpoints.len());
        config.client.hosts = endpoints.iter().map(ToString::to_string).collect();
    }

    let client = ClientBuilder::from_config(&config)?
        .build()
        .await
        .context("Failed to build client")?;

    let options = if dirty_read {
        RequestOptions::dirty_read()
    } else {
        RequestOptions::default()
    };

    for i in 1..=requests {
        match client.execute_with(Request::get(path.as_str()), options.clone()).await {
            Ok(response) => {
                let served_by = response
                    .served_by
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "{:>3}: {} from {} (server id: {})",
                    i,
                    response.status,
                    served_by,
                    server_id(&response).unwrap_or_else(|| "-".to_string())
                );
            }
            Err(e) => println!("{:>3}: failed: {}", i, e),
        }
    }

    let stats = client.statistics();
    println!();
    println!("Leader: {}", client.router().failover().belief().state);
    println!("Requests: {} ({} dirty reads)", stats.requests, stats.dirty_reads);
    println!("Connect retries: {}", stats.connect_retries);
    println!("Redirects followed: {} (loops: {})", stats.redirects_followed, stats.redirect_loops);
    println!("Failures: {} (timeouts: {})", stats.failures, stats.timeouts);
    println!(
        "Pool: {}/{} open, {} opened, {} reused, {} expired, {} invalidated",
        stats.pool.open_connections,
        stats.pool.capacity,
        stats.pool.opened,
        stats.pool.reused,
        stats.pool.expired,
        stats.pool.invalidated
    );

    client.shutdown().await;
    Ok(())
}

fn server_id(response: &failover_router::Response) -> Option<String> {
    let body: serde_json::Value = response.json().ok()?;
    body.pointer("/serverInfo/serverId")
        .or_else(|| body.get("serverId"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn generate_config(profile: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", profile, output);

    Config::create_example_config(&output, &profile).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your deployment and run:");
    println!("  failover-router probe --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Routing policy: {}", config.routing.policy);
            println!("  Max connections: {}", config.pool.max_connections);
            println!("  Acquire host list: {}", config.client.acquire_host_list);
            println!("  Hosts: {} endpoints", config.client.hosts.len());
            for (i, host) in config.client.hosts.iter().enumerate() {
                println!("    {}: {}", i + 1, host);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("failover-router v{}", env!("CARGO_PKG_VERSION"));
    println!("Client-side load balancing and leader failover for replicated databases");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Round-robin balancing with per-connection affinity");
    println!("  • Leader tracking and redirect following");
    println!("  • Connection TTL and host-list acquisition");
    println!("  • Dirty reads served by followers");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
