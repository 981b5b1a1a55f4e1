mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use muximux::config;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing. Respect RUST_LOG env var; otherwise use defaults
    // based on the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "muximux=trace,tower_http=debug".to_string()
        } else {
            "muximux=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&env_filter))
        .init();

    match cli.command {
        Commands::Start { listen } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(cli.config.as_deref(), listen))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::HashPassword { password } => {
            let hash = muximux::server::auth::hash_password(&password)?;
            println!("{hash}");
            Ok(())
        }
        Commands::GenerateApiKey => {
            println!("{}", muximux::server::auth::generate_api_key());
            Ok(())
        }
        Commands::Version => {
            println!("muximux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(
    config_path: Option<&Path>,
    listen: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut config, path) = config::load_or_default(config_path)?;

    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    tracing::info!("starting muximux");
    tracing::info!(
        listen = %config.server.listen,
        apps = config.apps.len(),
        "configuration loaded"
    );

    muximux::server::start(config, path).await?;
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let config = config::load(p)?;

            println!("Configuration is valid");
            println!("  Listen: {}", config.server.listen);
            println!("  Title: {}", config.server.title);
            println!("  Auth method: {:?}", config.auth.method);
            println!("  Groups: {}", config.groups.len());
            println!("  Apps: {}", config.apps.len());
            let proxied = config
                .apps
                .iter()
                .filter(|a| a.enabled && a.proxy)
                .count();
            println!("  Proxied apps: {proxied}");
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Listen: {}", config.server.listen);
            println!("  Title: {}", config.server.title);
        }
    }

    Ok(())
}
