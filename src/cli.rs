use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "muximux")]
#[command(author, version, about = "Self-hosted dashboard portal with a content-rewriting reverse proxy")]
pub struct Cli {
    /// Path to config file (falls back to MUXIMUX_CONFIG, then defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the portal server
    Start {
        /// Override the configured bind spec, e.g. `:8080` or `127.0.0.1:9000`
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate (uses default locations if not specified)
        config: Option<PathBuf>,
    },

    /// Generate a bcrypt password hash for `auth.password_hash`
    HashPassword {
        /// Password to hash
        password: String,
    },

    /// Generate a random API key for programmatic access
    GenerateApiKey,

    /// Display version information
    Version,
}
