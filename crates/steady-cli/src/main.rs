//! # steady-cli
//!
//! Command-line interface for Steady.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steady_client::RequestExecutor;
use steady_core::error::format_error_with_suggestion;
use steady_core::Config;
use steady_session::SessionContinuityManager;

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub executor: Arc<RequestExecutor>,
    pub sessions: SessionContinuityManager,
}

impl AppContext {
    fn new(config: Config) -> anyhow::Result<Self> {
        let config = config.validated()?;
        let executor = Arc::new(RequestExecutor::from_config(&config)?);
        let sessions = SessionContinuityManager::from_config(&config, executor.clone())
            .map_err(steady_core::Error::from)?;
        Ok(Self {
            config,
            executor,
            sessions,
        })
    }
}

/// Steady - resilient client for rate-limited JSON services
#[derive(Parser)]
#[command(name = "steady")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Load configuration from this file instead of the default locations
    #[arg(short, long, global = true, value_name = "PATH", env = "STEADY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the JSON response
    Query {
        /// Endpoint URL
        url: String,
        /// JSON request body (sends POST when present, GET otherwise)
        #[arg(short, long)]
        data: Option<String>,
        /// Rate-limit the request under this identifier
        #[arg(short, long)]
        key: Option<String>,
        /// Request timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Stream a response, printing events as they arrive
    Stream {
        /// Endpoint URL
        url: String,
        /// JSON request body (sends POST when present, GET otherwise)
        #[arg(short, long)]
        data: Option<String>,
        /// Record the exchange in this session
        #[arg(short, long, value_name = "SESSION_ID")]
        session: Option<String>,
        /// User message to record before streaming (requires --session)
        #[arg(short, long, requires = "session")]
        message: Option<String>,
        /// Print every decoded event as JSON instead of extracted text
        #[arg(long)]
        raw: bool,
    },
    /// Session history management
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print a session's messages
    Show {
        /// Session ID
        id: String,
    },
    /// Delete a session
    Clear {
        /// Session ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for errors and warnings
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<steady_core::Error>() {
            Some(err) => eprintln!("{}", format_error_with_suggestion(err)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    match cli.command {
        Commands::Config { action } => commands::config::handle(action, &config),
        Commands::Query {
            url,
            data,
            key,
            timeout,
        } => {
            let ctx = AppContext::new(config)?;
            commands::query::run(&ctx, &url, data.as_deref(), key, timeout).await
        }
        Commands::Stream {
            url,
            data,
            session,
            message,
            raw,
        } => {
            let ctx = AppContext::new(config)?;
            commands::stream::run(&ctx, &url, data.as_deref(), session, message, raw).await
        }
        Commands::History { action } => {
            let ctx = AppContext::new(config)?;
            commands::history::handle(action, &ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_with_session() {
        let cli = Cli::try_parse_from([
            "steady",
            "stream",
            "http://localhost/q",
            "--session",
            "s1",
            "--message",
            "hello",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Stream { session, message, raw, .. } => {
                assert_eq!(session.as_deref(), Some("s1"));
                assert_eq!(message.as_deref(), Some("hello"));
                assert!(!raw);
            }
            _ => panic!("expected stream command"),
        }
    }

    #[test]
    fn test_message_requires_session() {
        assert!(Cli::try_parse_from(["steady", "stream", "http://localhost/q", "--message", "hi"]).is_err());
    }

    #[test]
    fn test_parse_history_clear() {
        let cli = Cli::try_parse_from(["steady", "history", "clear", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::History {
                action: HistoryAction::Clear { ref id }
            } if id == "abc"
        ));
    }
}
