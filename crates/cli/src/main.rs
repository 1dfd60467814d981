//! RouteCodex CLI — the main entry point.
//!
//! Commands:
//! - `start`       — Run the proxy (foreground, or daemon-supervisor mode)
//! - `stop`        — Stop a running proxy (stop-intent + graceful shutdown)
//! - `status`      — Show server and target health
//! - `completions` — Generate shell completions
//! - `version`     — Show detailed version info
//!
//! Exit codes: 0 normal stop, 1 operational failure, 2 unknown subcommand
//! or bad usage (clap's default).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

mod commands;
mod supervisor;

#[derive(Parser)]
#[command(
    name = "routecodex",
    about = "RouteCodex — local LLM proxy: OpenAI/Anthropic front door, health-aware routing, OAuth token daemon.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Start {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Explicit config file path
        #[arg(short, long)]
        config: Option<String>,

        /// Kill a managed sibling already holding the port
        #[arg(long)]
        exclusive: bool,

        /// Restart: like --exclusive, but implies a sibling is expected
        #[arg(long)]
        restart: bool,

        /// Run as a daemon supervisor (respawn the server on exit)
        #[arg(long)]
        daemon: bool,

        /// Skip starting the OAuth token daemon
        #[arg(long)]
        no_token_daemon: bool,

        /// Skip starting the guardian daemon
        #[arg(long)]
        no_guardian: bool,

        /// Capture mode: "analysis" enables request snapshots
        #[arg(long)]
        mode: Option<String>,
    },

    /// Stop a running proxy
    Stop {
        /// Port of the server to stop (default: config port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Stop password (or set ROUTECODEX_STOP_PASSWORD)
        #[arg(long)]
        password: Option<String>,
    },

    /// Show server status and target health
    Status {
        /// Port of the server to query (default: config port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Show detailed version and build info
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Start {
            port,
            config,
            exclusive,
            restart,
            daemon,
            no_token_daemon,
            no_guardian,
            mode,
        } => {
            commands::start::run(supervisor::SupervisorOptions {
                port,
                config: config.map(Into::into),
                exclusive: exclusive || restart,
                daemon,
                start_token_daemon: !no_token_daemon,
                start_guardian: !no_guardian,
                analysis_mode: mode.as_deref() == Some("analysis"),
            })
            .await
        }
        Commands::Stop { port, password } => commands::stop::run(port, password).await,
        Commands::Status { port } => commands::status::run(port).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "routecodex", &mut std::io::stdout());
            Ok(())
        }
        Commands::Version => {
            println!("routecodex v{}", env!("CARGO_PKG_VERSION"));
            println!("   Arch: {}", std::env::consts::ARCH);
            println!("   OS:   {}", std::env::consts::OS);
            println!("   Home: {}", routecodex_config::routecodex_home().display());
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "command failed");
        std::process::exit(1);
    }
}
