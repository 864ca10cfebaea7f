use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod core;
mod daemon;
mod sources;

use crate::core::settings::Settings;

#[derive(Parser)]
#[command(name = "freshet")]
#[command(author, version, about = "Adaptive refresh scheduler for usage-analytics sources")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler daemon
    Daemon {
        /// Config file to use instead of the default location
        #[arg(long)]
        config: Option<std::path::PathBuf>,
    },

    /// Show scheduler state and the last run
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent refresh runs
    History {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Number of hours to include (default: 24)
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Trigger a manual refresh via D-Bus
    Refresh,

    /// Show or change schedule settings
    Settings(cli::settings::SettingsArgs),

    /// Resume scheduling after the failure ceiling was reached
    Reenable,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(json: bool, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config } => {
            let config_path = config.or_else(Settings::config_path);
            let settings = match config_path.as_deref() {
                Some(path) => Settings::load_from(path)?,
                None => Settings::default(),
            };
            init_logging(cli.json_logs, settings.debug);
            daemon::run(settings, config_path).await
        }
        Commands::Status { json } => {
            init_logging(cli.json_logs, false);
            cli::status::run(json).await
        }
        Commands::History { json, hours } => {
            init_logging(cli.json_logs, false);
            cli::history::run(json, hours).await
        }
        Commands::Refresh => {
            init_logging(cli.json_logs, false);
            cli::refresh::run().await
        }
        Commands::Settings(args) => {
            init_logging(cli.json_logs, false);
            cli::settings::run(args).await
        }
        Commands::Reenable => {
            init_logging(cli.json_logs, false);
            cli::reenable::run().await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
