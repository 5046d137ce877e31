//! Berth operator CLI.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Berth worker operator CLI", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a worker configuration file
    CheckConfig {
        /// Path to the configuration file
        #[arg(default_value = "worker.kdl")]
        path: String,
    },
    /// Apply the bookkeeping schema
    Migrate {
        /// PostgreSQL connection URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Record a worker's resource types and certificates in the store
    Register {
        /// Path to the configuration file
        #[arg(default_value = "worker.kdl")]
        path: String,
        /// PostgreSQL connection URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::CheckConfig { path } => {
            commands::check_config(&path)?;
        }
        Commands::Migrate { database_url } => {
            commands::migrate(&database_url).await?;
        }
        Commands::Register { path, database_url } => {
            commands::register(&path, &database_url).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_config() {
        let cli = Cli::try_parse_from(["berth", "check-config", "w.kdl", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::CheckConfig { path } if path == "w.kdl"));
    }

    #[test]
    fn test_parse_migrate() {
        let cli = Cli::try_parse_from([
            "berth",
            "migrate",
            "--database-url",
            "postgres://localhost/berth",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Migrate { database_url } if database_url == "postgres://localhost/berth"
        ));
    }
}
