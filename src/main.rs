use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use turnrelay::config::{ConfigSource, EnvConfig, RelayConfig};
use turnrelay::logger::{LogConfig, init_tracing};

#[derive(Parser, Debug)]
#[command(
    name = "turnrelay",
    about = "Relay chat turns to long-lived worker processes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the chat platform and relay messages (default)
    Run(RunArgs),

    /// Print the resolved configuration with secrets masked
    Config(ConfigArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// `.env` file to load before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log filter (e.g. error, warn, info, debug, trace or `turnrelay=debug`)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for the rolling text log and the JSON request log
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// `.env` file to load before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(|| {
        Commands::Run(RunArgs {
            log_level: "info".to_string(),
            ..RunArgs::default()
        })
    });

    match command {
        Commands::Run(args) => {
            init_tracing(&LogConfig::new(args.log_level, args.log_dir))?;
            let source = EnvConfig::new(args.env_file);
            info!("configuration from {}", source.describe());
            let config = match RelayConfig::from_source(&source) {
                Ok(config) => config,
                Err(err) => {
                    error!("{err}");
                    process::exit(2);
                }
            };
            if let Err(err) = turnrelay::telegram::run(config).await {
                error!("relay stopped: {err:#}");
                process::exit(1);
            }
            Ok(())
        }
        Commands::Config(args) => {
            let source = EnvConfig::new(args.env_file);
            let config = RelayConfig::from_source(&source)?;
            println!("# {}", source.describe());
            for (key, value) in config.as_vec() {
                println!("{key}={value}");
            }
            Ok(())
        }
    }
}
