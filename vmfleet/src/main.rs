use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vmfleet::output::render;
use vmfleet::parser::{parse_command, parse_line};
use vmfleet::build_node;
use vmfleet_core::{Command, Config, FleetResult, SharedNodeState};

#[derive(Parser)]
#[command(name = "vmfleet")]
#[command(about = "Fleet VM orchestration", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Use mock VMs and in-memory bridges instead of real processes
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Read commands from stdin, one per line
    Shell,
    /// Run a single command
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
}

fn init_logging(level: &str) -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> FleetResult<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Runs one command and prints its response. Returns false on error.
async fn run(node: &SharedNodeState, cmd: FleetResult<Command>) -> bool {
    let cmd = match cmd {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("{}", e);
            return false;
        }
    };

    let resp = node.process(&cmd).await;
    print!("{}", render(&resp));
    if let Some(error) = &resp.error {
        eprintln!("{}: {}", resp.host, error);
        return false;
    }
    true
}

async fn shell(node: &SharedNodeState) -> color_eyre::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        debug!("shell: {}", line);
        run(node, parse_line(line)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging.level)?;

    let node = build_node(config, cli.dry_run)?;
    info!("vmfleet node {} started", node.hostname());

    match cli.command {
        Commands::Shell => shell(&node).await?,
        Commands::Exec { words } => {
            if !run(&node, parse_command(&words)).await {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
