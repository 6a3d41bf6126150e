use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use egd_core::{parse_and_validate, Daemon};
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_GENERIC_FAILURE: i32 = 1;
const EXIT_MISUSE: i32 = 2;
const EXIT_CANNOT_REACH_DAEMON: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "egd", about = "Entropy gathering daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/egd/egd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground.
    Start {
        /// Bypass the lock file's "alive" check.
        #[arg(long)]
        force: bool,
    },
    /// Ask the running daemon to shut down.
    Stop,
    /// Report pool statistics.
    Status,
    /// Force immediate pool persistence.
    Persist,
    /// List configured sources and their state (reads from status; a thin
    /// wrapper since the control protocol does not carry per-source
    /// runtime detail beyond aggregate pool stats).
    Sources,
    /// Configuration file operations.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Parse and validate the configuration file, reporting problems.
    Validate,
    /// Parse and print the effective (validated) configuration.
    Show,
}

fn main() {
    let args = Args::parse();
    let exit_code = run(args);
    std::process::exit(exit_code);
}

fn run(args: Args) -> i32 {
    match args.command {
        Command::Start { force } => cmd_start(&args.config, force),
        Command::Config { action } => cmd_config(&args.config, action),
        Command::Stop => cmd_client(&args.config, "quit", HashMap::new()),
        Command::Status => cmd_client(&args.config, "status", HashMap::new()),
        Command::Persist => cmd_client(&args.config, "persist", HashMap::new()),
        Command::Sources => cmd_client(&args.config, "status", HashMap::new()),
    }
}

fn load_config(path: &std::path::Path) -> Result<egd_core::DaemonConfig, i32> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        eprintln!("error reading {}: {e}", path.display());
        EXIT_MISUSE
    })?;
    parse_and_validate(&text).map_err(|e| {
        eprintln!("invalid configuration: {e}");
        EXIT_MISUSE
    })
}

fn cmd_config(path: &std::path::Path, action: ConfigAction) -> i32 {
    let config = match load_config(path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match action {
        ConfigAction::Validate => {
            println!("configuration is valid: {} source(s) configured", config.sources.len());
            EXIT_OK
        }
        ConfigAction::Show => {
            match serde_json::to_string_pretty(&effective_config_json(&config)) {
                Ok(text) => {
                    println!("{text}");
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("error serializing configuration: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
    }
}

fn effective_config_json(config: &egd_core::DaemonConfig) -> serde_json::Value {
    serde_json::json!({
        "max_entropy": config.max_entropy,
        "chunk_capacity": config.chunk_capacity,
        "pool_path": config.pool_path,
        "control_addr": config.control_addr,
        "persist_interval_secs": config.persist_interval_secs,
        "lock_path": config.lock_path,
        "sources": config.sources.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
    })
}

fn cmd_start(path: &std::path::Path, force: bool) -> i32 {
    let config = match load_config(path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error starting async runtime: {e}");
            return EXIT_GENERIC_FAILURE;
        }
    };

    runtime.block_on(async move {
        let lock_path = config.lock_path.clone();
        info!(addr = %config.control_addr, sources = config.sources.len(), "starting egd");
        let daemon = match Daemon::new(config).await {
            Ok(d) => d,
            Err(e) => {
                eprintln!("error starting daemon: {e}");
                return EXIT_GENERIC_FAILURE;
            }
        };
        match daemon.run(&lock_path, force).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e}");
                EXIT_GENERIC_FAILURE
            }
        }
    })
}

fn cmd_client(path: &std::path::Path, command: &str, args: HashMap<String, String>) -> i32 {
    let config = match load_config(path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    match egd_core::send_command(&config.control_addr, command, args) {
        Ok(response) => {
            match serde_json::to_string_pretty(&response) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{response}"),
            }
            let status_code = response.get("status_code").and_then(|v| v.as_u64()).unwrap_or(0);
            if status_code == 200 {
                EXIT_OK
            } else {
                EXIT_GENERIC_FAILURE
            }
        }
        Err(e) => {
            eprintln!("cannot reach daemon: {e}");
            EXIT_CANNOT_REACH_DAEMON
        }
    }
}
