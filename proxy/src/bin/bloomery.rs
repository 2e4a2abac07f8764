//! Bloomery proxy binary.

use clap::Parser;
use proxy::server::Options;
use proxy::{Config, logging, server, signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bloomery")]
#[command(about = "L4/L7 service proxy")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Shared-memory and domain-socket namespace selector
    #[arg(long, default_value_t = 0)]
    base_id: u32,

    /// Hot-restart generation; 0 means a fresh start
    #[arg(long, default_value_t = 0)]
    restart_epoch: u32,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("no config file specified; use <config> or --print-config");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    let shutdown = signal::install_signal_handler();

    let options = Options {
        base_id: args.base_id,
        restart_epoch: args.restart_epoch,
    };
    if let Err(e) = server::run(&config, options, shutdown) {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# Bloomery proxy configuration

[server]
# Seconds after startup at which the previous generation is terminated
# during a hot restart.
parent_shutdown_secs = 15

[workers]
# Number of worker threads (default: number of CPUs)
# threads = 8

# CPU cores to pin workers to (Linux-style, e.g., "0-3,6-8")
# cpu_affinity = "0-7"

[[listener]]
# Address to listen on for downstream connections
address = "tcp://0.0.0.0:10000"

# Cluster the built-in TCP proxy routes to
route = "backend"

# Strip a PROXY protocol header before the filter chain
# use_proxy_proto = false

# Redirect to the listener matching the original (pre-DNAT) destination
# use_original_dst = false

# per_connection_buffer_limit = 1048576

[[cluster]]
name = "backend"
address = "tcp://127.0.0.1:8080"

# Milliseconds allowed for an upstream connect
connect_timeout_ms = 250

# Resource limits consulted on every pool admission
max_connections = 1024
max_pending_requests = 1024
max_requests = 1024
max_retries = 3

# Drain an upstream connection after this many requests (0 = unlimited)
max_requests_per_connection = 0

[logging]
level = "info"
format = "pretty"   # pretty | json | compact
"#;
    print!("{}", config);
}
