/// Circuit daemon
///
/// Runs an onion-routing client against a loopback network of relays:
/// builds circuits, exercises them, keeps path-bias statistics for its
/// entry guards and serves them over a small HTTP API.

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn, Level};

use onioncirc_common::{CircuitConfig, NetworkParams};
use onioncirc_core::LoopbackNetwork;
use onioncirc_daemon::{sim, ApiServer, SimOptions, SimReport};

/// Where the API listens by default
const DEFAULT_API_ADDR: &str = "127.0.0.1:9150";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|arg| arg == "--verbose");

    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match args.first().map(String::as_str) {
        Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some("version") | Some("--version") | Some("-v") => {
            println!("onioncirc-daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("config") => print_config(args.get(1).map(PathBuf::from)),
        Some("simulate") | None => {
            info!("Starting onioncirc daemon v{}", env!("CARGO_PKG_VERSION"));
            let options = parse_sim_options(args.get(1..).unwrap_or(&[]))?;
            run_simulation(options).await
        }
        Some(flag) if flag.starts_with("--") => {
            info!("Starting onioncirc daemon v{}", env!("CARGO_PKG_VERSION"));
            let options = parse_sim_options(&args)?;
            run_simulation(options).await
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

/// Read `--relays N` and `--circuits M` from the arguments after the
/// command
fn parse_sim_options(args: &[String]) -> Result<SimOptions> {
    let mut options = SimOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--relays" => {
                let value = iter.next().ok_or_else(|| anyhow!("--relays needs a value"))?;
                options.relays = value.parse().with_context(|| format!("bad relay count {:?}", value))?;
            }
            "--circuits" => {
                let value = iter.next().ok_or_else(|| anyhow!("--circuits needs a value"))?;
                options.circuits = value
                    .parse()
                    .with_context(|| format!("bad circuit count {:?}", value))?;
            }
            "--verbose" => {}
            other => return Err(anyhow!("Unknown option: {}", other)),
        }
    }
    if options.relays < 2 {
        return Err(anyhow!("need at least 2 relays, got {}", options.relays));
    }
    options.unreachable = options.unreachable.min(options.relays / 4);
    Ok(options)
}

/// Build the network, run the circuits, then serve the results
async fn run_simulation(options: SimOptions) -> Result<()> {
    let config = load_config(None)?;
    info!(
        "Simulating {} relays ({} unreachable), {} circuits",
        options.relays, options.unreachable, options.circuits
    );

    let mut network = sim::build_network(&options, config, NetworkParams::new());
    let report = sim::run(&mut network, options.circuits);
    print_report(&report);
    print_guards(&network);

    let network = Arc::new(RwLock::new(network));
    let api_addr: SocketAddr = DEFAULT_API_ADDR.parse()?;
    info!("API server will listen on: {}", api_addr);

    let api_server = ApiServer::new(api_addr, network.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    info!("Serving results. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

/// Configuration from `path`, or from `onioncirc.toml` when it exists
fn load_config(path: Option<PathBuf>) -> Result<CircuitConfig> {
    let explicit = path.is_some();
    let path = path.unwrap_or_else(|| PathBuf::from("onioncirc.toml"));
    if path.exists() {
        info!("Loading configuration from {:?}", path);
        Ok(CircuitConfig::from_file(&path)?)
    } else if explicit {
        Err(anyhow!("configuration file {:?} not found", path))
    } else {
        info!("No configuration file found, using defaults");
        Ok(CircuitConfig::default())
    }
}

fn print_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn print_report(report: &SimReport) {
    println!("\n========================================");
    println!("         Simulation Results");
    println!("========================================");
    println!("Launched:         {}", report.launched);
    println!("Launch failures:  {}", report.launch_failed);
    println!("Opened:           {}", report.opened);
    println!("Build failures:   {}", report.build_failed);
    println!("Closed idle:      {}", report.closed_idle);
    println!("Probed on close:  {}", report.probed);
    println!("Proven used:      {}", report.proven);
    println!("Left open:        {}", report.left_open);
    println!("========================================\n");
}

/// Print path-bias counters for every guard
fn print_guards(network: &LoopbackNetwork) {
    let client = network.client();
    println!("{:<12} {:>9} {:>9} {:>9} {:>9} {:>9}", "guard", "attempts", "built", "used", "proven", "collapsed");
    for guard in client.guards().iter() {
        println!(
            "{:<12} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
            guard.nickname,
            guard.circ_attempts,
            guard.circ_successes,
            guard.use_attempts,
            guard.use_successes,
            guard.collapsed_circuits
        );
    }
    let build_times = client.build_times_summary();
    println!(
        "\nBuild-time samples: {}, timeout {} ms\n",
        build_times.samples, build_times.timeout_ms
    );
}

/// Print help message
fn print_help() {
    println!("onioncirc daemon - circuit construction and path-bias accounting");
    println!();
    println!("USAGE:");
    println!("    onioncirc-daemon [COMMAND] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    simulate    Build circuits on a loopback network and serve the results (default)");
    println!("    config      Print the effective configuration as TOML");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("SIMULATE OPTIONS:");
    println!("    --relays N      Number of relays (default 8)");
    println!("    --circuits M    Number of circuits to build (default 12)");
    println!("    --verbose       Debug logging");
    println!();
    println!("CONFIG:");
    println!("    onioncirc-daemon config [path]");
    println!();
    println!("API (127.0.0.1:9150):");
    println!("    GET /health");
    println!("    GET /api/guards");
    println!("    GET /api/guards/:identity");
    println!("    GET /api/circuits");
    println!("    GET /api/params");
}
