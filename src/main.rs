//! valkey-mux - topology inspector for Valkey/Redis deployments
//!
//! Connects through the multiplexer, prints what it discovered and can route
//! a single command or watch connection events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use valkey_mux::config::{CliArgs, OutputFormat};
use valkey_mux::{Multiplexer, MuxConfig, MuxStatus, Raw, Request, RespValue, TcpConnector};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn print_status(status: &MuxStatus, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    let topology = &status.topology;
    println!("valkey-mux v{}", env!("CARGO_PKG_VERSION"));
    println!("====================================");
    println!("Topology v{}: {:?}", topology.version, topology.kind);
    if let Some(ref primary) = topology.elected_primary {
        println!("Elected primary: {}", primary);
    }
    if let Some(slots) = topology.assigned_slots {
        println!("Assigned slots: {}", slots);
    }
    println!(
        "Nodes: {} ({} primaries, {} replicas)",
        topology.nodes, topology.primaries, topology.replicas
    );
    for node in &status.nodes {
        println!(
            "  {:<24} {:<8} {:<11} {:<12} ops={} p50={}us p99={}us{}",
            node.address,
            format!("{:?}", node.role).to_lowercase(),
            format!("{:?}", node.kind).to_lowercase(),
            node.state.as_str(),
            node.ops_sent,
            node.latency_p50_us,
            node.latency_p99_us,
            if node.unselectable.is_empty() {
                String::new()
            } else {
                format!(" unselectable={}", node.unselectable.join(","))
            }
        );
    }
    println!(
        "Completion pool: {}/{} in use, {} overflow",
        status.pool.in_use, status.pool.capacity, status.pool.overflow_allocated
    );
    println!("====================================");
    Ok(())
}

fn format_reply(reply: &RespValue) -> String {
    match reply {
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) => format!("(error) {}", e),
        RespValue::Integer(i) => format!("(integer) {}", i),
        RespValue::BulkString(b) => format!("\"{}\"", String::from_utf8_lossy(b)),
        RespValue::Null => "(nil)".to_string(),
        RespValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}) {}", i + 1, format_reply(item)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    let config = MuxConfig::from_cli(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let mux = Multiplexer::connect(config, Arc::new(TcpConnector::new()))?;
    let events = mux.subscribe();

    print_status(&mux.status(), args.output_format)?;

    if let Some((name, rest)) = args.command.split_first() {
        let mut request = Request::cmd(name).prefer(args.prefer);
        if let Some(ref key) = args.key {
            request = request.key(key);
        }
        for arg in rest {
            request = request.arg(arg);
        }

        let target = mux.select(&request)?;
        info!("Routing {} to {}", request.command_name(), target);
        let started = Instant::now();
        let reply = mux.execute(&request, Raw)?;
        println!("{}", format_reply(&reply));
        info!("Completed in {:.3}ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    if args.watch_secs > 0 {
        info!("Watching events for {}s", args.watch_secs);
        let deadline = Instant::now() + Duration::from_secs(args.watch_secs);
        while let Ok(event) = events.recv_deadline(deadline) {
            println!("{}", serde_json::to_string(&event)?);
        }
        print_status(&mux.status(), args.output_format)?;
    }

    mux.close();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
