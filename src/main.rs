use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use relaynode::{config, metrics, Connection, ConnectionOptions, EchoProcess, RelayMetrics};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(author, version, about = "relay node: per-connection duplex relay server")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine connection lifecycle logs
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

type Live = Arc<Mutex<Vec<Connection<TcpStream>>>>;

fn main() -> Result<()> {
    println!("--- relay node ---");

    let cli = Cli::parse();
    let cfg = if Path::new(&cli.config).exists() {
        config::load(&cli.config)?
    } else {
        eprintln!("⚠️  Config '{}' not found, using built-in defaults", cli.config);
        config::Config::default()
    };
    relaynode::set_quiet_logging(cli.quiet || cfg.server.quiet);

    let registry = Registry::new();
    let relay_metrics = RelayMetrics::register(&registry)?;
    metrics::serve(cfg.metrics.clone(), registry)?;
    println!("📈 Metrics served on {}", cfg.metrics.bind);

    let options = ConnectionOptions::from_config(&cfg.relay, relay_metrics)?;
    let listener = TcpListener::bind(&cfg.server.listen)
        .with_context(|| format!("binding relay listener on {}", cfg.server.listen))?;
    println!("📡 Relay listening on {}", cfg.server.listen);

    let live: Live = Arc::new(Mutex::new(Vec::new()));
    spawn_reaper(live.clone())?;

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("❌ Accept failed: {}", e);
                continue;
            }
        };
        let host = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        match Connection::spawn(stream, host.clone(), options.clone(), EchoProcess::new(cfg.relay.read_buffer_bytes)) {
            Ok(conn) => live.lock().unwrap_or_else(|e| e.into_inner()).push(conn),
            Err(e) => eprintln!("❌ Could not start connection for {}: {:#}", host, e),
        }
    }
    Ok(())
}

/// Drops connections once their disconnect sequence has completed.
fn spawn_reaper(live: Live) -> Result<()> {
    thread::Builder::new()
        .name("relay-reaper".into())
        .spawn(move || loop {
            thread::sleep(REAP_INTERVAL);
            let finished: Vec<_> = {
                let mut conns = live.lock().unwrap_or_else(|e| e.into_inner());
                let (done, open): (Vec<_>, Vec<_>) = conns.drain(..).partition(|c| c.is_complete());
                *conns = open;
                done
            };
            // Joining happens outside the lock so accepts are not held up.
            drop(finished);
        })?;
    Ok(())
}
