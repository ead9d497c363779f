use clap::Parser;
use mainline_dht::engine::{DhtEngine, EngineConfig};
use mainline_dht::identity::Id;
use mainline_dht::DEFAULT_BOOTSTRAP_HOSTS;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A Mainline DHT participant. Given a content id, looks up peers announcing
/// it; given none, runs as a passive observer logging the info_hashes it
/// sees other nodes ask about.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// 40-character hex content identifier to find peers for. Omit to run
    /// as a passive observer instead.
    content_id: Option<String>,

    /// Seconds to search (peer lookup) or run (observer) before stopping.
    /// 0 means the 30s default window for a lookup, or "until stopped" for
    /// the observer.
    #[arg(short, long, default_value_t = 0)]
    timeout: u64,

    /// UDP port to listen on. 0 picks an ephemeral port.
    #[arg(short = 'P', long, default_value_t = 0)]
    port: u16,

    /// Bootstrap host:port to contact at startup. May be repeated; defaults
    /// to the standard public routers.
    #[arg(short, long)]
    bootstrap: Vec<String>,
}

const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 30;

fn main() -> ExitCode {
    env_logger::init();
    let args = Cli::parse();

    let bootstrap_hosts: Vec<String> = if args.bootstrap.is_empty() {
        DEFAULT_BOOTSTRAP_HOSTS.iter().map(|s| s.to_string()).collect()
    } else {
        args.bootstrap.clone()
    };

    let passive = args.content_id.is_none();
    let config = EngineConfig { passive, ..EngineConfig::default() };

    let engine = match DhtEngine::new(config, args.port) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to start dht engine: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("listening on {:?}, local id {}", engine.local_addr(), engine.local_id());

    match engine.bootstrap(&bootstrap_hosts) {
        Ok(n) => log::info!("bootstrap: {n} host(s) responded"),
        Err(e) => log::warn!("bootstrap: {e:#}"),
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst)) {
            log::warn!("failed to install Ctrl+C handler: {e}");
        }
    }

    match args.content_id {
        Some(hex) => run_lookup(&engine, &hex, args.timeout, &interrupted),
        None => run_observer(&engine, args.timeout, &interrupted),
    }
}

fn run_lookup(engine: &DhtEngine, hex: &str, timeout_secs: u64, interrupted: &AtomicBool) -> ExitCode {
    let content_id = match Id::from_hex(hex) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("invalid content id {hex:?}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let secs = if timeout_secs == 0 { DEFAULT_LOOKUP_TIMEOUT_SECS } else { timeout_secs };
    let peers = std::thread::scope(|scope| {
        let watcher = interrupted;
        scope.spawn(move || {
            while !watcher.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            engine.stop();
        });
        engine.get_peers(content_id, Duration::from_secs(secs))
    });

    for peer in &peers {
        println!("{peer}");
    }
    log::info!("found {} peer(s)", peers.len());

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_observer(engine: &DhtEngine, timeout_secs: u64, interrupted: &AtomicBool) -> ExitCode {
    std::thread::scope(|scope| {
        let watcher = interrupted;
        scope.spawn(move || {
            while !watcher.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            engine.stop();
        });
        engine.run_passive(Duration::from_secs(timeout_secs));
    });

    for (id, obs) in engine.observed_snapshot() {
        println!("{id} seen {} time(s) from {} source(s)", obs.probe_count, obs.sources.len());
    }

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}
