use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use plinth::config::Config;
use plinth::logging;
use plinth::pool::MAX_WORKERS;
use plinth::server::{Server, ServerOptions};

#[derive(Parser)]
#[command(name = "plinth")]
#[command(about = "Event-driven HTTP/1.1 static-content server")]
#[command(version)]
struct Cli {
    /// Port to listen on (1-65535, default 8080)
    port: Option<String>,

    /// Worker thread count (0 = auto-detect, default)
    thread_count: Option<String>,
}

fn parse_port(arg: Option<&str>) -> u16 {
    match arg {
        None => 8080,
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port >= 1 => port,
            _ => {
                tracing::warn!(argument = raw, "invalid port, falling back to 8080");
                8080
            }
        },
    }
}

fn parse_thread_count(arg: Option<&str>) -> usize {
    match arg {
        None => 0,
        Some(raw) => match raw.parse::<usize>() {
            Ok(count) if count <= MAX_WORKERS => count,
            Ok(count) => {
                tracing::warn!(
                    requested = count,
                    cap = MAX_WORKERS,
                    "thread count above cap, auto-detecting"
                );
                0
            }
            Err(_) => {
                tracing::warn!(argument = raw, "invalid thread count, auto-detecting");
                0
            }
        },
    }
}

fn main() -> ExitCode {
    logging::init_logging();
    let cli = Cli::parse();

    let port = parse_port(cli.port.as_deref());
    let workers = parse_thread_count(cli.thread_count.as_deref());
    let config = Config::load(Path::new("config.json"));

    let options = ServerOptions {
        port,
        workers,
        max_connections: config.max_connections,
        ..ServerOptions::default()
    };

    let mut server = match Server::bind(options) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "startup failed");
        return ExitCode::FAILURE;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    tracing::info!(port = server.local_port(), "ready, press Ctrl+C to stop");
    while server.is_running() && !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutdown signal received, stopping");
    server.stop();
    ExitCode::SUCCESS
}
