use std::process::ExitCode;

use config::{Route, Settings};
use tokio::sync::{mpsc, watch};

mod adapter;
mod cli;
mod client;
mod config;
mod connection;
mod encoder;
mod forwarder;
mod record;
mod signals;
mod sink;
mod source;
mod tag;
mod transport;

/// Records buffered between the source and the forwarder.
const RECORD_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::get_cli_args();

    // Settings files must be loaded before the logger reads RUST_LOG
    if let Some(env_file) = &args.env_file {
        if let Err(err) = dotenv::from_path(env_file) {
            eprintln!("Unable to load {}: {err}", env_file.display());
            return ExitCode::FAILURE;
        }
    }

    // Initialize the logger
    env_logger::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let route = match Route::parse(&args.route) {
        Ok(route) => route,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown) = watch::channel(false);
    if let Err(err) = signals::handle_shutdown(shutdown_tx) {
        log::error!("Unable to register signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    let mut forwarder = match adapter::new_adapter(&route, &settings, shutdown.clone()).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            log::error!("{}: {err}", route.adapter);
            return ExitCode::FAILURE;
        }
    };
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    let (tx, rx) = mpsc::channel(RECORD_BUFFER);
    let source = tokio::spawn(source::run(args.source, tx, shutdown));

    let stats = forwarder.stats();
    forwarder.run(rx).await;
    log::debug!("{} adapter is {:?}", route.adapter, forwarder.state());
    let failed = stats.snapshot().failed;
    if failed > 0 {
        log::warn!("{failed} record(s) could not be delivered");
    }

    match source.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            log::error!("Log source failed: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("Log source task panicked: {err}");
            ExitCode::FAILURE
        }
    }
}
