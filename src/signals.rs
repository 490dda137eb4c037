use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::watch;

/// What should we do when the user stops
/// this program?
///
/// The first signal asks every worker to wind down through `shutdown`.
/// A second one exits right away.
pub fn handle_shutdown(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if *shutdown.borrow() {
                log::warn!("Received signal {signal} again, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            if shutdown.send(true).is_err() {
                std::process::exit(0);
            }
        }
    });

    Ok(())
}
