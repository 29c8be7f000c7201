//! Process-wide stop signal. The relay accept loop and the session runner
//! each hold a receiver; Ctrl-C or SIGTERM fires the sender once.
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

pub type ShutdownSender = broadcast::Sender<()>;
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// One pending stop is all any receiver needs to see.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

#[must_use]
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel::<()>(SHUTDOWN_CHANNEL_CAPACITY)
}

/// Fires `shutdown_tx` on the first Ctrl-C or SIGTERM. The task ends on its
/// own when something else sends the stop first.
pub fn spawn_signal_listener(shutdown_tx: &ShutdownSender) -> JoinHandle<()> {
    let shutdown_tx = shutdown_tx.clone();
    let mut stopped = shutdown_tx.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = stopped.recv() => {}
            name = next_signal() => {
                info!("Received {}; leaving", name);
                if shutdown_tx.send(()).is_err() {
                    debug!("Nothing left to stop");
                }
            }
        }
    })
}

#[cfg(unix)]
async fn next_signal() -> &'static str {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("Failed to register SIGTERM handler: {}", err);
            return ctrl_c().await;
        }
    };
    tokio::select! {
        name = ctrl_c() => name,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    "Ctrl-C"
}
