//! The room: a TCP fan-out server shared by all participants.
//!
//! Each connection introduces itself with a hello, receives a participant id
//! and the current roster, and from then on every broadcast it sends is
//! echoed to every member (itself included) in the order the room loop
//! receives them.
mod connection;
mod room;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult, SessionError};
use crate::shutdown::ShutdownReceiver;

use room::{RoomEvent, run_room};


pub struct Relay {
    listener: TcpListener,
}

impl Relay {
    /// Binds the relay listener.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(listen: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(listen).await.map_err(|err| {
            AppError::session(SessionError::Bind {
                addr: listen.to_owned(),
                source: err,
            })
        })?;
        Ok(Self { listener })
    }

    /// # Errors
    ///
    /// Returns an error when the bound address cannot be read.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        self.listener.local_addr().map_err(|err| {
            AppError::session(SessionError::Io {
                context: "read relay address",
                source: err,
            })
        })
    }

    /// Accepts participants until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the room loop stops unexpectedly.
    pub async fn run(self, mut shutdown: ShutdownReceiver) -> AppResult<()> {
        let addr = self.local_addr()?;
        info!("Relay listening on {}", addr);
        let (room_tx, room_rx) = mpsc::unbounded_channel::<RoomEvent>();
        let room_handle = tokio::spawn(run_room(room_rx));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Relay shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(result) => result,
                        Err(err) => {
                            warn!("Failed to accept participant: {}", err);
                            continue;
                        }
                    };
                    let room_tx = room_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = connection::serve_participant(stream, peer, room_tx).await {
                            warn!("Participant {} rejected: {}", peer, err);
                        }
                    });
                }
            }
        }

        drop(room_tx);
        room_handle.abort();
        Ok(())
    }
}
