use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, SessionError};
use crate::protocol::{ClientFrame, ParticipantId, RelayFrame, SessionMessage, read_frame, send_frame};

use super::{Connection, Transport, TransportEvent};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Room membership through a relay server.
pub struct TcpTransport {
    participant_id: ParticipantId,
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    reader_handle: JoinHandle<()>,
}

impl TcpTransport {
    /// Connects to the relay at `addr` and joins the room as `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is unreachable or the handshake fails.
    pub async fn connect(addr: &str, name: &str) -> AppResult<Connection<Self>> {
        info!("Connecting to relay {}", addr);
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            AppError::session(SessionError::Connection {
                addr: addr.to_owned(),
                source: err,
            })
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", err);
        }
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        send_frame(
            &mut write_half,
            &ClientFrame::Hello {
                name: name.to_owned(),
            },
        )
        .await?;

        let (participant_id, members) =
            match timeout(WELCOME_TIMEOUT, read_frame::<_, RelayFrame>(&mut reader)).await {
                Ok(result) => match result? {
                    RelayFrame::Welcome {
                        participant_id,
                        members,
                    } => (participant_id, members),
                    RelayFrame::MemberJoined { .. }
                    | RelayFrame::MemberLeft { .. }
                    | RelayFrame::Deliver { .. } => {
                        return Err(AppError::session(SessionError::ExpectedWelcome));
                    }
                },
                Err(_) => return Err(AppError::session(SessionError::WelcomeTimeout)),
            };
        info!(
            "Joined room as {} ({} member(s) present)",
            participant_id,
            members.len()
        );

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = send_frame(&mut write_half, &frame).await {
                    if writer_events.send(TransportEvent::Disconnected(err)).is_err() {
                        // Session loop is gone; nothing left to notify.
                    }
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            loop {
                let frame = match read_frame::<_, RelayFrame>(&mut reader).await {
                    Ok(frame) => frame,
                    Err(err) => {
                        if event_tx.send(TransportEvent::Disconnected(err)).is_err() {
                            // Session loop is gone; nothing left to notify.
                        }
                        break;
                    }
                };
                let event = match frame {
                    RelayFrame::Deliver { envelope } => TransportEvent::Delivered(envelope),
                    RelayFrame::MemberJoined { member } => TransportEvent::MemberJoined(member),
                    RelayFrame::MemberLeft { participant_id } => {
                        TransportEvent::MemberLeft(participant_id)
                    }
                    RelayFrame::Welcome { .. } => {
                        warn!("Ignoring repeated welcome from relay");
                        continue;
                    }
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            transport: Self {
                participant_id,
                out_tx,
                reader_handle,
            },
            members,
            events: event_rx,
        })
    }
}

impl Transport for TcpTransport {
    fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    fn broadcast(&self, message: SessionMessage) -> AppResult<()> {
        self.out_tx
            .send(ClientFrame::Broadcast { message })
            .map_err(|_err| AppError::session(SessionError::RelayConnectionClosed))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}
