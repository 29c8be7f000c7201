use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, SessionError};
use crate::protocol::{ClientFrame, RelayFrame, read_frame, send_frame};

use super::room::{MEMBER_QUEUE_FRAMES, RoomEvent};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn serve_participant(
    stream: TcpStream,
    peer: SocketAddr,
    room_tx: mpsc::UnboundedSender<RoomEvent>,
) -> AppResult<()> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, err);
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let name = match timeout(HELLO_TIMEOUT, read_frame::<_, ClientFrame>(&mut reader)).await {
        Ok(result) => match result? {
            ClientFrame::Hello { name } => name,
            ClientFrame::Broadcast { .. } => {
                return Err(AppError::session(SessionError::ExpectedHello));
            }
        },
        Err(_) => return Err(AppError::session(SessionError::HelloTimeout)),
    };
    debug!("Hello from {} ({})", name, peer);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RelayFrame>(MEMBER_QUEUE_FRAMES);
    let (id_tx, id_rx) = oneshot::channel();
    room_tx
        .send(RoomEvent::Joined {
            name,
            outbound: outbound_tx,
            respond_to: id_tx,
        })
        .map_err(|_err| AppError::session(SessionError::RoomClosed))?;

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = send_frame(&mut write_half, &frame).await {
                debug!("Writer for {} stopped: {}", peer, err);
                break;
            }
        }
    });

    let participant_id = id_rx
        .await
        .map_err(|_err| AppError::session(SessionError::RoomClosed))?;

    loop {
        let read = tokio::select! {
            read = read_frame::<_, ClientFrame>(&mut reader) => read,
            _ = &mut writer => {
                debug!("Writer for {} ended; closing connection", participant_id);
                break;
            }
        };
        match read {
            Ok(ClientFrame::Broadcast { message }) => {
                if room_tx
                    .send(RoomEvent::Broadcast {
                        sender: participant_id,
                        message,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(ClientFrame::Hello { .. }) => {
                warn!("Ignoring repeated hello from {}", participant_id);
            }
            Err(err) => {
                debug!("Connection {} closed: {}", participant_id, err);
                break;
            }
        }
    }

    writer.abort();
    if room_tx.send(RoomEvent::Left { participant_id }).is_err() {
        // Room loop is gone; nothing left to notify.
    }
    Ok(())
}
