//! Group broadcast to every member of the room, sender included.
//!
//! Delivery is ordered per sender and at-least-once; consumers must tolerate
//! duplicates. [`TcpTransport`] talks to a [`crate::relay`] server,
//! [`MemoryHub`] provides the same contract in-process.
mod memory;
mod tcp;

use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::protocol::{Envelope, Member, ParticipantId, SessionMessage};

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;


pub trait Transport: Send + Sync {
    fn participant_id(&self) -> ParticipantId;

    /// Queues `message` for delivery to all members, including this one.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection to the room is gone.
    fn broadcast(&self, message: SessionMessage) -> AppResult<()>;
}

#[derive(Debug)]
pub enum TransportEvent {
    Delivered(Envelope),
    MemberJoined(Member),
    MemberLeft(ParticipantId),
    Disconnected(AppError),
}

/// A joined room: the transport handle, the roster at join time and the
/// inbound event stream.
pub struct Connection<TTransport> {
    pub transport: TTransport,
    pub members: Vec<Member>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}
