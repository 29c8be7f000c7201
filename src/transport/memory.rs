use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::{AppError, AppResult, SessionError};
use crate::protocol::{Envelope, Member, ParticipantId, SessionMessage};

use super::{Connection, Transport, TransportEvent};

#[derive(Default)]
struct HubState {
    next_id: u64,
    members: BTreeMap<ParticipantId, HubMember>,
    duplicate_delivery: bool,
    taps: Vec<mpsc::UnboundedSender<Envelope>>,
}

struct HubMember {
    name: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// In-process room with relay semantics.
///
/// Every broadcast is delivered to every member in a single global order.
/// With duplicate delivery enabled each envelope is delivered twice.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.lock().duplicate_delivery = enabled;
    }

    /// Receives a copy of every envelope the hub delivers, once per broadcast.
    #[must_use]
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().taps.push(tx);
        rx
    }

    #[must_use]
    pub fn join(&self, name: &str) -> Connection<MemoryTransport> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id = state.next_id.saturating_add(1);
        let participant_id = ParticipantId(state.next_id);
        let member = Member {
            participant_id,
            name: name.to_owned(),
        };
        for existing in state.members.values() {
            if existing
                .events
                .send(TransportEvent::MemberJoined(member.clone()))
                .is_err()
            {
                // Member is shutting down; its leave will follow.
            }
        }
        state.members.insert(
            participant_id,
            HubMember {
                name: name.to_owned(),
                events: event_tx,
            },
        );
        let members = state
            .members
            .iter()
            .map(|(id, entry)| Member {
                participant_id: *id,
                name: entry.name.clone(),
            })
            .collect();
        drop(state);

        Connection {
            transport: MemoryTransport {
                hub: self.clone(),
                participant_id,
            },
            members,
            events: event_rx,
        }
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    fn deliver(&self, sender: ParticipantId, message: SessionMessage) -> AppResult<()> {
        let mut state = self.lock();
        if !state.members.contains_key(&sender) {
            return Err(AppError::session(SessionError::RelayConnectionClosed));
        }
        let envelope = Envelope { sender, message };
        let copies = if state.duplicate_delivery { 2 } else { 1 };
        for _ in 0..copies {
            for member in state.members.values() {
                if member
                    .events
                    .send(TransportEvent::Delivered(envelope.clone()))
                    .is_err()
                {
                    // Receiver dropped; its transport will leave on drop.
                }
            }
        }
        state.taps.retain(|tap| tap.send(envelope.clone()).is_ok());
        Ok(())
    }

    fn leave(&self, participant_id: ParticipantId) {
        let mut state = self.lock();
        if state.members.remove(&participant_id).is_none() {
            return;
        }
        for member in state.members.values() {
            if member
                .events
                .send(TransportEvent::MemberLeft(participant_id))
                .is_err()
            {
                // Member is shutting down; nothing to notify.
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Membership in a [`MemoryHub`]; leaves the room on drop.
pub struct MemoryTransport {
    hub: MemoryHub,
    participant_id: ParticipantId,
}

impl MemoryTransport {
    /// Leaves the room without dropping the handle.
    pub fn leave(&self) {
        self.hub.leave(self.participant_id);
    }
}

impl Transport for MemoryTransport {
    fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    fn broadcast(&self, message: SessionMessage) -> AppResult<()> {
        self.hub.deliver(self.participant_id, message)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.leave(self.participant_id);
    }
}
