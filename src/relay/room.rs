use std::collections::BTreeMap;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, Member, ParticipantId, RelayFrame, SessionMessage};

/// Frames queued for one member before it is dropped as too slow.
pub(super) const MEMBER_QUEUE_FRAMES: usize = 1024;

pub(super) enum RoomEvent {
    Joined {
        name: String,
        outbound: mpsc::Sender<RelayFrame>,
        respond_to: oneshot::Sender<ParticipantId>,
    },
    Broadcast {
        sender: ParticipantId,
        message: SessionMessage,
    },
    Left {
        participant_id: ParticipantId,
    },
}

struct RoomMember {
    name: String,
    outbound: mpsc::Sender<RelayFrame>,
}

#[derive(Default)]
pub(super) struct Room {
    next_id: u64,
    members: BTreeMap<ParticipantId, RoomMember>,
}

impl Room {
    pub(super) fn handle(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Joined {
                name,
                outbound,
                respond_to,
            } => self.join(name, outbound, respond_to),
            RoomEvent::Broadcast { sender, message } => self.broadcast(sender, message),
            RoomEvent::Left { participant_id } => self.leave(participant_id),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.members.len()
    }

    fn join(
        &mut self,
        name: String,
        outbound: mpsc::Sender<RelayFrame>,
        respond_to: oneshot::Sender<ParticipantId>,
    ) {
        self.next_id = self.next_id.saturating_add(1);
        let participant_id = ParticipantId(self.next_id);
        let member = Member {
            participant_id,
            name: name.clone(),
        };
        self.send_to_all(&RelayFrame::MemberJoined {
            member: member.clone(),
        });

        let mut members = self.roster();
        members.push(member);
        if outbound
            .try_send(RelayFrame::Welcome {
                participant_id,
                members,
            })
            .is_err()
            || respond_to.send(participant_id).is_err()
        {
            debug!("Participant {} went away during join", name);
            self.send_to_all(&RelayFrame::MemberLeft { participant_id });
            return;
        }
        info!("{} joined as {} ({} member(s))", name, participant_id, self.len().saturating_add(1));
        self.members
            .insert(participant_id, RoomMember { name, outbound });
    }

    fn broadcast(&mut self, sender: ParticipantId, message: SessionMessage) {
        if !self.members.contains_key(&sender) {
            debug!("Dropping {} from departed {}", message.kind(), sender);
            return;
        }
        let frame = RelayFrame::Deliver {
            envelope: Envelope { sender, message },
        };
        self.send_to_all(&frame);
    }

    fn leave(&mut self, participant_id: ParticipantId) {
        if let Some(member) = self.members.remove(&participant_id) {
            info!(
                "{} ({}) left ({} member(s))",
                member.name,
                participant_id,
                self.len()
            );
            self.send_to_all(&RelayFrame::MemberLeft { participant_id });
        }
    }

    fn roster(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|(participant_id, member)| Member {
                participant_id: *participant_id,
                name: member.name.clone(),
            })
            .collect()
    }

    /// Queues `frame` for every member. Members whose queue is full are
    /// evicted and the rest are told they left.
    fn send_to_all(&mut self, frame: &RelayFrame) {
        let mut overflowed = Vec::new();
        for (participant_id, member) in &self.members {
            match member.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_frame)) => overflowed.push(*participant_id),
                Err(TrySendError::Closed(_frame)) => {
                    // Writer task ended; the reader reports the leave.
                }
            }
        }
        for participant_id in overflowed {
            // Dropping the sender stops the member's writer.
            if let Some(member) = self.members.remove(&participant_id) {
                warn!(
                    "Evicting {} ({}): {} frames unread",
                    member.name, participant_id, MEMBER_QUEUE_FRAMES
                );
                self.send_to_all(&RelayFrame::MemberLeft { participant_id });
            }
        }
    }
}

pub(super) async fn run_room(mut events: mpsc::UnboundedReceiver<RoomEvent>) {
    let mut room = Room::default();
    while let Some(event) = events.recv().await {
        room.handle(event);
    }
}
