use std::fmt;
use std::time::Duration;

use crate::protocol::{ParticipantId, RecorderId};

use super::state::Phase;

/// Read-only view of a participant's session, published after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub participant_id: Option<ParticipantId>,
    pub phase: Phase,
    pub recorder_id: RecorderId,
    pub paused: bool,
    pub selected_server: usize,
    pub replay_file: Option<String>,
    pub replay_time: Option<f64>,
    pub preview_time: Option<f64>,
    pub artifacts_downloaded: usize,
    pub all_ready: bool,
    pub round_trip: Option<Duration>,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub participant_id: ParticipantId,
    pub name: Option<String>,
    pub replay_time: Option<f64>,
    pub preview_time: Option<f64>,
    /// Preview time when present, replay time otherwise.
    pub portal_time: Option<f64>,
    pub audio_level: f32,
    pub visible_to: Vec<ParticipantId>,
    pub download_done: bool,
}

fn seconds(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_owned(), |value| format!("{:.2}s", value))
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} phase {} paused {} server #{}",
            self.recorder_id, self.phase, self.paused, self.selected_server
        )?;
        if let Some(file) = self.replay_file.as_deref() {
            write!(
                f,
                " replay '{}' ({}/4 artifacts, ready {}) at {}",
                file,
                self.artifacts_downloaded,
                self.all_ready,
                seconds(self.replay_time)
            )?;
        }
        if let Some(round_trip) = self.round_trip {
            write!(f, " rtt {}ms", round_trip.as_millis())?;
        }
        for peer in &self.peers {
            write!(
                f,
                "\n  {} {} replay {} portal {} audio {:.2} seen by {} done {}",
                peer.participant_id,
                peer.name.as_deref().unwrap_or("?"),
                seconds(peer.replay_time),
                seconds(peer.portal_time),
                peer.audio_level,
                peer.visible_to.len(),
                peer.download_done
            )?;
        }
        Ok(())
    }
}
