use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Session epoch carried by every session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecorderId(pub u64);

impl RecorderId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecorderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room member identity, assigned by the relay on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub participant_id: ParticipantId,
    pub name: String,
}

/// The session message catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    PrepareRecording {
        recorder_id: RecorderId,
    },
    StartRecording {
        target: Timestamp,
        recorder_id: RecorderId,
    },
    EndRecording {
        target: Timestamp,
        recorder_id: RecorderId,
    },
    StartDownload {
        replay_file: String,
        recorder_id: RecorderId,
    },
    UpdateDownloadStatus {
        download_done: bool,
        recorder_id: RecorderId,
    },
    StartReplay {
        target: Timestamp,
        recorder_id: RecorderId,
    },
    EndReplay {
        target: Timestamp,
        recorder_id: RecorderId,
    },
    TogglePlayPause {
        paused: bool,
        recorder_id: RecorderId,
    },
    UpdateUserReplayTime {
        time: f64,
        recorder_id: RecorderId,
    },
    UpdateUserPreviewTime {
        time: f64,
        recorder_id: RecorderId,
    },
    UpdateUserAudioLevel {
        level: f32,
        recorder_id: RecorderId,
    },
    UpdateUserVisibility {
        target_peer: ParticipantId,
        visible: bool,
        recorder_id: RecorderId,
    },
    SwitchSelectedServer {
        server_index: usize,
        recorder_id: RecorderId,
    },
    RoundTrip {
        send_instant: Timestamp,
    },
}

impl SessionMessage {
    /// Session epoch of the message; `None` for session-less round-trip messages.
    #[must_use]
    pub const fn recorder_id(&self) -> Option<RecorderId> {
        match self {
            SessionMessage::PrepareRecording { recorder_id }
            | SessionMessage::StartRecording { recorder_id, .. }
            | SessionMessage::EndRecording { recorder_id, .. }
            | SessionMessage::StartDownload { recorder_id, .. }
            | SessionMessage::UpdateDownloadStatus { recorder_id, .. }
            | SessionMessage::StartReplay { recorder_id, .. }
            | SessionMessage::EndReplay { recorder_id, .. }
            | SessionMessage::TogglePlayPause { recorder_id, .. }
            | SessionMessage::UpdateUserReplayTime { recorder_id, .. }
            | SessionMessage::UpdateUserPreviewTime { recorder_id, .. }
            | SessionMessage::UpdateUserAudioLevel { recorder_id, .. }
            | SessionMessage::UpdateUserVisibility { recorder_id, .. }
            | SessionMessage::SwitchSelectedServer { recorder_id, .. } => Some(*recorder_id),
            SessionMessage::RoundTrip { .. } => None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SessionMessage::PrepareRecording { .. } => "prepare_recording",
            SessionMessage::StartRecording { .. } => "start_recording",
            SessionMessage::EndRecording { .. } => "end_recording",
            SessionMessage::StartDownload { .. } => "start_download",
            SessionMessage::UpdateDownloadStatus { .. } => "update_download_status",
            SessionMessage::StartReplay { .. } => "start_replay",
            SessionMessage::EndReplay { .. } => "end_replay",
            SessionMessage::TogglePlayPause { .. } => "toggle_play_pause",
            SessionMessage::UpdateUserReplayTime { .. } => "update_user_replay_time",
            SessionMessage::UpdateUserPreviewTime { .. } => "update_user_preview_time",
            SessionMessage::UpdateUserAudioLevel { .. } => "update_user_audio_level",
            SessionMessage::UpdateUserVisibility { .. } => "update_user_visibility",
            SessionMessage::SwitchSelectedServer { .. } => "switch_selected_server",
            SessionMessage::RoundTrip { .. } => "round_trip",
        }
    }
}

/// A broadcast as delivered to members, stamped with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: ParticipantId,
    pub message: SessionMessage,
}

/// Frames sent by a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { name: String },
    Broadcast { message: SessionMessage },
}

/// Frames sent by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum RelayFrame {
    Welcome {
        participant_id: ParticipantId,
        members: Vec<Member>,
    },
    MemberJoined {
        member: Member,
    },
    MemberLeft {
        participant_id: ParticipantId,
    },
    Deliver {
        envelope: Envelope,
    },
}
