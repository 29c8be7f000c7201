use std::collections::BTreeSet;

use tracing::info;

use crate::protocol::{ParticipantId, RecorderId};

/// Local effects of session transitions and the live inputs gossiped to
/// peers. Recording, playback and capture live behind this trait.
pub trait SessionHooks: Send {
    fn arm_recording(&mut self, _recorder_id: RecorderId) {}

    fn start_recording(&mut self, _recorder_id: RecorderId) {}

    fn stop_recording(&mut self, _recorder_id: RecorderId) {}

    fn start_replay(&mut self, _replay_file: &str) {}

    fn stop_replay(&mut self) {}

    fn set_paused(&mut self, _paused: bool) {}

    /// Current microphone amplitude.
    fn audio_level(&self) -> f32 {
        0.0
    }

    /// Members currently in view.
    fn visible_peers(&self) -> BTreeSet<ParticipantId> {
        BTreeSet::new()
    }
}

/// Hooks for headless participants: every effect is only logged.
#[derive(Debug, Default)]
pub struct LoggingHooks;

impl SessionHooks for LoggingHooks {
    fn arm_recording(&mut self, recorder_id: RecorderId) {
        info!("Recording armed for session {}", recorder_id);
    }

    fn start_recording(&mut self, recorder_id: RecorderId) {
        info!("Recording started for session {}", recorder_id);
    }

    fn stop_recording(&mut self, recorder_id: RecorderId) {
        info!("Recording stopped for session {}", recorder_id);
    }

    fn start_replay(&mut self, replay_file: &str) {
        info!("Replay of '{}' started", replay_file);
    }

    fn stop_replay(&mut self) {
        info!("Replay stopped");
    }

    fn set_paused(&mut self, paused: bool) {
        info!("Replay {}", if paused { "paused" } else { "resumed" });
    }
}
