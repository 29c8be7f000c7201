use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use crate::protocol::{Member, ParticipantId};

/// A gossiped time value and the local instant it arrived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimedValue {
    value: f64,
    received_at: Instant,
}

impl TimedValue {
    pub(crate) const fn new(value: f64, received_at: Instant) -> Self {
        Self { value, received_at }
    }

    /// `value + (now - received_at)` in seconds.
    pub(crate) fn extrapolate(&self, now: Instant) -> f64 {
        self.value + now.saturating_duration_since(self.received_at).as_secs_f64()
    }
}

/// What is known about one room member.
#[derive(Debug, Clone, Default)]
pub struct PeerLiveState {
    name: Option<String>,
    replay_time: Option<TimedValue>,
    preview_time: Option<TimedValue>,
    audio_level: f32,
    visible_to: BTreeSet<ParticipantId>,
    download_done: bool,
}

impl PeerLiveState {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn replay_time_at(&self, now: Instant) -> Option<f64> {
        self.replay_time.map(|time| time.extrapolate(now))
    }

    #[must_use]
    pub fn preview_time_at(&self, now: Instant) -> Option<f64> {
        self.preview_time.map(|time| time.extrapolate(now))
    }

    /// Preview position when the peer is previewing, its replay position
    /// otherwise.
    #[must_use]
    pub fn portal_time_at(&self, now: Instant) -> Option<f64> {
        self.preview_time_at(now)
            .or_else(|| self.replay_time_at(now))
    }

    #[must_use]
    pub const fn audio_level(&self) -> f32 {
        self.audio_level
    }

    /// Members that report this peer as visible.
    #[must_use]
    pub const fn visible_to(&self) -> &BTreeSet<ParticipantId> {
        &self.visible_to
    }

    #[must_use]
    pub const fn download_done(&self) -> bool {
        self.download_done
    }

    pub(crate) fn set_replay_time(&mut self, time: f64, now: Instant) {
        self.replay_time = Some(TimedValue::new(time, now));
    }

    pub(crate) fn set_preview_time(&mut self, time: f64, now: Instant) {
        self.preview_time = Some(TimedValue::new(time, now));
    }

    pub(crate) fn set_audio_level(&mut self, level: f32) {
        self.audio_level = level;
    }

    pub(crate) fn set_download_done(&mut self, done: bool) {
        self.download_done = done;
    }
}

/// Live state of every member currently in the room, self included.
///
/// Entries exist only for members; [`PeerRegistry::remove`] drops a departed
/// member everywhere it is referenced, so aggregate reads never see it.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<ParticipantId, PeerLiveState>,
}

impl PeerRegistry {
    pub(crate) fn seat(&mut self, member: &Member) {
        self.upsert(member.participant_id).name = Some(member.name.clone());
    }

    pub(crate) fn upsert(&mut self, participant_id: ParticipantId) -> &mut PeerLiveState {
        self.peers.entry(participant_id).or_default()
    }

    pub(crate) fn remove(&mut self, participant_id: ParticipantId) -> Option<PeerLiveState> {
        let removed = self.peers.remove(&participant_id);
        for peer in self.peers.values_mut() {
            peer.visible_to.remove(&participant_id);
        }
        removed
    }

    /// Records whether `observer` currently sees `target`.
    pub(crate) fn set_visibility(
        &mut self,
        observer: ParticipantId,
        target: ParticipantId,
        visible: bool,
    ) {
        if !self.peers.contains_key(&target) {
            return;
        }
        let peer = self.upsert(target);
        if visible {
            peer.visible_to.insert(observer);
        } else {
            peer.visible_to.remove(&observer);
        }
    }

    pub(crate) fn clear_download_flags(&mut self) {
        for peer in self.peers.values_mut() {
            peer.download_done = false;
        }
    }

    /// True iff the room is non-empty and every member reported its
    /// downloads done. Members that never reported count as not ready.
    #[must_use]
    pub fn snapshot_ready(&self) -> bool {
        !self.peers.is_empty() && self.peers.values().all(|peer| peer.download_done)
    }

    /// Lowest seated participant id.
    #[must_use]
    pub fn leader(&self) -> Option<ParticipantId> {
        self.peers.keys().next().copied()
    }

    #[must_use]
    pub fn get(&self, participant_id: ParticipantId) -> Option<&PeerLiveState> {
        self.peers.get(&participant_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParticipantId, &PeerLiveState)> {
        self.peers.iter().map(|(id, peer)| (*id, peer))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
