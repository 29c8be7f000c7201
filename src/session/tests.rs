use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::clock::{Clock, ClockSync, ManualClock, Timestamp};
use crate::download::{ArtifactFetcher, ArtifactKind, FetchRequest, RetryPolicy, cache_path};
use crate::error::{AppError, AppResult, DownloadError};
use crate::protocol::{Envelope, Member, ParticipantId, RecorderId, SessionMessage};
use crate::transport::{MemoryHub, Transport, TransportEvent};

use super::{
    BarrierFired, BarrierOutcome, LatencyMonitor, Phase, PeerRegistry, SessionCommand,
    SessionHooks, SessionProtocol, SessionSettings, TransitionKind, parse_command, wait_for_instant,
};

const SESSION: RecorderId = RecorderId(7);
const GUARD: Duration = Duration::from_millis(40);
const TICK: Duration = Duration::from_millis(10);
const STEP: Duration = Duration::from_millis(2);
const MAX_STEPS: usize = 1500;

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: std::future::Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::session(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

#[derive(Debug, Clone, PartialEq)]
enum HookCall {
    Arm,
    StartRecording,
    StopRecording,
    StartReplay(String),
    StopReplay,
    Paused(bool),
}

#[derive(Clone, Default)]
struct RecordingHooks {
    calls: Arc<Mutex<Vec<HookCall>>>,
    visible: Arc<Mutex<BTreeSet<ParticipantId>>>,
}

impl RecordingHooks {
    fn see(&self, peer: ParticipantId) {
        if let Ok(mut visible) = self.visible.lock() {
            visible.insert(peer);
        }
    }

    fn push(&self, call: HookCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn calls(&self) -> Vec<HookCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn count(&self, call: &HookCall) -> usize {
        self.calls().iter().filter(|seen| *seen == call).count()
    }
}

impl SessionHooks for RecordingHooks {
    fn arm_recording(&mut self, _recorder_id: RecorderId) {
        self.push(HookCall::Arm);
    }

    fn start_recording(&mut self, _recorder_id: RecorderId) {
        self.push(HookCall::StartRecording);
    }

    fn stop_recording(&mut self, _recorder_id: RecorderId) {
        self.push(HookCall::StopRecording);
    }

    fn start_replay(&mut self, replay_file: &str) {
        self.push(HookCall::StartReplay(replay_file.to_owned()));
    }

    fn stop_replay(&mut self) {
        self.push(HookCall::StopReplay);
    }

    fn set_paused(&mut self, paused: bool) {
        self.push(HookCall::Paused(paused));
    }

    fn audio_level(&self) -> f32 {
        0.5
    }

    fn visible_peers(&self) -> BTreeSet<ParticipantId> {
        self.visible
            .lock()
            .map(|visible| visible.clone())
            .unwrap_or_default()
    }
}

/// Succeeds after the configured number of failures per artifact.
#[derive(Default)]
struct StubFetcher {
    failures: BTreeMap<ArtifactKind, u32>,
    calls: Mutex<BTreeMap<ArtifactKind, u32>>,
}

impl StubFetcher {
    fn calls(&self, kind: ArtifactKind) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactFetcher for StubFetcher {
    async fn fetch(&self, request: FetchRequest) -> AppResult<()> {
        let call = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_err| AppError::session("fetcher lock poisoned"))?;
            let entry = calls.entry(request.kind).or_insert(0);
            *entry += 1;
            *entry
        };
        if call <= self.failures.get(&request.kind).copied().unwrap_or(0) {
            return Err(AppError::download(DownloadError::UnexpectedStatus {
                url: request.kind.endpoint().to_owned(),
                status: 500,
            }));
        }
        tokio::fs::write(&request.dest, b"artifact").await?;
        Ok(())
    }
}

struct TestClient {
    protocol: SessionProtocol,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    barriers: mpsc::UnboundedReceiver<BarrierFired>,
    hooks: RecordingHooks,
    fired: Vec<BarrierFired>,
}

impl TestClient {
    /// Applies every queued transport event and barrier firing.
    fn pump(&mut self) -> AppResult<()> {
        while let Ok(event) = self.events.try_recv() {
            self.protocol.handle_transport_event(event)?;
        }
        while let Ok(fired) = self.barriers.try_recv() {
            self.fired.push(fired);
            self.protocol.handle_barrier(fired);
        }
        Ok(())
    }

    fn deliver(&mut self, sender: ParticipantId, message: SessionMessage) -> AppResult<()> {
        self.protocol.handle_envelope(Envelope { sender, message })
    }

    fn id(&self) -> ParticipantId {
        self.protocol.participant_id()
    }
}

fn settings(name: &str, cache_dir: &Path) -> AppResult<SessionSettings> {
    let mut settings = SessionSettings::new(name, SESSION);
    settings.servers = vec![
        Url::parse("http://content-a.test").map_err(|err| AppError::session(err.to_string()))?,
        Url::parse("http://content-b.test").map_err(|err| AppError::session(err.to_string()))?,
    ];
    settings.cache_dir = cache_dir.to_path_buf();
    settings.guard_interval = GUARD;
    settings.tick_interval = TICK;
    settings.barrier_poll = Duration::from_millis(1);
    settings.retry =
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4)).without_jitter();
    Ok(settings)
}

fn join(
    hub: &MemoryHub,
    name: &str,
    cache_dir: &Path,
    clock: Arc<dyn Clock>,
    fetcher: Arc<StubFetcher>,
) -> AppResult<TestClient> {
    let connection = hub.join(name);
    let hooks = RecordingHooks::default();
    let (protocol, barriers) = SessionProtocol::new(
        settings(name, cache_dir)?,
        clock,
        Box::new(connection.transport),
        &connection.members,
        Box::new(hooks.clone()),
        fetcher,
    );
    Ok(TestClient {
        protocol,
        events: connection.events,
        barriers,
        hooks,
        fired: Vec::new(),
    })
}

fn expect_phase(client: &TestClient, phase: Phase) -> AppResult<()> {
    if client.protocol.phase() != phase {
        return Err(AppError::session(format!(
            "{} expected {}, got {}",
            client.id(),
            phase,
            client.protocol.phase()
        )));
    }
    Ok(())
}

/// Pumps until `done` holds, letting spawned tasks run between rounds.
async fn drive<F>(clients: &mut [TestClient], ticks: bool, done: F) -> AppResult<()>
where
    F: Fn(&[TestClient]) -> bool,
{
    let mut last_tick = Instant::now();
    for _ in 0..MAX_STEPS {
        let tick_due = ticks && last_tick.elapsed() >= TICK;
        for client in clients.iter_mut() {
            if tick_due {
                client.protocol.tick()?;
            }
            client.pump()?;
        }
        if tick_due {
            last_tick = Instant::now();
        }
        if done(clients) {
            return Ok(());
        }
        tokio::time::sleep(STEP).await;
    }
    Err(AppError::session("Condition not reached in time"))
}

fn count_kind(tap: &mut mpsc::UnboundedReceiver<Envelope>, kind: &str) -> usize {
    let mut count = 0;
    while let Ok(envelope) = tap.try_recv() {
        if envelope.message.kind() == kind {
            count += 1;
        }
    }
    count
}

#[test]
fn start_recording_fires_within_guard_of_target() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock: Arc<dyn Clock> = Arc::new(ClockSync::local());
        let mut clients = vec![
            join(&hub, "a", dir.path(), Arc::clone(&clock), Arc::default())?,
            join(&hub, "b", dir.path(), Arc::clone(&clock), Arc::default())?,
        ];

        if let Some(first) = clients.first_mut() {
            first.protocol.request_prepare_recording()?;
        }
        drive(&mut clients, false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::PreparingRecord)
        })
        .await?;

        if let Some(second) = clients.get_mut(1) {
            second.protocol.request_start_recording()?;
        }
        drive(&mut clients, false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Recording)
        })
        .await?;

        let bound = GUARD.saturating_add(TICK);
        for client in &clients {
            let Some(fired) = client.fired.first() else {
                return Err(AppError::session("Expected a barrier firing"));
            };
            if fired.kind != TransitionKind::StartRecording {
                return Err(AppError::session(format!("Unexpected firing {:?}", fired)));
            }
            let skew = fired.fired_at.saturating_duration_since(fired.target);
            if skew > bound {
                return Err(AppError::session(format!("Fired {:?} after target", skew)));
            }
            if client.hooks.count(&HookCall::StartRecording) != 1 {
                return Err(AppError::session("Expected exactly one recording start"));
            }
        }
        Ok(())
    })
}

#[test]
fn foreign_session_messages_change_nothing() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(1_000_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let other = hub.join("b");
        let sender = other.transport.participant_id();
        client.pump()?;
        let foreign = RecorderId(8);
        let target = Timestamp::from_millis(1_000_010);

        let messages = vec![
            SessionMessage::PrepareRecording { recorder_id: foreign },
            SessionMessage::StartRecording { target, recorder_id: foreign },
            SessionMessage::StartDownload {
                replay_file: "session42".to_owned(),
                recorder_id: foreign,
            },
            SessionMessage::UpdateDownloadStatus {
                download_done: true,
                recorder_id: foreign,
            },
            SessionMessage::TogglePlayPause { paused: true, recorder_id: foreign },
            SessionMessage::UpdateUserReplayTime { time: 3.0, recorder_id: foreign },
            SessionMessage::UpdateUserPreviewTime { time: 4.0, recorder_id: foreign },
            SessionMessage::UpdateUserAudioLevel { level: 0.9, recorder_id: foreign },
            SessionMessage::UpdateUserVisibility {
                target_peer: client.id(),
                visible: true,
                recorder_id: foreign,
            },
            SessionMessage::SwitchSelectedServer { server_index: 1, recorder_id: foreign },
        ];

        for phase_setup in [false, true] {
            if phase_setup {
                client.deliver(sender, SessionMessage::PrepareRecording { recorder_id: SESSION })?;
                expect_phase(&client, Phase::PreparingRecord)?;
            }
            let before = client.protocol.snapshot();
            let calls_before = client.hooks.calls().len();
            for message in messages.clone() {
                client.deliver(sender, message)?;
            }
            clock.advance(Duration::from_millis(50));
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.pump()?;

            if client.protocol.snapshot() != before {
                return Err(AppError::session("Foreign messages mutated the snapshot"));
            }
            if client.hooks.calls().len() != calls_before || !client.fired.is_empty() {
                return Err(AppError::session("Foreign messages caused local effects"));
            }
        }
        Ok(())
    })
}

#[test]
fn duplicate_end_recording_stops_once() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(5_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let me = client.id();

        client.deliver(me, SessionMessage::PrepareRecording { recorder_id: SESSION })?;
        client.deliver(
            me,
            SessionMessage::StartRecording {
                target: Timestamp::from_millis(5_010),
                recorder_id: SESSION,
            },
        )?;
        clock.advance(Duration::from_millis(10));
        drive(std::slice::from_mut(&mut client), false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Recording)
        })
        .await?;

        let end = SessionMessage::EndRecording {
            target: Timestamp::from_millis(5_030),
            recorder_id: SESSION,
        };
        client.deliver(me, end.clone())?;
        client.deliver(me, end.clone())?;
        clock.advance(Duration::from_millis(20));
        drive(std::slice::from_mut(&mut client), false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Idle)
        })
        .await?;

        // Late redelivery while idle arms again but must not apply.
        client.deliver(me, end)?;
        clock.advance(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.pump()?;

        expect_phase(&client, Phase::Idle)?;
        if client.hooks.count(&HookCall::StopRecording) != 1 {
            return Err(AppError::session(format!(
                "Expected one stop, got {:?}",
                client.hooks.calls()
            )));
        }
        let end_firings = client
            .fired
            .iter()
            .filter(|fired| fired.kind == TransitionKind::EndRecording)
            .count();
        if end_firings != 2 {
            return Err(AppError::session(format!(
                "Expected the first duplicate to be coalesced, saw {} firings",
                end_firings
            )));
        }
        Ok(())
    })
}

#[test]
fn readiness_waits_for_every_seated_member() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        for kind in ArtifactKind::ALL {
            std::fs::write(cache_path(dir.path(), "session42", kind), b"cached")?;
        }
        let hub = MemoryHub::new();
        let mut tap = hub.tap();
        let clock = Arc::new(ManualClock::at(10_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let peer_b = hub.join("b");
        let peer_c = hub.join("c");
        let b = peer_b.transport.participant_id();
        let c = peer_c.transport.participant_id();
        client.pump()?;

        client.protocol.request_start_download("session42")?;
        client.pump()?;
        expect_phase(&client, Phase::PreparingReplay)?;

        client.protocol.tick()?;
        client.pump()?;
        if !client.protocol.downloads().is_complete() {
            return Err(AppError::session("Cached artifacts should be complete"));
        }
        if client.protocol.all_ready() {
            return Err(AppError::session("Ready before peers reported"));
        }

        let done = |download_done| SessionMessage::UpdateDownloadStatus {
            download_done,
            recorder_id: SESSION,
        };
        client.deliver(b, done(true))?;
        client.deliver(c, done(false))?;
        if client.protocol.all_ready() {
            return Err(AppError::session("Ready while a member reported not done"));
        }
        client.deliver(c, done(true))?;
        if !client.protocol.all_ready() {
            return Err(AppError::session("Expected ready once every member reported"));
        }
        client.deliver(c, done(true))?;
        client.protocol.tick()?;
        client.pump()?;
        if count_kind(&mut tap, "start_replay") != 1 {
            return Err(AppError::session("Expected exactly one start_replay"));
        }
        Ok(())
    })
}

#[test]
fn departed_member_no_longer_blocks_readiness() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        for kind in ArtifactKind::ALL {
            std::fs::write(cache_path(dir.path(), "take1", kind), b"cached")?;
        }
        let hub = MemoryHub::new();
        let mut tap = hub.tap();
        let clock = Arc::new(ManualClock::at(10_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let peer_b = hub.join("b");
        let b = peer_b.transport.participant_id();

        client.protocol.request_start_download("take1")?;
        client.pump()?;
        client.protocol.tick()?;
        client.pump()?;
        if !client.protocol.downloads().is_complete() || client.protocol.all_ready() {
            return Err(AppError::session("Silent member must count as not ready"));
        }

        drop(peer_b);
        client.pump()?;
        if client.protocol.peers().get(b).is_some() {
            return Err(AppError::session("Departed member still in registry"));
        }
        if count_kind(&mut tap, "start_replay") != 1 {
            return Err(AppError::session("Expected start_replay after the leave"));
        }
        Ok(())
    })
}

#[test]
fn end_replay_abandons_download() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(1_000));
        let fetcher = Arc::new(StubFetcher {
            failures: BTreeMap::from([(ArtifactKind::Arb, u32::MAX)]),
            ..StubFetcher::default()
        });
        let mut client = join(&hub, "a", dir.path(), clock.clone(), fetcher)?;

        client.protocol.request_start_download("take9")?;
        client.pump()?;
        expect_phase(&client, Phase::PreparingReplay)?;
        client.protocol.request_end_replay()?;
        client.pump()?;
        clock.advance(GUARD);
        drive(std::slice::from_mut(&mut client), false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Idle)
        })
        .await?;

        if client.protocol.downloads().replay_file().is_some() {
            return Err(AppError::session("Download survived the abandon"));
        }
        if client.hooks.count(&HookCall::StopReplay) != 0 {
            return Err(AppError::session("Replay was never started"));
        }
        Ok(())
    })
}

#[test]
fn late_barrier_still_applies() -> AppResult<()> {
    run_async_test(async {
        let clock = ManualClock::at(2_000);
        let outcome =
            wait_for_instant(&clock, Timestamp::from_millis(1_250), Duration::from_millis(1)).await;
        if outcome != (BarrierOutcome::Late { by_ms: 750 }) {
            return Err(AppError::session(format!("Unexpected outcome {:?}", outcome)));
        }

        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(2_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let me = client.id();
        client.deliver(me, SessionMessage::PrepareRecording { recorder_id: SESSION })?;
        client.deliver(
            me,
            SessionMessage::StartRecording {
                target: Timestamp::from_millis(1_000),
                recorder_id: SESSION,
            },
        )?;
        drive(std::slice::from_mut(&mut client), false, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Recording)
        })
        .await?;
        match client.fired.first() {
            Some(fired) if fired.outcome == (BarrierOutcome::Late { by_ms: 1_000 }) => Ok(()),
            other => Err(AppError::session(format!("Unexpected firing {:?}", other))),
        }
    })
}

#[test]
fn pause_toggles_are_idempotent() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(1_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let me = client.id();
        let pause = SessionMessage::TogglePlayPause {
            paused: true,
            recorder_id: SESSION,
        };

        client.deliver(me, pause.clone())?;
        if client.protocol.is_paused() {
            return Err(AppError::session("Pause must be ignored while idle"));
        }
        if client.protocol.request_set_paused(true).is_ok() {
            return Err(AppError::session("Pause request accepted while idle"));
        }

        client.deliver(me, SessionMessage::PrepareRecording { recorder_id: SESSION })?;
        client.deliver(me, pause.clone())?;
        client.deliver(me, pause)?;
        if !client.protocol.is_paused() || client.hooks.count(&HookCall::Paused(true)) != 1 {
            return Err(AppError::session("Expected a single pause effect"));
        }
        Ok(())
    })
}

#[test]
fn switch_server_validates_index() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(1_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let me = client.id();

        if client.protocol.request_switch_server(5).is_ok() {
            return Err(AppError::session("Out of range server accepted"));
        }
        client.deliver(
            me,
            SessionMessage::SwitchSelectedServer {
                server_index: 9,
                recorder_id: SESSION,
            },
        )?;
        if client.protocol.selected_server() != 0 {
            return Err(AppError::session("Invalid index changed the server"));
        }
        client.protocol.request_switch_server(1)?;
        client.pump()?;
        if client.protocol.selected_server() != 1 {
            return Err(AppError::session("Expected server #1 to be selected"));
        }
        Ok(())
    })
}

#[test]
fn select_session_only_while_idle() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::at(1_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let me = client.id();

        client.protocol.select_session(RecorderId(9))?;
        if client.protocol.recorder_id() != RecorderId(9) {
            return Err(AppError::session("Session was not switched"));
        }
        client.deliver(me, SessionMessage::PrepareRecording { recorder_id: SESSION })?;
        expect_phase(&client, Phase::Idle)?;
        client.deliver(me, SessionMessage::PrepareRecording { recorder_id: RecorderId(9) })?;
        expect_phase(&client, Phase::PreparingRecord)?;
        if client.protocol.select_session(SESSION).is_ok() {
            return Err(AppError::session("Session switch accepted mid-session"));
        }
        Ok(())
    })
}

#[test]
fn round_trip_is_measured_from_own_echo() -> AppResult<()> {
    run_async_test(async {
        let dir = tempfile::tempdir()?;
        let hub = MemoryHub::new();
        hub.set_duplicate_delivery(true);
        let clock = Arc::new(ManualClock::at(1_000));
        let mut client = join(&hub, "a", dir.path(), clock.clone(), Arc::default())?;
        let mut other = join(&hub, "b", dir.path(), clock.clone(), Arc::default())?;
        client.pump()?;

        client.protocol.measure_round_trip()?;
        clock.advance(Duration::from_millis(12));
        client.pump()?;
        other.pump()?;

        if client.protocol.snapshot().round_trip != Some(Duration::from_millis(12)) {
            return Err(AppError::session("Expected a 12ms round trip"));
        }
        if other.protocol.snapshot().round_trip.is_some() {
            return Err(AppError::session("Only the sender measures the round trip"));
        }
        Ok(())
    })
}

#[test]
fn failed_round_trip_send_is_not_awaited() -> AppResult<()> {
    run_async_test(async {
        let hub = MemoryHub::new();
        let dir = tempfile::tempdir()?;
        let clock = Arc::new(ManualClock::at(1_000));
        let fetcher: Arc<StubFetcher> = Arc::default();
        let connection = hub.join("a");
        connection.transport.leave();
        let (mut protocol, _barriers) = SessionProtocol::new(
            settings("a", dir.path())?,
            clock.clone(),
            Box::new(connection.transport),
            &connection.members,
            Box::new(RecordingHooks::default()),
            fetcher,
        );

        if protocol.measure_round_trip().is_ok() {
            return Err(AppError::session("Broadcast after leaving should fail"));
        }
        clock.advance(Duration::from_millis(5));
        let sender = protocol.participant_id();
        protocol.handle_envelope(Envelope {
            sender,
            message: SessionMessage::RoundTrip {
                send_instant: Timestamp::from_millis(1_000),
            },
        })?;
        if protocol.snapshot().round_trip.is_some() {
            return Err(AppError::session("Timed a message that never left"));
        }
        Ok(())
    })
}

#[test]
fn unanswered_round_trips_are_capped() -> AppResult<()> {
    let mut monitor = LatencyMonitor::default();
    for ms in 0..100 {
        monitor.sent(Timestamp::from_millis(ms));
    }
    if monitor.outstanding() != 16 {
        return Err(AppError::session(format!(
            "Expected 16 outstanding, got {}",
            monitor.outstanding()
        )));
    }
    // The oldest were forgotten; the newest still resolve.
    if monitor
        .observe(Timestamp::from_millis(0), Timestamp::from_millis(200))
        .is_some()
    {
        return Err(AppError::session("Evicted send was still timed"));
    }
    match monitor.observe(Timestamp::from_millis(99), Timestamp::from_millis(130)) {
        Some(elapsed) if elapsed == Duration::from_millis(31) => {}
        other => return Err(AppError::session(format!("Unexpected round trip {:?}", other))),
    }
    if monitor
        .observe(Timestamp::from_millis(99), Timestamp::from_millis(140))
        .is_some()
    {
        return Err(AppError::session("Duplicate echo was timed twice"));
    }
    Ok(())
}

#[test]
fn registry_prunes_departed_members() -> AppResult<()> {
    let mut registry = PeerRegistry::default();
    if registry.snapshot_ready() {
        return Err(AppError::session("Empty registry must not be ready"));
    }
    let a = ParticipantId(1);
    let b = ParticipantId(2);
    for (participant_id, name) in [(a, "a"), (b, "b")] {
        registry.seat(&Member {
            participant_id,
            name: name.to_owned(),
        });
    }
    registry.set_visibility(b, a, true);
    registry.upsert(a).set_download_done(true);
    if registry.snapshot_ready() {
        return Err(AppError::session("Unreported member must block readiness"));
    }

    registry.remove(b);
    let Some(peer_a) = registry.get(a) else {
        return Err(AppError::session("Member a vanished"));
    };
    if !peer_a.visible_to().is_empty() {
        return Err(AppError::session("Visibility from departed member kept"));
    }
    if !registry.snapshot_ready() || registry.leader() != Some(a) {
        return Err(AppError::session("Remaining member should be ready and lead"));
    }
    registry.clear_download_flags();
    if registry.snapshot_ready() {
        return Err(AppError::session("Cleared flags should not be ready"));
    }
    Ok(())
}

#[test]
fn replay_time_extrapolates_from_receipt() -> AppResult<()> {
    let mut registry = PeerRegistry::default();
    let peer = ParticipantId(3);
    let received_at = Instant::now();
    registry.upsert(peer).set_replay_time(10.0, received_at);

    let Some(state) = registry.get(peer) else {
        return Err(AppError::session("Peer missing"));
    };
    let later = received_at + Duration::from_secs(2);
    let extrapolated = state.replay_time_at(later).unwrap_or(0.0);
    if (extrapolated - 12.0).abs() > 1e-6 {
        return Err(AppError::session(format!("Expected ~12.0, got {}", extrapolated)));
    }
    if state.portal_time_at(later) != Some(extrapolated) {
        return Err(AppError::session("Portal should follow replay time"));
    }

    registry.upsert(peer).set_preview_time(30.0, received_at);
    let Some(state) = registry.get(peer) else {
        return Err(AppError::session("Peer missing"));
    };
    let portal = state.portal_time_at(later).unwrap_or(0.0);
    if (portal - 32.0).abs() > 1e-6 {
        return Err(AppError::session(format!("Expected portal ~32.0, got {}", portal)));
    }
    Ok(())
}

#[test]
fn three_clients_start_replay_once() -> AppResult<()> {
    run_async_test(async {
        let hub = MemoryHub::new();
        hub.set_duplicate_delivery(true);
        let mut tap = hub.tap();
        let clock: Arc<dyn Clock> = Arc::new(ClockSync::local());
        let dirs = [tempfile::tempdir()?, tempfile::tempdir()?, tempfile::tempdir()?];
        let flaky = Arc::new(StubFetcher {
            failures: BTreeMap::from([(ArtifactKind::Sound, 1)]),
            ..StubFetcher::default()
        });

        let mut clients = Vec::new();
        for (index, (name, dir)) in ["a", "b", "c"].iter().zip(dirs.iter()).enumerate() {
            let fetcher = if index == 1 {
                Arc::clone(&flaky)
            } else {
                Arc::new(StubFetcher::default())
            };
            clients.push(join(&hub, name, dir.path(), Arc::clone(&clock), fetcher)?);
        }
        for client in &mut clients {
            client.pump()?;
        }

        if let Some(first) = clients.first_mut() {
            first.protocol.request_start_download("session42")?;
        }
        drive(&mut clients, true, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Replaying)
        })
        .await?;

        if flaky.calls(ArtifactKind::Sound) != 2 || flaky.calls(ArtifactKind::Meta) != 1 {
            return Err(AppError::session("Unexpected fetch counts for client b"));
        }
        if count_kind(&mut tap, "start_replay") != 1 {
            return Err(AppError::session("Expected exactly one start_replay broadcast"));
        }
        let bound = GUARD.saturating_add(TICK);
        for client in &clients {
            let starts = client.hooks.count(&HookCall::StartReplay("session42".to_owned()));
            if starts != 1 {
                return Err(AppError::session(format!(
                    "{} started replay {} times",
                    client.id(),
                    starts
                )));
            }
            let late = client
                .fired
                .iter()
                .filter(|fired| fired.kind == TransitionKind::StartReplay)
                .any(|fired| fired.fired_at.saturating_duration_since(fired.target) > bound);
            if late {
                return Err(AppError::session("Replay started outside the guard bound"));
            }
        }
        Ok(())
    })
}

#[test]
fn replaying_clients_gossip_live_state() -> AppResult<()> {
    run_async_test(async {
        let hub = MemoryHub::new();
        let clock: Arc<dyn Clock> = Arc::new(ClockSync::local());
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;
        let a = join(&hub, "a", dir_a.path(), Arc::clone(&clock), Arc::default())?;
        let b = join(&hub, "b", dir_b.path(), Arc::clone(&clock), Arc::default())?;
        a.hooks.see(b.id());
        let b_id = b.id();
        let mut clients = vec![a, b];
        for client in &mut clients {
            client.pump()?;
        }

        if let Some(first) = clients.first_mut() {
            first.protocol.request_start_download("take3")?;
        }
        drive(&mut clients, true, |clients| {
            clients.iter().all(|c| c.protocol.phase() == Phase::Replaying)
        })
        .await?;
        let a_id = clients.first().map(TestClient::id);
        drive(&mut clients, true, |clients| {
            clients.get(1).is_some_and(|b| {
                a_id.and_then(|a| b.protocol.portal_time(a)).is_some()
                    && b.protocol
                        .peers()
                        .get(b_id)
                        .is_some_and(|peer| a_id.is_some_and(|a| peer.visible_to().contains(&a)))
            })
        })
        .await?;

        let Some(b) = clients.get(1) else {
            return Err(AppError::session("Client b missing"));
        };
        let snapshot = b.protocol.snapshot();
        let Some(peer_a) = snapshot.peers.iter().find(|peer| Some(peer.participant_id) == a_id)
        else {
            return Err(AppError::session("Peer a missing from snapshot"));
        };
        if (peer_a.audio_level - 0.5).abs() > f32::EPSILON {
            return Err(AppError::session("Audio level not gossiped"));
        }
        Ok(())
    })
}

#[test]
fn operator_commands_parse() -> AppResult<()> {
    let cases = [
        ("prepare", SessionCommand::PrepareRecording),
        ("record", SessionCommand::StartRecording),
        ("stop", SessionCommand::EndRecording),
        (
            "download session42",
            SessionCommand::StartDownload {
                replay_file: "session42".to_owned(),
            },
        ),
        ("end", SessionCommand::EndReplay),
        ("pause", SessionCommand::SetPaused(true)),
        ("resume", SessionCommand::SetPaused(false)),
        ("server 2", SessionCommand::SwitchServer(2)),
        ("session 11", SessionCommand::SelectSession(RecorderId(11))),
        ("preview 4.5", SessionCommand::Preview(Some(4.5))),
        ("preview off", SessionCommand::Preview(None)),
        ("PING", SessionCommand::Ping),
        ("status", SessionCommand::Status),
        ("quit", SessionCommand::Quit),
    ];
    for (line, expected) in cases {
        if parse_command(line)? != Some(expected.clone()) {
            return Err(AppError::session(format!("'{}' did not parse to {:?}", line, expected)));
        }
    }
    if parse_command("   ")?.is_some() {
        return Err(AppError::session("Blank line should be ignored"));
    }
    for bad in ["dance", "download", "server x", "session -1", "preview -2"] {
        if parse_command(bad).is_ok() {
            return Err(AppError::session(format!("'{}' should not parse", bad)));
        }
    }
    Ok(())
}
