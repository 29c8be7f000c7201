use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AppError, AppResult, DownloadError};

use super::artifact::{ArtifactKind, cache_path, validate_replay_name};
use super::fetcher::{ArtifactFetcher, FetchRequest};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Pending,
    InFlight,
    Downloaded,
    Failed,
}

struct ArtifactSlot {
    status: ArtifactStatus,
    attempts: u32,
    retry_at: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl ArtifactSlot {
    const fn pending() -> Self {
        Self {
            status: ArtifactStatus::Pending,
            attempts: 0,
            retry_at: None,
            handle: None,
        }
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct FetchOutcome {
    generation: u64,
    kind: ArtifactKind,
    result: AppResult<()>,
}

struct ActiveDownload {
    server: Url,
    replay_file: String,
}

/// Single owner of the artifact slots of the current replay.
///
/// Fetch tasks only report outcomes over a channel; the coordinator applies
/// them when polled. Outcomes carrying an older generation are discarded.
pub struct DownloadCoordinator {
    fetcher: Arc<dyn ArtifactFetcher>,
    cache_dir: PathBuf,
    retry: RetryPolicy,
    generation: u64,
    active: Option<ActiveDownload>,
    slots: BTreeMap<ArtifactKind, ArtifactSlot>,
    results_tx: mpsc::UnboundedSender<FetchOutcome>,
    results_rx: mpsc::UnboundedReceiver<FetchOutcome>,
}

impl DownloadCoordinator {
    #[must_use]
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, cache_dir: PathBuf, retry: RetryPolicy) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            fetcher,
            cache_dir,
            retry,
            generation: 0,
            active: None,
            slots: BTreeMap::new(),
            results_tx,
            results_rx,
        }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Starts fetching every artifact of `replay_file` from `server`.
    ///
    /// Artifacts already present in the cache directory count as downloaded.
    /// Any previous download is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid replay name or an unusable cache
    /// directory.
    pub fn begin(&mut self, server: Url, replay_file: &str) -> AppResult<()> {
        validate_replay_name(replay_file)?;
        self.cancel();
        std::fs::create_dir_all(&self.cache_dir).map_err(|err| {
            AppError::download(DownloadError::CreateCacheDir {
                path: self.cache_dir.clone(),
                source: err,
            })
        })?;

        info!("Downloading replay '{}' from {}", replay_file, server);
        self.active = Some(ActiveDownload {
            server,
            replay_file: replay_file.to_owned(),
        });
        for kind in ArtifactKind::ALL {
            let mut slot = ArtifactSlot::pending();
            if cache_path(&self.cache_dir, replay_file, kind).exists() {
                debug!("{} for '{}' already cached", kind, replay_file);
                slot.status = ArtifactStatus::Downloaded;
            }
            self.slots.insert(kind, slot);
        }
        for kind in ArtifactKind::ALL {
            if self.status(kind) == Some(ArtifactStatus::Pending) {
                self.launch(kind);
            }
        }
        Ok(())
    }

    /// Points later attempts at `server`. Fetches already in flight finish
    /// against the old one.
    pub fn switch_server(&mut self, server: Url) {
        if let Some(active) = self.active.as_mut() {
            info!("Artifact server switched to {}", server);
            active.server = server;
        }
    }

    /// Applies finished fetches and relaunches failed artifacts whose backoff
    /// has elapsed. Returns whether the replay is still downloading.
    pub fn poll_and_retry_failed(&mut self) -> bool {
        while let Ok(outcome) = self.results_rx.try_recv() {
            self.apply(outcome);
        }
        if self.active.is_none() {
            return false;
        }

        let now = Instant::now();
        let due: Vec<ArtifactKind> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.status == ArtifactStatus::Failed
                    && slot.retry_at.is_none_or(|retry_at| retry_at <= now)
            })
            .map(|(kind, _)| *kind)
            .collect();
        for kind in due {
            self.launch(kind);
        }
        !self.is_complete()
    }

    /// True once all four artifacts of the active replay are on disk.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.active.is_some()
            && ArtifactKind::ALL
                .iter()
                .all(|kind| self.status(*kind) == Some(ArtifactStatus::Downloaded))
    }

    /// Aborts in-flight fetches and forgets the active replay.
    pub fn cancel(&mut self) {
        for slot in self.slots.values_mut() {
            slot.abort();
        }
        self.slots.clear();
        self.generation = self.generation.wrapping_add(1);
        if let Some(active) = self.active.take() {
            debug!("Cancelled download of '{}'", active.replay_file);
        }
    }

    #[must_use]
    pub fn replay_file(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.replay_file.as_str())
    }

    #[must_use]
    pub fn status(&self, kind: ArtifactKind) -> Option<ArtifactStatus> {
        self.slots.get(&kind).map(|slot| slot.status)
    }

    /// Number of fetches launched for `kind` in the active replay.
    #[must_use]
    pub fn attempts(&self, kind: ArtifactKind) -> u32 {
        self.slots.get(&kind).map_or(0, |slot| slot.attempts)
    }

    #[must_use]
    pub fn downloaded_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.status == ArtifactStatus::Downloaded)
            .count()
    }

    fn launch(&mut self, kind: ArtifactKind) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let request = FetchRequest {
            server: active.server.clone(),
            kind,
            replay_file: active.replay_file.clone(),
            dest: cache_path(&self.cache_dir, &active.replay_file, kind),
        };
        let generation = self.generation;
        let fetcher = Arc::clone(&self.fetcher);
        let results_tx = self.results_tx.clone();
        let handle = tokio::spawn(async move {
            let result = fetcher.fetch(request).await;
            if results_tx
                .send(FetchOutcome {
                    generation,
                    kind,
                    result,
                })
                .is_err()
            {
                // Coordinator dropped; nothing left to report to.
            }
        });

        let slot = self.slots.entry(kind).or_insert_with(ArtifactSlot::pending);
        slot.abort();
        slot.status = ArtifactStatus::InFlight;
        slot.attempts = slot.attempts.saturating_add(1);
        slot.retry_at = None;
        slot.handle = Some(handle);
    }

    fn apply(&mut self, outcome: FetchOutcome) {
        if outcome.generation != self.generation {
            debug!("Ignoring {} result from a previous download", outcome.kind);
            return;
        }
        let retry = self.retry;
        let Some(slot) = self.slots.get_mut(&outcome.kind) else {
            return;
        };
        slot.handle = None;
        match outcome.result {
            Ok(()) => {
                slot.status = ArtifactStatus::Downloaded;
                info!(
                    "Downloaded {} after {} attempt(s)",
                    outcome.kind, slot.attempts
                );
            }
            Err(err) => {
                let delay = retry.delay_for(slot.attempts);
                slot.status = ArtifactStatus::Failed;
                slot.retry_at = Instant::now().checked_add(delay);
                warn!(
                    "Fetching {} failed (attempt {}): {}; retrying in {}ms",
                    outcome.kind,
                    slot.attempts,
                    err,
                    delay.as_millis()
                );
            }
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        for slot in self.slots.values_mut() {
            slot.abort();
        }
    }
}
