use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::download::RetryPolicy;
use crate::protocol::RecorderId;

pub const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BARRIER_POLL: Duration = Duration::from_millis(5);
pub const DEFAULT_CACHE_DIR: &str = "replays";

/// Per-participant protocol settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub name: String,
    pub recorder_id: RecorderId,
    /// Artifact servers; `SwitchSelectedServer` indexes into this list.
    pub servers: Vec<Url>,
    pub cache_dir: PathBuf,
    /// Lead time added to "now" when scheduling a barrier transition.
    pub guard_interval: Duration,
    pub tick_interval: Duration,
    pub barrier_poll: Duration,
    pub retry: RetryPolicy,
}

impl SessionSettings {
    #[must_use]
    pub fn new(name: &str, recorder_id: RecorderId) -> Self {
        Self {
            name: name.to_owned(),
            recorder_id,
            servers: Vec::new(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            guard_interval: DEFAULT_GUARD_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            barrier_poll: DEFAULT_BARRIER_POLL,
            retry: RetryPolicy::default(),
        }
    }
}
