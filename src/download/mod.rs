//! Replay artifact retrieval.
//!
//! A replay is four independently fetched files. [`DownloadCoordinator`]
//! launches one task per artifact, owns every slot's status and relaunches
//! failed slots on the retry policy's schedule until all four are on disk.
mod artifact;
mod coordinator;
mod fetcher;
mod listing;
mod retry;

pub use artifact::{ArtifactKind, cache_path, validate_replay_name};
pub use coordinator::{ArtifactStatus, DownloadCoordinator};
pub use fetcher::{ArtifactFetcher, FetchRequest, HttpFetcher, artifact_url};
pub use listing::parse_listing;
pub use retry::RetryPolicy;
