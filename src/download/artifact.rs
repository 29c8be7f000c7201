use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, DownloadError};

/// One of the four files that make up a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Transform,
    Sound,
    Meta,
    Arb,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Transform,
        ArtifactKind::Sound,
        ArtifactKind::Meta,
        ArtifactKind::Arb,
    ];

    /// Path segment on the content server.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            ArtifactKind::Transform => "get_transform_recording",
            ArtifactKind::Sound => "get_sound_recording",
            ArtifactKind::Meta => "get_meta_recording",
            ArtifactKind::Arb => "get_arb_recording",
        }
    }

    #[must_use]
    pub const fn cache_suffix(self) -> &'static str {
        match self {
            ArtifactKind::Transform => ".transform",
            ArtifactKind::Sound => ".wav",
            ArtifactKind::Meta => ".meta",
            ArtifactKind::Arb => ".arb",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Transform => "transform",
            ArtifactKind::Sound => "sound",
            ArtifactKind::Meta => "meta",
            ArtifactKind::Arb => "arb",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local cache location of `kind` for `replay_file`.
#[must_use]
pub fn cache_path(cache_dir: &Path, replay_file: &str, kind: ArtifactKind) -> PathBuf {
    cache_dir.join(format!("{}{}", replay_file, kind.cache_suffix()))
}

/// Replay names end up in URLs and file names, so they must be a single
/// plain path segment.
///
/// # Errors
///
/// Returns an error for empty names, separators, dot segments and
/// URL-significant characters.
pub fn validate_replay_name(name: &str) -> AppResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | '?' | '#' | '%') || ch.is_control());
    if invalid {
        return Err(AppError::download(DownloadError::InvalidReplayName {
            name: name.to_owned(),
        }));
    }
    Ok(())
}
