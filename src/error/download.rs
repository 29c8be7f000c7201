use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to build HTTP client: {source}")]
    BuildClientFailed {
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to join URL '{url}': {source}")]
    JoinUrlFailed {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Request to {url} failed: {source}")]
    RequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Request to {url} returned status {status}.")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("Failed to read body of {url}: {source}")]
    BodyFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("No data from {url} for {after_ms} ms.")]
    Stalled { url: String, after_ms: u64 },
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create cache directory {path}: {source}")]
    CreateCacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid replay file name '{name}'.")]
    InvalidReplayName { name: String },
    #[error("Failed to parse recording list from {url}: {source}")]
    ParseListing {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
