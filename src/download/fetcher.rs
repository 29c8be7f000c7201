use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::error::{AppError, AppResult, DownloadError};

use super::artifact::ArtifactKind;
use super::listing::parse_listing;

const LISTING_ENDPOINT: &str = "all_recording_names";

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub server: Url,
    pub kind: ArtifactKind,
    pub replay_file: String,
    pub dest: PathBuf,
}

/// Retrieves one artifact into `request.dest`.
///
/// Implementations must leave `dest` absent unless the whole artifact was
/// written.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> AppResult<()>;
}

/// `GET {server}/{endpoint}/{file}` over reqwest.
///
/// `timeout` bounds each wait on the server (connect, response headers and
/// every body chunk), not the whole transfer, so a slow but steady download
/// is never cut off.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    stall_timeout: Duration,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|err| AppError::download(DownloadError::BuildClientFailed { source: err }))?;
        Ok(Self {
            client,
            stall_timeout: timeout,
        })
    }

    /// Names of the replays the server offers.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the body cannot be parsed.
    pub async fn list_recordings(&self, server: &Url) -> AppResult<Vec<String>> {
        let url = join_server_path(server, LISTING_ENDPOINT)?;
        let response = self.get(&url).await?;
        let body = tokio::time::timeout(self.stall_timeout, response.text())
            .await
            .map_err(|_err| stalled(&url, self.stall_timeout))?
            .map_err(|err| {
                AppError::download(DownloadError::BodyFailed {
                    url: url.to_string(),
                    source: err,
                })
            })?;
        parse_listing(url.as_str(), &body)
    }

    async fn get(&self, url: &Url) -> AppResult<reqwest::Response> {
        let request = self.client.get(url.clone()).send();
        let response = tokio::time::timeout(self.stall_timeout, request)
            .await
            .map_err(|_err| stalled(url, self.stall_timeout))?
            .map_err(|err| {
                AppError::download(DownloadError::RequestFailed {
                    url: url.to_string(),
                    source: err,
                })
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::download(DownloadError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }
        Ok(response)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> AppResult<()> {
        let url = artifact_url(&request.server, request.kind, &request.replay_file)?;
        debug!("Fetching {} from {}", request.kind, url);
        let response = self.get(&url).await?;
        let part = part_path(&request.dest);
        let written = stream_to_file(response, &url, &part, self.stall_timeout).await;
        if let Err(err) = written {
            if let Err(remove_err) = tokio::fs::remove_file(&part).await {
                debug!("Failed to remove {}: {}", part.display(), remove_err);
            }
            return Err(err);
        }
        tokio::fs::rename(&part, &request.dest)
            .await
            .map_err(|err| {
                AppError::download(DownloadError::WriteFile {
                    path: request.dest.clone(),
                    source: err,
                })
            })
    }
}

/// URL of `kind` for `replay_file` on `server`.
///
/// # Errors
///
/// Returns an error when the URL cannot be joined.
pub fn artifact_url(server: &Url, kind: ArtifactKind, replay_file: &str) -> AppResult<Url> {
    join_server_path(server, &format!("{}/{}", kind.endpoint(), replay_file))
}

fn join_server_path(server: &Url, path: &str) -> AppResult<Url> {
    let mut base = server.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path).map_err(|err| {
        AppError::download(DownloadError::JoinUrlFailed {
            url: server.to_string(),
            source: err,
        })
    })
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn stalled(url: &Url, after: Duration) -> AppError {
    AppError::download(DownloadError::Stalled {
        url: url.to_string(),
        after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
    })
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &Url,
    path: &Path,
    stall_timeout: Duration,
) -> AppResult<()> {
    let write_error = |err: std::io::Error| {
        AppError::download(DownloadError::WriteFile {
            path: path.to_path_buf(),
            source: err,
        })
    };
    let mut file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut stream = response.bytes_stream();
    loop {
        let Some(chunk) = tokio::time::timeout(stall_timeout, stream.next())
            .await
            .map_err(|_err| stalled(url, stall_timeout))?
        else {
            break;
        };
        let bytes = chunk.map_err(|err| {
            AppError::download(DownloadError::BodyFailed {
                url: url.to_string(),
                source: err,
            })
        })?;
        file.write_all(&bytes).await.map_err(write_error)?;
    }
    file.flush().await.map_err(write_error)?;
    Ok(())
}
