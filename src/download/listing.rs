use crate::error::{AppError, AppResult, DownloadError};

/// Parses the recording list, either a JSON array of names or one name per
/// line.
///
/// # Errors
///
/// Returns an error when the body looks like JSON but is not a string array.
pub fn parse_listing(url: &str, body: &str) -> AppResult<Vec<String>> {
    let trimmed = body.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(trimmed).map_err(|err| {
            AppError::download(DownloadError::ParseListing {
                url: url.to_owned(),
                source: err,
            })
        });
    }
    Ok(trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}
