mod app;
mod config;
mod download;
mod session;
mod validation;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use download::DownloadError;
pub use session::SessionError;
pub use validation::ValidationError;
