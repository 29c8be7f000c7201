use super::{ConfigError, DownloadError, SessionError, ValidationError};

impl From<&'static str> for ValidationError {
    fn from(message: &'static str) -> Self {
        ValidationError::TestExpectation { message }
    }
}

impl From<String> for ValidationError {
    fn from(value: String) -> Self {
        ValidationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for SessionError {
    fn from(message: &'static str) -> Self {
        SessionError::TestExpectation { message }
    }
}

impl From<String> for SessionError {
    fn from(value: String) -> Self {
        SessionError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for DownloadError {
    fn from(message: &'static str) -> Self {
        DownloadError::TestExpectation { message }
    }
}

impl From<String> for DownloadError {
    fn from(value: String) -> Self {
        DownloadError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
