use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Duration must not be empty.")]
    DurationEmpty,
    #[error("Invalid duration '{value}'.")]
    InvalidDurationFormat { value: String },
    #[error("Invalid duration '{value}': {source}")]
    InvalidDurationNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Duration overflow.")]
    DurationOverflow,
    #[error("Invalid duration unit '{unit}'.")]
    InvalidDurationUnit { unit: String },
    #[error("Duration must be > 0.")]
    DurationZero,
    #[error("Invalid boolean '{value}'.")]
    InvalidBoolean { value: String },
    #[error("Invalid server url '{value}': {source}")]
    InvalidServerUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Server url '{value}' must use http or https.")]
    UnsupportedServerScheme { value: String },
    #[error("Participant name must not be empty.")]
    EmptyParticipantName,
    #[error("Missing required option: {option}")]
    MissingOption { option: &'static str },
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
