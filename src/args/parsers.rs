use std::time::Duration;

use url::Url;

use crate::error::{AppError, AppResult, ValidationError};

pub(crate) fn parse_bool_env(s: &str) -> AppResult<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(AppError::validation(ValidationError::InvalidBoolean {
            value: s.to_owned(),
        })),
    }
}

/// Parses an artifact server base URL; only `http` and `https` are accepted.
pub(crate) fn parse_server_url(s: &str) -> Result<Url, ValidationError> {
    let value = s.trim();
    let url = Url::parse(value).map_err(|err| ValidationError::InvalidServerUrl {
        value: value.to_owned(),
        source: err,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ValidationError::UnsupportedServerScheme {
            value: value.to_owned(),
        }),
    }
}

pub(crate) fn parse_duration_arg(s: &str) -> AppResult<Duration> {
    parse_duration_value(s).map_err(AppError::validation)
}

/// Parses `<digits><unit>` with unit `ms`, `s`, `m` or `h` (seconds when omitted).
pub(crate) fn parse_duration_value(s: &str) -> Result<Duration, ValidationError> {
    let value = s.trim();
    if value.is_empty() {
        return Err(ValidationError::DurationEmpty);
    }

    let mut digits_len = 0usize;
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits_len = digits_len.saturating_add(1);
        } else {
            break;
        }
    }
    if digits_len == 0 {
        return Err(ValidationError::InvalidDurationFormat {
            value: value.to_owned(),
        });
    }
    let (num_part, unit_part) = value.split_at(digits_len);
    let number: u64 = num_part
        .parse()
        .map_err(|err| ValidationError::InvalidDurationNumber {
            value: value.to_owned(),
            source: err,
        })?;

    let unit = if unit_part.is_empty() { "s" } else { unit_part };
    let duration = match unit {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => {
            let secs = number
                .checked_mul(60)
                .ok_or(ValidationError::DurationOverflow)?;
            Duration::from_secs(secs)
        }
        "h" => {
            let secs = number
                .checked_mul(60)
                .and_then(|seconds| seconds.checked_mul(60))
                .ok_or(ValidationError::DurationOverflow)?;
            Duration::from_secs(secs)
        }
        _ => {
            return Err(ValidationError::InvalidDurationUnit {
                unit: unit.to_owned(),
            });
        }
    };

    if duration.is_zero() {
        return Err(ValidationError::DurationZero);
    }

    Ok(duration)
}
