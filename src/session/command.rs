use crate::error::{AppError, AppResult, SessionError};
use crate::protocol::RecorderId;

/// Operator request, one per stdin line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    PrepareRecording,
    StartRecording,
    EndRecording,
    StartDownload { replay_file: String },
    EndReplay,
    SetPaused(bool),
    SwitchServer(usize),
    SelectSession(RecorderId),
    Preview(Option<f64>),
    Ping,
    Status,
    Quit,
}

/// Parses an operator line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns an error for unknown commands and bad arguments.
pub fn parse_command(line: &str) -> AppResult<Option<SessionCommand>> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    let parsed = match command.to_ascii_lowercase().as_str() {
        "prepare" => SessionCommand::PrepareRecording,
        "record" => SessionCommand::StartRecording,
        "stop" => SessionCommand::EndRecording,
        "download" => SessionCommand::StartDownload {
            replay_file: required(argument, "download")?.to_owned(),
        },
        "end" => SessionCommand::EndReplay,
        "pause" => SessionCommand::SetPaused(true),
        "resume" => SessionCommand::SetPaused(false),
        "server" => SessionCommand::SwitchServer(parse_number(argument, "server")?),
        "session" => SessionCommand::SelectSession(RecorderId(parse_number(argument, "session")?)),
        "preview" => {
            let value = required(argument, "preview")?;
            if value.eq_ignore_ascii_case("off") {
                SessionCommand::Preview(None)
            } else {
                let seconds = value
                    .parse::<f64>()
                    .ok()
                    .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                    .ok_or_else(|| invalid("preview", value))?;
                SessionCommand::Preview(Some(seconds))
            }
        }
        "ping" => SessionCommand::Ping,
        "status" => SessionCommand::Status,
        "quit" | "exit" => SessionCommand::Quit,
        other => {
            return Err(AppError::session(SessionError::UnknownCommand {
                command: other.to_owned(),
            }));
        }
    };
    Ok(Some(parsed))
}

fn required<'line>(argument: Option<&'line str>, command: &'static str) -> AppResult<&'line str> {
    argument.ok_or(AppError::Session(SessionError::MissingCommandArgument { command }))
}

fn parse_number<T: std::str::FromStr>(argument: Option<&str>, command: &'static str) -> AppResult<T> {
    let value = required(argument, command)?;
    value.parse::<T>().map_err(|_err| invalid(command, value))
}

fn invalid(command: &'static str, value: &str) -> AppError {
    AppError::session(SessionError::InvalidCommandArgument {
        command,
        value: value.to_owned(),
    })
}
