use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Relay connection closed.")]
    RelayConnectionClosed,
    #[error("Frame exceeded max size ({max_bytes} bytes).")]
    FrameTooLarge { max_bytes: usize },
    #[error("Frame was not valid UTF-8: {source}")]
    FrameInvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Timed out waiting for relay welcome.")]
    WelcomeTimeout,
    #[error("Timed out waiting for participant hello.")]
    HelloTimeout,
    #[error("Expected hello from participant.")]
    ExpectedHello,
    #[error("Expected welcome from relay.")]
    ExpectedWelcome,
    #[error("Relay room loop is gone.")]
    RoomClosed,
    #[error("Cannot change session to {requested} while {phase} (current {current}).")]
    SessionBusy {
        requested: u64,
        current: u64,
        phase: &'static str,
    },
    #[error("Cannot {action} while {phase}.")]
    InvalidPhase {
        action: &'static str,
        phase: &'static str,
    },
    #[error("Server index {index} is out of range ({count} configured).")]
    ServerIndexOutOfRange { index: usize, count: usize },
    #[error("No artifact servers configured.")]
    NoServers,
    #[error("Time source {addr} I/O error: {source}")]
    TimeSourceIo {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Time source {addr} did not answer within {timeout_ms}ms.")]
    TimeSourceTimeout { addr: String, timeout_ms: u64 },
    #[error("Time source {addr} sent an invalid reply ({len} bytes).")]
    TimeSourceInvalidReply { addr: String, len: usize },
    #[error("Unknown command '{command}'.")]
    UnknownCommand { command: String },
    #[error("Command '{command}' requires an argument.")]
    MissingCommandArgument { command: &'static str },
    #[error("Invalid argument for '{command}': {value}")]
    InvalidCommandArgument {
        command: &'static str,
        value: String,
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
