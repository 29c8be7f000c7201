use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::command::{SessionCommand, parse_command};

/// Reads operator commands from stdin until EOF.
pub(crate) fn spawn_stdin_commands(
    commands: mpsc::UnboundedSender<SessionCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Stdin closed; no more operator commands");
                    break;
                }
                Err(err) => {
                    warn!("Failed to read operator command: {}", err);
                    break;
                }
            };
            match parse_command(&line) {
                Ok(Some(command)) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("{}", err),
            }
        }
    })
}
