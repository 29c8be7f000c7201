use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use url::Url;

use super::parsers::{parse_bool_env, parse_duration_arg, parse_server_url};

pub const DEFAULT_RELAY_LISTEN: &str = "0.0.0.0:7400";

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Lockstep recording and replay sessions across a room of participants."
)]
pub struct LockstepArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (sets log level to debug unless overridden by LOCKSTEP_LOG/RUST_LOG)
    #[arg(long, short = 'v', global = true, help_heading = "Common Options")]
    pub verbose: bool,

    /// Path to config file (TOML/JSON). Defaults to ./lockstep.toml or ./lockstep.json if present.
    #[arg(long, global = true, help_heading = "Common Options")]
    pub config: Option<String>,

    /// Disable color output
    #[arg(
        long = "no-color",
        env = "NO_COLOR",
        global = true,
        value_parser = parse_bool_env,
        help_heading = "Common Options"
    )]
    pub no_color: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the room relay that fans broadcasts out to every participant
    Relay(RelayArgs),
    /// Join a room and take part in the session
    Join(JoinArgs),
    /// List the recordings an artifact server offers
    List(ListArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RelayArgs {
    /// Address to listen on
    #[arg(long = "listen", default_value = DEFAULT_RELAY_LISTEN)]
    pub listen: String,
}

#[derive(Debug, Args, Clone)]
pub struct JoinArgs {
    /// Relay address (host:port)
    #[arg(long = "relay")]
    pub relay: Option<String>,

    /// Display name announced to the room
    #[arg(long = "name", default_value = "participant")]
    pub name: String,

    /// Session epoch; messages carrying another id are ignored
    #[arg(long = "recorder-id", default_value_t = 0)]
    pub recorder_id: u64,

    /// Artifact server base URL (repeat for fallbacks; the first is selected)
    #[arg(long = "server", value_parser = parse_server_url)]
    pub servers: Vec<Url>,

    /// Directory downloaded artifacts are cached in
    #[arg(long = "cache-dir", default_value = "replays")]
    pub cache_dir: String,

    /// Lead time before a broadcast transition takes effect (supports ms/s/m/h)
    #[arg(long = "guard-interval", default_value = "1500ms", value_parser = parse_duration_arg)]
    pub guard_interval: Duration,

    /// Interval between status gossip rounds (supports ms/s/m/h)
    #[arg(long = "tick-interval", default_value = "100ms", value_parser = parse_duration_arg)]
    pub tick_interval: Duration,

    /// SNTP server (host:port) used to align the shared clock
    #[arg(long = "time-server")]
    pub time_server: Option<String>,

    /// Interval between clock resyncs (supports ms/s/m/h)
    #[arg(long = "clock-refresh", default_value = "60s", value_parser = parse_duration_arg)]
    pub clock_refresh: Duration,

    /// Per-request timeout for artifact downloads (supports ms/s/m/h)
    #[arg(long = "fetch-timeout", default_value = "30s", value_parser = parse_duration_arg)]
    pub fetch_timeout: Duration,

    /// First retry delay for a failed artifact (supports ms/s/m/h)
    #[arg(long = "retry-initial", default_value = "250ms", value_parser = parse_duration_arg)]
    pub retry_initial: Duration,

    /// Upper bound on the retry delay (supports ms/s/m/h)
    #[arg(long = "retry-max", default_value = "5s", value_parser = parse_duration_arg)]
    pub retry_max: Duration,
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Artifact server base URL
    #[arg(long = "server", value_parser = parse_server_url)]
    pub server: Option<Url>,

    /// Request timeout (supports ms/s/m/h)
    #[arg(long = "fetch-timeout", default_value = "30s", value_parser = parse_duration_arg)]
    pub fetch_timeout: Duration,
}
