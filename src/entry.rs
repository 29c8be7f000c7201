use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgMatches, CommandFactory, FromArgMatches};
use tracing::info;
use url::Url;

use crate::args::{Command, JoinArgs, ListArgs, LockstepArgs, RelayArgs};
use crate::clock::SntpSource;
use crate::download::{HttpFetcher, RetryPolicy};
use crate::error::{AppError, AppResult, ValidationError};
use crate::protocol::RecorderId;
use crate::relay::Relay;
use crate::session::{ParticipantPlan, SessionSettings, run_participant};
use crate::shutdown::{shutdown_channel, spawn_signal_listener};

/// Per-query timeout for the SNTP time source.
const SNTP_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long runtime shutdown waits on tasks parked in blocking reads (stdin).
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

enum RunPlan {
    Relay(RelayArgs),
    Join(Box<ParticipantPlan>),
    List { server: Url, fetch_timeout: Duration },
}

/// Parses the command line, loads config, and runs the selected command.
///
/// # Errors
///
/// Returns an error when arguments or config are invalid, or when the
/// selected command fails.
pub fn run() -> AppResult<()> {
    let (args, matches) = match parse_args()? {
        Some(parsed) => parsed,
        None => return Ok(()),
    };

    crate::logger::init_logging(args.verbose, args.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_async(args, &matches));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

fn parse_args() -> AppResult<Option<(LockstepArgs, ArgMatches)>> {
    let mut cmd = LockstepArgs::command();
    let raw_args: Vec<OsString> = std::env::args_os().collect();

    if matches!(raw_args.as_slice(), [] | [_]) {
        cmd.print_help()?;
        println!();
        return Ok(None);
    }

    let matches = cmd.get_matches_from(raw_args);
    let args = LockstepArgs::from_arg_matches(&matches)?;

    Ok(Some((args, matches)))
}

async fn run_async(mut args: LockstepArgs, matches: &ArgMatches) -> AppResult<()> {
    apply_config(&mut args, matches)?;
    let plan = build_plan(args)?;
    execute_plan(plan).await
}

fn apply_config(args: &mut LockstepArgs, matches: &ArgMatches) -> AppResult<()> {
    if let Some(config) = crate::config::load_config(args.config.as_deref())? {
        tracing::debug!(
            "Applying config {}",
            args.config.as_deref().unwrap_or("from working directory")
        );
        crate::config::apply_config(args, matches, &config)?;
    }
    Ok(())
}

fn build_plan(args: LockstepArgs) -> AppResult<RunPlan> {
    match args.command {
        Command::Relay(relay) => Ok(RunPlan::Relay(relay)),
        Command::Join(join) => Ok(RunPlan::Join(Box::new(build_participant_plan(join)?))),
        Command::List(list) => build_list_plan(list),
    }
}

fn build_participant_plan(join: JoinArgs) -> AppResult<ParticipantPlan> {
    let relay = join
        .relay
        .ok_or_else(|| {
            tracing::error!("Missing relay address (set --relay or [relay].address in config).");
            AppError::validation(ValidationError::MissingOption { option: "--relay" })
        })?;
    let name = join.name.trim();
    if name.is_empty() {
        return Err(AppError::validation(ValidationError::EmptyParticipantName));
    }
    if join.servers.is_empty() {
        tracing::warn!("No artifact servers configured; downloads will be refused.");
    }

    let mut settings = SessionSettings::new(name, RecorderId(join.recorder_id));
    settings.servers = join.servers;
    settings.cache_dir = PathBuf::from(join.cache_dir);
    settings.guard_interval = join.guard_interval;
    settings.tick_interval = join.tick_interval;
    settings.retry = RetryPolicy::new(join.retry_initial, join.retry_max);

    Ok(ParticipantPlan {
        relay,
        settings,
        time_server: join
            .time_server
            .map(|addr| SntpSource::new(addr, SNTP_QUERY_TIMEOUT)),
        clock_refresh: join.clock_refresh,
        fetch_timeout: join.fetch_timeout,
    })
}

fn build_list_plan(list: ListArgs) -> AppResult<RunPlan> {
    let server = list.server.ok_or_else(|| {
        tracing::error!("Missing artifact server (set --server or [download].servers in config).");
        AppError::validation(ValidationError::MissingOption { option: "--server" })
    })?;
    Ok(RunPlan::List {
        server,
        fetch_timeout: list.fetch_timeout,
    })
}

async fn execute_plan(plan: RunPlan) -> AppResult<()> {
    match plan {
        RunPlan::Relay(args) => {
            let relay = Relay::bind(&args.listen).await?;
            let (shutdown_tx, shutdown_rx) = shutdown_channel();
            let signal_handle = spawn_signal_listener(&shutdown_tx);
            let result = relay.run(shutdown_rx).await;
            signal_handle.abort();
            result
        }
        RunPlan::Join(plan) => {
            let (shutdown_tx, shutdown_rx) = shutdown_channel();
            let signal_handle = spawn_signal_listener(&shutdown_tx);
            let result = run_participant(*plan, shutdown_rx).await;
            signal_handle.abort();
            result
        }
        RunPlan::List {
            server,
            fetch_timeout,
        } => {
            let fetcher = HttpFetcher::new(fetch_timeout)?;
            let names = fetcher.list_recordings(&server).await?;
            if names.is_empty() {
                info!("No recordings on {}", server);
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn plan_for(cli: &[&str]) -> AppResult<RunPlan> {
        let args = LockstepArgs::try_parse_from(cli.iter().copied())?;
        build_plan(args)
    }

    #[test]
    fn join_plan_carries_settings() -> AppResult<()> {
        let plan = plan_for(&[
            "lockstep",
            "join",
            "--relay",
            "127.0.0.1:7400",
            "--name",
            " alice ",
            "--recorder-id",
            "9",
            "--server",
            "http://replays:8080",
            "--time-server",
            "time.example:123",
            "--retry-initial",
            "1s",
        ])?;
        let RunPlan::Join(plan) = plan else {
            return Err(AppError::validation("Expected join plan"));
        };
        if plan.relay != "127.0.0.1:7400" {
            return Err(AppError::validation("Unexpected relay"));
        }
        if plan.settings.name != "alice" {
            return Err(AppError::validation(format!(
                "Name should be trimmed: '{}'",
                plan.settings.name
            )));
        }
        if plan.settings.recorder_id != RecorderId(9) {
            return Err(AppError::validation("Unexpected recorder id"));
        }
        if plan.settings.servers.len() != 1 {
            return Err(AppError::validation("Unexpected servers"));
        }
        if plan.settings.retry.initial() != Duration::from_secs(1) {
            return Err(AppError::validation("Unexpected retry policy"));
        }
        match plan.time_server.as_ref().map(SntpSource::addr) {
            Some("time.example:123") => Ok(()),
            other => Err(AppError::validation(format!(
                "Unexpected time server: {:?}",
                other
            ))),
        }
    }

    #[test]
    fn join_without_relay_is_rejected() -> AppResult<()> {
        match plan_for(&["lockstep", "join", "--name", "bob"]) {
            Err(AppError::Validation(ValidationError::MissingOption { option: "--relay" })) => {
                Ok(())
            }
            Err(err) => Err(AppError::validation(format!("Unexpected error: {}", err))),
            Ok(_) => Err(AppError::validation("Expected missing relay error")),
        }
    }

    #[test]
    fn blank_name_is_rejected() -> AppResult<()> {
        match plan_for(&["lockstep", "join", "--relay", "r:1", "--name", "  "]) {
            Err(AppError::Validation(ValidationError::EmptyParticipantName)) => Ok(()),
            Err(err) => Err(AppError::validation(format!("Unexpected error: {}", err))),
            Ok(_) => Err(AppError::validation("Expected empty name error")),
        }
    }

    #[test]
    fn list_requires_a_server() -> AppResult<()> {
        if plan_for(&["lockstep", "list"]).is_ok() {
            return Err(AppError::validation("Expected missing server error"));
        }
        match plan_for(&["lockstep", "list", "--server", "http://replays:8080"])? {
            RunPlan::List { server, .. } if server.host_str() == Some("replays") => Ok(()),
            RunPlan::List { .. } | RunPlan::Relay(_) | RunPlan::Join(_) => {
                Err(AppError::validation("Unexpected list plan"))
            }
        }
    }
}
