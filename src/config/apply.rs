use clap::ArgMatches;
use clap::parser::ValueSource;
use url::Url;

use crate::args::{Command, JoinArgs, ListArgs, LockstepArgs, RelayArgs, parse_server_url};
use crate::error::{AppError, AppResult, ConfigError};

use super::types::ConfigFile;

/// Applies configuration values to CLI arguments. Options given on the
/// command line are left untouched.
///
/// # Errors
///
/// Returns an error when a config value is invalid.
pub fn apply_config(
    args: &mut LockstepArgs,
    matches: &ArgMatches,
    config: &ConfigFile,
) -> AppResult<()> {
    match &mut args.command {
        Command::Relay(relay) => {
            let sub = matches.subcommand_matches("relay").unwrap_or(matches);
            apply_relay(relay, sub, config);
            Ok(())
        }
        Command::Join(join) => {
            let sub = matches.subcommand_matches("join").unwrap_or(matches);
            apply_join(join, sub, config)
        }
        Command::List(list) => {
            let sub = matches.subcommand_matches("list").unwrap_or(matches);
            apply_list(list, sub, config)
        }
    }
}

fn apply_relay(args: &mut RelayArgs, matches: &ArgMatches, config: &ConfigFile) {
    if !is_cli(matches, "listen")
        && let Some(listen) = config.relay.as_ref().and_then(|relay| relay.listen.clone())
    {
        args.listen = listen;
    }
}

fn apply_join(args: &mut JoinArgs, matches: &ArgMatches, config: &ConfigFile) -> AppResult<()> {
    if !is_cli(matches, "relay")
        && let Some(address) = config.relay.as_ref().and_then(|relay| relay.address.clone())
    {
        args.relay = Some(address);
    }

    if let Some(session) = config.session.as_ref() {
        if !is_cli(matches, "name")
            && let Some(name) = session.name.clone()
        {
            args.name = name;
        }
        if !is_cli(matches, "recorder_id")
            && let Some(recorder_id) = session.recorder_id
        {
            args.recorder_id = recorder_id;
        }
        if !is_cli(matches, "guard_interval")
            && let Some(value) = session.guard_interval.as_ref()
        {
            args.guard_interval = value.to_duration("session.guard_interval")?;
        }
        if !is_cli(matches, "tick_interval")
            && let Some(value) = session.tick_interval.as_ref()
        {
            args.tick_interval = value.to_duration("session.tick_interval")?;
        }
    }

    if let Some(download) = config.download.as_ref() {
        if !is_cli(matches, "servers")
            && let Some(servers) = download.servers.as_ref()
        {
            args.servers = parse_servers(servers)?;
        }
        if !is_cli(matches, "cache_dir")
            && let Some(cache_dir) = download.cache_dir.clone()
        {
            args.cache_dir = cache_dir;
        }
        if !is_cli(matches, "fetch_timeout")
            && let Some(value) = download.fetch_timeout.as_ref()
        {
            args.fetch_timeout = value.to_duration("download.fetch_timeout")?;
        }
        if !is_cli(matches, "retry_initial")
            && let Some(value) = download.retry_initial.as_ref()
        {
            args.retry_initial = value.to_duration("download.retry_initial")?;
        }
        if !is_cli(matches, "retry_max")
            && let Some(value) = download.retry_max.as_ref()
        {
            args.retry_max = value.to_duration("download.retry_max")?;
        }
    }

    if let Some(clock) = config.clock.as_ref() {
        if !is_cli(matches, "time_server")
            && let Some(time_server) = clock.time_server.clone()
        {
            args.time_server = Some(time_server);
        }
        if !is_cli(matches, "clock_refresh")
            && let Some(value) = clock.refresh.as_ref()
        {
            args.clock_refresh = value.to_duration("clock.refresh")?;
        }
    }

    Ok(())
}

fn apply_list(args: &mut ListArgs, matches: &ArgMatches, config: &ConfigFile) -> AppResult<()> {
    let Some(download) = config.download.as_ref() else {
        return Ok(());
    };
    if !is_cli(matches, "server")
        && let Some(servers) = download.servers.as_ref()
    {
        args.server = parse_servers(servers)?.into_iter().next();
    }
    if !is_cli(matches, "fetch_timeout")
        && let Some(value) = download.fetch_timeout.as_ref()
    {
        args.fetch_timeout = value.to_duration("download.fetch_timeout")?;
    }
    Ok(())
}

fn parse_servers(servers: &[String]) -> AppResult<Vec<Url>> {
    let mut parsed = Vec::with_capacity(servers.len());
    for server in servers {
        parsed.push(
            parse_server_url(server)
                .map_err(|err| AppError::config(ConfigError::InvalidServer { source: err }))?,
        );
    }
    Ok(parsed)
}

fn is_cli(matches: &ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(ValueSource::CommandLine)
}
