//! CLI argument types and parsing helpers.
mod cli;
pub(crate) mod parsers;


pub use cli::{
    Command, DEFAULT_RELAY_LISTEN, JoinArgs, ListArgs, LockstepArgs, RelayArgs,
};

pub(crate) use parsers::{parse_duration_value, parse_server_url};
