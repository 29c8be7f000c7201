//! Wire protocol shared by participants and the relay.
mod io;
mod types;

pub(crate) use io::{read_frame, send_frame};
pub use types::*;
