//! Command implementations for the CLI.

mod config;
mod replay;
mod simulate;
mod status;

pub use config::cmd_config;
pub use replay::cmd_replay;
pub use simulate::cmd_simulate;
pub use status::cmd_status;
