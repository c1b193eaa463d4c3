//! Command-line driver: spawn a child and exchange calls/notifications with it

mod cli_app;

pub use cli_app::{parse_params, run, run_cli, Cli};
