//! peer-rpc - talk line-delimited JSON RPC to a child process
//!
//! Command-line usage:
//!   peer-rpc --method M [--params JSON] -- COMMAND [ARGS...]
//!   peer-rpc --method M --notify -- COMMAND [ARGS...]
//!   peer-rpc --listen M -- COMMAND [ARGS...]

use peer_rpc::cli::run_cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    run_cli().await
}
