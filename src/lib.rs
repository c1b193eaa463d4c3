pub mod cli;
pub mod config;
pub mod jsonrpc;

// 公開API
pub use config::PeerConfig;
pub use jsonrpc::{done_channel, Call, CallHandle, CloseReason, Peer, PeerError};
