//! Line-delimited RPC peer
//!
//! 一本の双方向ストリーム上で、送信した呼び出しへの応答と
//! 相手からの通知を同時に扱うための実装です。
//!
//! ## 主要コンポーネント
//!
//! - [`codec`]: one JSON value per line (pluggable via [`WireCodec`])
//! - [`call`]: the `Call` record and its done channel
//! - [`handler`]: notification handler registry
//! - [`peer`]: [`Peer`] - call dispatcher and reader loop
//! - [`stdio`]: stdio and child-process bindings
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use peer_rpc::{Peer, PeerConfig};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> peer_rpc::jsonrpc::Result<()> {
//! let (peer, _child) = Peer::spawn("xi-core", &[] as &[&str], PeerConfig::default())?;
//!
//! peer.handle("update", |params: Value| async move {
//!     log::info!("update: {}", params);
//! });
//!
//! let reply: Value = peer.call_sync("new_view", json!({})).await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod codec;
pub mod error;
pub mod handler;
pub mod message;
pub mod peer;
pub mod stdio;

mod pending;

pub use call::{done_channel, Call, CallHandle, DoneReceiver, DoneSender};
pub use codec::{JsonLineCodec, WireCodec};
pub use error::{CloseReason, PeerError, Result};
pub use handler::{HandlerRegistry, NotificationHandler};
pub use message::{InboundMessage, InboundPayload, OutgoingCall};
pub use peer::Peer;
pub use stdio::stop_child;
