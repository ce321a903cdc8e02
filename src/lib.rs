// Copyright 2024 the framewire authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! _framewire_ is a message-framing TCP/WebSocket server framework.
//!
//! It multiplexes many long-lived connections, frames application
//! messages as length-prefixed TLV packets, dispatches them by numeric id
//! through an interceptor chain, and runs handlers on a bounded worker
//! pool with deterministic per-connection ordering.
//!
//! # Example
//!
//! A server answering message id 100:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use framewire::{Config, Request, Router, Server};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Router for Ping {
//!   async fn handle(&self, request: &mut Request) {
//!     let _ = request
//!       .connection()
//!       .send_msg(100, b"ping...ping...ping")
//!       .await;
//!   }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!   let server = Server::new(Config::default());
//!   server.add_router(100, Ping);
//!   server.serve().await?;
//!   Ok(())
//! }
//! ```
//!
//! And the matching client:
//!
//! ```no_run
//! use framewire::Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!   let client = Client::new("127.0.0.1", 8999);
//!   client.start().await;
//!   if let Some(conn) = client.conn() {
//!     conn.send_msg(100, b"hello").await?;
//!   }
//!   Ok(())
//! }
//! ```
//!
//! ## Worker assignment
//!
//! With `WorkerPoolSize > 0` every connection is assigned a worker:
//! deterministically shared in hash mode (`connId mod poolSize`), or
//! exclusively owned in bind mode, where the pool is as wide as `MaxConn`
//! and ids recycle through a free list. Either way, all requests from one
//! connection land on one queue, so handlers observe wire order.

mod asyncop;
mod client;
mod config;
mod connection;
mod connmgr;
mod decoder;
mod dispatch;
mod error;
mod heartbeat;
mod interceptor;
mod message;
mod packet;
mod request;
mod router;
mod server;
mod shardmap;
mod tls;
mod ws;

pub use crate::asyncop::AsyncOpResult;
pub use crate::asyncop::AsyncOps;
pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::config::MODE_KCP;
pub use crate::config::MODE_TCP;
pub use crate::config::MODE_WEBSOCKET;
pub use crate::config::WORKER_MODE_BIND;
pub use crate::config::WORKER_MODE_HASH;
pub use crate::connection::conn_hook;
pub use crate::connection::ConnHook;
pub use crate::connection::Connection;
pub use crate::connmgr::ConnManager;
pub use crate::decoder::Decoder;
pub use crate::decoder::FieldOrder;
pub use crate::decoder::FrameDecoder;
pub use crate::decoder::LengthField;
pub use crate::decoder::TlvDecoder;
pub use crate::dispatch::Dispatcher;
pub use crate::error::FramewireError;
pub use crate::error::Result;
pub use crate::heartbeat::BeatFn;
pub use crate::heartbeat::Heartbeat;
pub use crate::heartbeat::HeartbeatOption;
pub use crate::heartbeat::MakeMsgFn;
pub use crate::heartbeat::OnNotAliveFn;
pub use crate::heartbeat::DEFAULT_HEARTBEAT_MSG_ID;
pub use crate::interceptor::Chain;
pub use crate::interceptor::ChainBuilder;
pub use crate::interceptor::IcData;
pub use crate::interceptor::Interceptor;
pub use crate::message::Message;
pub use crate::message::MsgHeader;
pub use crate::packet::packet_factory;
pub use crate::packet::LegacyTlvPacket;
pub use crate::packet::Packet;
pub use crate::packet::PacketStyle;
pub use crate::packet::TlvPacket;
pub use crate::packet::TLV_HEADER_LEN;
pub use crate::request::HandleStep;
pub use crate::request::Request;
pub use crate::router::handler_fn;
pub use crate::router::recovery_middleware;
pub use crate::router::timing_middleware;
pub use crate::router::Router;
pub use crate::router::RouterGroup;
pub use crate::router::RouterSlices;
pub use crate::router::SliceHandler;
pub use crate::server::Server;
pub use crate::server::WsAuthFn;
pub use crate::shardmap::ShardMap;
pub use crate::shardmap::SHARD_COUNT;
pub use crate::ws::UpgradeRequest;
