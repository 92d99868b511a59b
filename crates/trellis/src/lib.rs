//! Object-level client/server messaging over a paired reliable (TCP) and
//! unreliable (UDP) channel.
//!
//! Register your message types with a [`Registry`] (same types, same order,
//! on both peers), bind a [`Server`], point a [`Client`] at it and exchange
//! values through [`Connection::send_tcp`]/[`Connection::send_udp`]. Inbound
//! traffic arrives through [`Listener`] callbacks on the endpoint's update
//! loop.
//!
//! ```no_run
//! use std::{net::SocketAddr, sync::Arc, time::Duration};
//!
//! use serde::{Deserialize, Serialize};
//! use trellis::{Client, Config, Registry, Server, TypeListener};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat(String);
//!
//! fn registry() -> Registry {
//!     let mut registry = Registry::new();
//!     registry.register::<Chat>();
//!     registry
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(Config::default(), registry())?;
//! server.bind("0.0.0.0:54555".parse::<SocketAddr>()?, None)?;
//! let routed = TypeListener::new();
//! routed.on::<Chat, _>(|conn, chat| {
//!     let _ = conn.send_tcp(&Chat(format!("{}!", chat.0)));
//! });
//! server.add_listener(Arc::new(routed));
//! server.start()?;
//!
//! let client = Client::new(Config::default(), registry())?;
//! let conn = client.connect("127.0.0.1:54555".parse()?, None, Duration::from_secs(5))?;
//! client.start()?;
//! conn.send_tcp(&Chat("hello".into()))?;
//! # Ok(()) }
//! ```

mod client;
mod config;
mod connection;
mod discovery;
mod endpoint;
mod error;
mod frame;
mod listener;
pub mod msg;
mod pump;
mod serialize;
mod server;
mod sockopt;
mod timing;

pub use client::Client;
pub use config::Config;
pub use connection::Connection;
pub use discovery::{DiscoveredHost, discover_host, discover_hosts};
pub use error::{CloseReason, ConnectError, SendError, SerializeError};
pub use listener::{
    DelaySink, EventSink, LagListener, Listener, QueuedListener, ThreadedListener, TypeListener,
    WorkerPool,
};
pub use serialize::{Message, Object, Registry};
pub use server::Server;
