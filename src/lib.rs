//! # Millrace
//! A single-threaded, readiness-driven networking core built on [`mio`]:
//! one dedicated event loop thread owns every socket, and thread-safe
//! handles marshal connects, sends, and closes onto it.
//! Millrace provides TCP client, TCP server, and UDP channels with a FIFO
//! write queue per channel, per-send completion callbacks, and an
//! outstanding-bytes ceiling for backpressure, without pulling in an async
//! runtime.
//!
//! ## Core Philosophy
//! Millrace was designed for applications that require:
//! - **One dispatch thread**: all connection callbacks run on the loop
//!   thread, so connection state needs no locking
//! - **Runtime-agnostic architecture** that doesn't force async/await
//! - **Explicit backpressure**: every queued byte is accounted and every
//!   send resolves through exactly one callback
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐ submit ┌──────────────┐    ┌─────────────┐
//! │ TcpClient   │───────▶│  EventLoop   │───▶│ PollHandle  │
//! │ TcpServer   │  Task  │  (reactor    │    │ (mio Poll)  │
//! │ UdpSocket   │        │   thread)    │    └─────────────┘
//! └─────────────┘        └──────────────┘
//!                                │ readiness
//!                                ▼
//!                        ┌──────────────┐
//!                        │ ChannelDriver│  stream / listener / datagram
//!                        └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use millrace::net::{Connecting, Connection, SocketConfig, TcpClient};
//! use millrace::{EventLoop, NetError};
//! use std::net::SocketAddr;
//!
//! struct Printer;
//!
//! impl Connection for Printer {
//!     fn connected(&mut self, addr: Option<SocketAddr>) {
//!         println!("connected: {addr:?}");
//!     }
//!     fn received(&mut self, _from: Option<SocketAddr>, data: Bytes) {
//!         println!("got {} bytes", data.len());
//!     }
//!     fn failed(&mut self, err: NetError) {
//!         eprintln!("connection failed: {err}");
//!     }
//!     fn closed(&mut self) {
//!         println!("closed");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ev = EventLoop::new()?;
//!     let peer: SocketAddr = "127.0.0.1:8080".parse()?;
//!     let client = TcpClient::new(&ev, peer, SocketConfig::default());
//!     client.connect(Box::new(Printer))?;
//!     client.send(
//!         None,
//!         Some(Bytes::from_static(b"hello")),
//!         Box::new(|result: millrace::Result<()>| {
//!             println!("send resolved: {result:?}");
//!         }),
//!     );
//!     // ... close when done:
//!     client.close();
//!     ev.close();
//!     ev.join();
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: owns the dispatch thread; entry point for everything
//! - [`net::Connection`]: trait through which a channel reports its life
//! - [`net::TcpClient`], [`net::TcpServer`], [`net::UdpSocket`]: the three
//!   channel kinds
//! - [`net::SocketConfig`]: per-socket options, buffer sizing, write ceiling
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod error;
pub mod event;
pub mod metrics;
pub mod net;
pub mod reactor;

mod handler;
mod poll;

pub use error::{NetError, Result};
pub use metrics::{MetricsSnapshot, NetMetrics};
pub use reactor::EventLoop;

/// Re-exports of the commonly used types and traits.
///
/// ```rust
/// use millrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::{BufferAllocator, FixedAllocator};
    pub use crate::error::{NetError, Result};
    pub use crate::net::{
        Address, Connecting, Connection, Listener, Listening, SendCallback, ServerPeer,
        SocketConfig, TcpClient, TcpServer, UdpSocket,
    };
    pub use crate::reactor::EventLoop;
}
