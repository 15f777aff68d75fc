//! Asynchronous Redis client on tokio.
//!
//! Three layers, bottom up: a non-blocking [`Connection`] pumping a
//! scatter/gather [`WriteBuffer`] over the socket, a [`Client`]
//! multiplexing pipelined request/reply pairs (plus a [`SubscribedClient`]
//! for pub/sub mode), and a [`ClientPool`] leasing clients with expiry
//! and optional autoclosing.
//!
//! The client is command-agnostic: commands are argument vectors
//! encoded to RESP, replies come back as [`Reply`] values, and
//! server-side errors are values too, so pipelines can carry partial
//! successes.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod connection;
pub mod errors;
pub mod pipeline;
pub mod pool;
pub mod pubsub;
pub mod state;

#[cfg(test)]
mod testsupport;

pub use buffer::WriteBuffer;
pub use client::{Client, ClientOptions, ReplyCallback};
pub use codec::{Argument, Reply};
pub use connection::{
    Connection, ConnectionOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_READ_PAGE_SIZE, DEFAULT_WRITE_PAGE_SIZE,
};
pub use errors::{Error, Result};
pub use pipeline::Pipeline;
pub use pool::{ClientLease, ClientPool};
pub use pubsub::SubscribedClient;
pub use state::ConnectionState;
