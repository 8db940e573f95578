//! A location-transparent actor runtime, wire-compatible with libprocess
//! (the process layer underneath Apache Mesos) over HTTP/1.0.
//!
//! A [`Context`] binds one HTTP endpoint and hosts any number of processes
//! built with [`ProcessBuilder`]. Processes exchange messages by pid
//! (`name@ip:port`); delivery to a pid bound to this context's own
//! endpoint is direct, delivery to anywhere else goes out over a pooled,
//! coalesced HTTP/1.0 connection.

pub mod actor;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod link;
pub mod pid;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod typed;
pub mod wire;

pub use actor::{HttpRequestContext, MailboxHandler, ProcessBuilder, ProcessTables, RouteHandler};
pub use context::Context;
pub use error::{Error, WireError};
pub use pid::Pid;
pub use typed::{send_typed, TypedProcessBuilderExt};
