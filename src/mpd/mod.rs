//! MPD protocol client.
//!
//! Architecture:
//! - `protocol.rs` - Line classification, `Event` masks and reply shaping
//! - `commands.rs` - Command table and argument encoding
//! - `connection.rs` - TCP connection, line framing and greeting
//! - `dispatcher.rs` - Request queue and the task that owns the connection
//! - `idle.rs` - Folds independent idle waiters into one `idle` command
//! - `executor.rs` - Executor tree and the `Pending` future
//! - `state.rs` - State shared between the client and the dispatcher
//! - `client.rs` - `Client`: connect, disconnect, close

mod client;
mod commands;
mod connection;
mod dispatcher;
mod executor;
mod idle;
mod protocol;
mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::Client;
pub use commands::{all as command_table, lookup as lookup_command, Arg, Command, CommandSpec};
pub use connection::{ConnectionEvent, ConnectionState, DisconnectReason};
pub use executor::{Executor, Pending};
pub use protocol::{Event, Fields, Reply, ReplyKind};
