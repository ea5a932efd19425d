//! Asynchronous client for the Music Player Daemon.
//!
//! One TCP connection is shared by any number of concurrent callers. Callers
//! submit work through [`Executor`]s, which form a tree of scopes: closing a
//! scope cancels everything it owns without disturbing its siblings. Requests
//! go out in submission order, and any number of independent
//! [`Executor::idle`] calls share MPD's single `idle` command.
//!
//! ```no_run
//! # async fn example() -> Result<(), ampd::MpdError> {
//! use ampd::{Client, Event};
//!
//! let client = Client::new();
//! client.connect("localhost", 6600).await?;
//!
//! let executor = client.executor().sub_scope();
//! let status = executor.request("status", []).await?;
//! println!("{:?}", status.as_map());
//!
//! let changed = executor.idle(Event::PLAYER | Event::MIXER, None).await?;
//! println!("changed: {:?}", changed);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod mpd;
pub mod task;

pub use config::{ClientConfig, DEFAULT_PORT};
pub use error::{CommandError, MpdError};
pub use mpd::{
  command_table, lookup_command, Arg, Client, Command, CommandSpec, ConnectionEvent,
  ConnectionState, DisconnectReason, Event, Executor, Fields, Pending, Reply, ReplyKind,
};
