//! MPD client error types.

use thiserror::Error;

/// Error reported by the server with an `ACK` line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (error {code}) for command no. {position} ({command})")]
pub struct CommandError {
  /// Numeric MPD error code.
  pub code: u32,
  /// Zero-based position of the failing command inside its command list.
  pub position: usize,
  /// Name of the command the server rejected.
  pub command: String,
  /// Human readable message from the server.
  pub message: String,
}

/// Errors that can occur when talking to MPD.
#[derive(Debug, Error)]
pub enum MpdError {
  #[error("Connection error: {0}")]
  Connection(#[from] std::io::Error),

  #[error("Not connected")]
  NotConnected,

  #[error("Connection lost")]
  ConnectionLost,

  #[error("Protocol error: {0}")]
  Protocol(String),

  #[error("Command failed: {0}")]
  Command(#[from] CommandError),

  #[error("Aborted after an earlier command in the list failed")]
  Aborted,

  #[error("Cancelled")]
  Cancelled,

  #[error("Unknown command: {0}")]
  UnknownCommand(String),

  #[error("Invalid arguments for {command}: {reason}")]
  InvalidArguments { command: String, reason: String },
}

impl MpdError {
  /// True for the error a request resolves with when its scope is closed.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, MpdError::Cancelled)
  }

  /// True for errors that end the connection rather than a single request.
  pub fn is_connection_error(&self) -> bool {
    matches!(
      self,
      MpdError::Connection(_) | MpdError::NotConnected | MpdError::ConnectionLost
    )
  }
}
