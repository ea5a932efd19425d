//! Connection to the MPD server.
//!
//! Handles TCP (or any byte stream) setup, line framing and the greeting.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::config::ClientConfig;
use crate::error::MpdError;

use super::protocol::parse_welcome;

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  /// The client is shutting down; no further work is accepted.
  Closing,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
  /// `disconnect()` was called.
  Requested,
  /// A new connection attempt replaced this one.
  Reconnect,
  /// The client was closed.
  Shutdown,
  /// The connection attempt failed.
  FailedConnect(String),
  /// The connection broke.
  Error(String),
}

/// Notification delivered to executors subscribed with `connection_events()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
  Connected { protocol_version: String },
  Disconnected(DisconnectReason),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-framed byte stream to the server. Dropping it releases the socket.
pub(crate) struct Transport {
  lines: FramedRead<BoxedReader, LinesCodec>,
  sink: FramedWrite<BoxedWriter, LinesCodec>,
}

impl Transport {
  /// Open a TCP connection.
  pub(crate) async fn connect_tcp(host: &str, port: u16, config: &ClientConfig) -> Result<Self, MpdError> {
    let timeout = config.connect_timeout();
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
      .await
      .map_err(|_| {
        std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          format!("Connecting to {}:{} timed out", host, port),
        )
      })??;
    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    Ok(Self::from_io(reader, writer, config.max_line_length))
  }

  pub(crate) fn from_io<R, W>(reader: R, writer: W, max_line_length: usize) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let reader: BoxedReader = Box::new(reader);
    let writer: BoxedWriter = Box::new(writer);
    Self {
      lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length)),
      sink: FramedWrite::new(writer, LinesCodec::new()),
    }
  }

  /// Read the greeting and return the protocol version.
  pub(crate) async fn handshake(&mut self) -> Result<String, MpdError> {
    let line = self.next_line().await?;
    let version = parse_welcome(&line)?;
    log::info!("MPD server speaks protocol {}", version);
    Ok(version)
  }

  /// Write one transmission unit.
  pub(crate) async fn send(&mut self, lines: &[String]) -> Result<(), MpdError> {
    for line in lines {
      log::debug!("MPD write: {}", line);
      self.sink.feed(line.clone()).await.map_err(codec_error)?;
    }
    SinkExt::<String>::flush(&mut self.sink)
      .await
      .map_err(codec_error)
  }

  /// Next line from the server. Cancel safe.
  pub(crate) async fn next_line(&mut self) -> Result<String, MpdError> {
    match self.lines.next().await {
      Some(Ok(line)) => {
        log::debug!("MPD read: {}", line);
        Ok(line)
      }
      Some(Err(err)) => Err(codec_error(err)),
      None => {
        log::info!("MPD closed the connection");
        Err(MpdError::ConnectionLost)
      }
    }
  }
}

fn codec_error(err: LinesCodecError) -> MpdError {
  match err {
    LinesCodecError::Io(err) if err.kind() == std::io::ErrorKind::InvalidData => {
      MpdError::Protocol(format!("Invalid line: {}", err))
    }
    LinesCodecError::Io(err) => MpdError::Connection(err),
    LinesCodecError::MaxLineLengthExceeded => MpdError::Protocol("Line too long".into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[tokio::test]
  async fn test_handshake_and_lines() {
    let (client, mut server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client);
    let mut transport = Transport::from_io(reader, writer, 1024);

    server.write_all(b"OK MPD 0.23.5\nvolume: 10\n").await.unwrap();
    assert_eq!(transport.handshake().await.unwrap(), "0.23.5");
    assert_eq!(transport.next_line().await.unwrap(), "volume: 10");

    drop(server);
    assert!(matches!(
      transport.next_line().await,
      Err(MpdError::ConnectionLost)
    ));
  }

  #[tokio::test]
  async fn test_send_writes_lines() {
    use tokio::io::AsyncReadExt;

    let (client, mut server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client);
    let mut transport = Transport::from_io(reader, writer, 1024);

    transport
      .send(&["command_list_ok_begin".into(), "ping".into(), "command_list_end".into()])
      .await
      .unwrap();
    drop(transport);

    let mut written = String::new();
    server.read_to_string(&mut written).await.unwrap();
    assert_eq!(written, "command_list_ok_begin\nping\ncommand_list_end\n");
  }

  #[tokio::test]
  async fn test_line_too_long() {
    let (client, mut server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client);
    let mut transport = Transport::from_io(reader, writer, 8);

    server.write_all(b"this line is too long\n").await.unwrap();
    assert!(matches!(
      transport.next_line().await,
      Err(MpdError::Protocol(_))
    ));
  }

  #[tokio::test]
  async fn test_invalid_utf8_is_protocol_error() {
    let (client, mut server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client);
    let mut transport = Transport::from_io(reader, writer, 1024);

    server.write_all(b"file: \xff\xfe\n").await.unwrap();
    assert!(matches!(
      transport.next_line().await,
      Err(MpdError::Protocol(_))
    ));
  }

  #[tokio::test]
  async fn test_bad_greeting() {
    let (client, mut server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(client);
    let mut transport = Transport::from_io(reader, writer, 1024);

    server.write_all(b"HELLO\n").await.unwrap();
    assert!(matches!(
      transport.handshake().await,
      Err(MpdError::Protocol(_))
    ));
  }
}
