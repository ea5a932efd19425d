//! In-memory MPD server for tests.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::Client;

pub(crate) const GREETING: &str = "OK MPD 0.23.5\n";

/// Server end of an in-memory connection. Reads what the client writes, line
/// by line, and writes raw replies back.
pub(crate) struct MockServer {
  lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
  writer: WriteHalf<DuplexStream>,
}

impl MockServer {
  /// Create a server and the client-side halves connected to it.
  pub(crate) fn new() -> (Self, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (client_stream, server_stream) = duplex(4096);
    let (client_read, client_write) = split(client_stream);
    let (server_read, server_write) = split(server_stream);
    let server = Self {
      lines: FramedRead::new(server_read, LinesCodec::new()),
      writer: server_write,
    };
    (server, client_read, client_write)
  }

  /// Next line written by the client.
  pub(crate) async fn next_line(&mut self) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(600), self.lines.next())
      .await
      .expect("Timed out waiting for the client")
      .map(|line| line.expect("Failed to read client line"))
  }

  /// Assert the client's next line.
  pub(crate) async fn expect(&mut self, expected: &str) {
    let line = self.next_line().await;
    assert_eq!(line.as_deref(), Some(expected));
  }

  /// Assert the client closed its end.
  pub(crate) async fn expect_closed(&mut self) {
    assert_eq!(self.next_line().await, None);
  }

  pub(crate) async fn send(&mut self, text: &str) {
    self
      .writer
      .write_all(text.as_bytes())
      .await
      .expect("Failed to write to client");
  }
}

/// A client connected to a fresh mock server.
pub(crate) async fn connected() -> (Client, MockServer) {
  let client = Client::new();
  let server = connect(&client).await;
  (client, server)
}

/// Connect `client` to a fresh mock server.
pub(crate) async fn connect(client: &Client) -> MockServer {
  let (mut server, reader, writer) = MockServer::new();
  server.send(GREETING).await;
  let version = client.connect_io(reader, writer).await.unwrap();
  assert_eq!(version, "0.23.5");
  server
}
