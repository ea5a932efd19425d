//! MPD client: owns the connection, the dispatcher task and the root executor.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::MpdError;

use super::connection::{ConnectionState, DisconnectReason, Transport};
use super::dispatcher::{self, Session};
use super::executor::Executor;
use super::state::{Shared, State};

/// Asynchronous MPD client.
///
/// All requests go through executors; [`Client::executor`] is the root one.
/// Must be created inside a Tokio runtime.
pub struct Client {
  config: ClientConfig,
  shared: Arc<Shared>,
  root: Executor,
  sessions: async_channel::Sender<Session>,
  shutdown: CancellationToken,
  dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
  /// Create a disconnected client with default configuration.
  pub fn new() -> Self {
    Self::with_config(ClientConfig::default())
  }

  pub fn with_config(config: ClientConfig) -> Self {
    let shutdown = CancellationToken::new();
    let mut state = State::new();
    let root_id = state.executors.create_root(shutdown.child_token());
    let shared = Arc::new(Shared::new(state));

    let (sessions, session_rx) = async_channel::unbounded();
    let dispatcher = tokio::spawn(dispatcher::run(
      shared.clone(),
      session_rx,
      shutdown.clone(),
    ));

    Self {
      config,
      root: Executor::new(root_id, shared.clone()),
      shared,
      sessions,
      shutdown,
      dispatcher: Mutex::new(Some(dispatcher)),
    }
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  /// The root executor.
  pub fn executor(&self) -> &Executor {
    &self.root
  }

  pub fn state(&self) -> ConnectionState {
    self.shared.state.lock().connection
  }

  pub fn protocol_version(&self) -> Option<String> {
    self.shared.state.lock().protocol_version.clone()
  }

  /// Connect to `host:port` and return the server's protocol version.
  ///
  /// Any current connection is dropped first. Resolves with `Cancelled` if
  /// another `connect` or a `disconnect` supersedes this attempt.
  pub async fn connect(&self, host: &str, port: u16) -> Result<String, MpdError> {
    let generation = self.begin_connect(Some((host.to_string(), port)));
    log::info!("Connecting to MPD at {}:{}", host, port);

    let result = match Transport::connect_tcp(host, port, &self.config).await {
      Ok(mut transport) => match transport.handshake().await {
        Ok(version) => Ok((transport, version)),
        Err(e) => Err(e),
      },
      Err(e) => Err(e),
    };
    self.finish_connect(generation, result)
  }

  /// Connect to the host and port from the configuration.
  pub async fn connect_from_config(&self) -> Result<String, MpdError> {
    let host = self.config.host.clone();
    self.connect(&host, self.config.port).await
  }

  /// Connect again to the last endpoint, or the configured one.
  pub async fn reconnect(&self) -> Result<String, MpdError> {
    let endpoint = self.shared.state.lock().endpoint.clone();
    match endpoint {
      Some((host, port)) => self.connect(&host, port).await,
      None => self.connect_from_config().await,
    }
  }

  /// Use an already open byte stream as the connection.
  pub async fn connect_io<R, W>(&self, reader: R, writer: W) -> Result<String, MpdError>
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let generation = self.begin_connect(None);
    let mut transport = Transport::from_io(reader, writer, self.config.max_line_length);
    let result = match transport.handshake().await {
      Ok(version) => Ok((transport, version)),
      Err(e) => Err(e),
    };
    self.finish_connect(generation, result)
  }

  /// Drop the connection. Everything pending fails with `ConnectionLost`.
  pub fn disconnect(&self) {
    {
      let mut state = self.shared.state.lock();
      if !state.disconnect(DisconnectReason::Requested) {
        log::debug!("disconnect() called while not connected");
      }
    }
    self.shared.wake.notify_one();
  }

  /// Disconnect, close every executor and stop the dispatcher.
  pub async fn close(self) {
    log::info!("Closing MPD client");
    self.teardown();

    let dispatcher = self.dispatcher.lock().take();
    if let Some(handle) = dispatcher {
      if let Err(e) = handle.await {
        log::error!("MPD dispatcher task failed: {}", e);
      }
    }
    log::info!("MPD client closed");
  }

  fn teardown(&self) {
    {
      let mut state = self.shared.state.lock();
      state.connection = ConnectionState::Closing;
      state.disconnect(DisconnectReason::Shutdown);
      state.close_executor(self.root.id());
    }
    self.shutdown.cancel();
  }

  fn begin_connect(&self, endpoint: Option<(String, u16)>) -> u64 {
    let mut state = self.shared.state.lock();
    state.disconnect(DisconnectReason::Reconnect);
    if endpoint.is_some() {
      state.endpoint = endpoint;
    }
    state.connection = ConnectionState::Connecting;
    state.generation += 1;
    state.generation
  }

  fn finish_connect(
    &self,
    generation: u64,
    result: Result<(Transport, String), MpdError>,
  ) -> Result<String, MpdError> {
    let mut state = self.shared.state.lock();
    if state.generation != generation || state.connection != ConnectionState::Connecting {
      log::info!("Connection attempt superseded");
      return Err(MpdError::Cancelled);
    }

    let (transport, version) = match result {
      Ok(connected) => connected,
      Err(e) => {
        log::warn!("Failed to connect to MPD: {}", e);
        state.connection_failed(&e);
        return Err(e);
      }
    };

    let cancel = self.shutdown.child_token();
    let session = Session {
      transport,
      generation,
      cancel: cancel.clone(),
    };
    if self.sessions.try_send(session).is_err() {
      log::error!("MPD dispatcher is gone");
      state.connection_failed(&MpdError::NotConnected);
      return Err(MpdError::NotConnected);
    }
    state.mark_connected(version.clone(), cancel);
    drop(state);

    self.shared.wake.notify_one();
    Ok(version)
  }
}

impl Default for Client {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Client {
  fn drop(&mut self) {
    if self.dispatcher.lock().is_some() {
      self.teardown();
    }
  }
}
