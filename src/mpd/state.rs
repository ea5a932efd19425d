//! State shared between the client, its executors and the dispatcher task.
//!
//! Everything lives behind one `parking_lot::Mutex`. The lock is only held for
//! short synchronous sections and never across an `.await`; the dispatcher is
//! woken through `wake` after every change that may give it something to do.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::MpdError;

use super::connection::{ConnectionEvent, ConnectionState, DisconnectReason};
use super::dispatcher::RequestQueue;
use super::executor::{ExecutorId, ExecutorTree};
use super::idle::IdleCoordinator;
use super::protocol::Event;

pub(crate) struct Shared {
  pub(crate) state: Mutex<State>,
  pub(crate) wake: Notify,
}

impl Shared {
  pub(crate) fn new(state: State) -> Self {
    Self {
      state: Mutex::new(state),
      wake: Notify::new(),
    }
  }
}

/// What the dispatcher should do next.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
  /// Write these lines and read the reply.
  Transmit(Vec<String>),
  /// Send `idle` for this mask.
  Idle(Event),
  /// A waiter was resolved without the wire; let it run.
  Yield,
  /// Nothing to do until woken or the deadline passes.
  Sleep(Option<Instant>),
}

/// Why new work is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
  ScopeClosed,
  Offline,
}

impl From<Rejection> for MpdError {
  fn from(rejection: Rejection) -> Self {
    match rejection {
      Rejection::ScopeClosed => MpdError::Cancelled,
      Rejection::Offline => MpdError::NotConnected,
    }
  }
}

pub(crate) struct State {
  pub(crate) connection: ConnectionState,
  pub(crate) protocol_version: Option<String>,
  /// Bumped whenever a connection starts or ends. Sessions carry the value
  /// they were started with and stop touching state once it moves on.
  pub(crate) generation: u64,
  pub(crate) session_cancel: Option<CancellationToken>,
  /// Last endpoint passed to `connect`, reused by `reconnect`.
  pub(crate) endpoint: Option<(String, u16)>,
  pub(crate) queue: RequestQueue,
  pub(crate) idle: IdleCoordinator,
  pub(crate) executors: ExecutorTree,
  next_id: u64,
}

impl State {
  pub(crate) fn new() -> Self {
    Self {
      connection: ConnectionState::Disconnected,
      protocol_version: None,
      generation: 0,
      session_cancel: None,
      endpoint: None,
      queue: RequestQueue::default(),
      idle: IdleCoordinator::default(),
      executors: ExecutorTree::default(),
      next_id: 0,
    }
  }

  pub(crate) fn next_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  /// Can `executor` submit a request right now?
  pub(crate) fn check_request(&self, executor: ExecutorId) -> Result<(), Rejection> {
    if !self.executors.contains(executor) {
      return Err(Rejection::ScopeClosed);
    }
    match self.connection {
      ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
      ConnectionState::Disconnected | ConnectionState::Closing => Err(Rejection::Offline),
    }
  }

  /// Can `executor` register an idle waiter right now? Waiting is allowed
  /// while disconnected so callers can wait for `CONNECT`.
  pub(crate) fn check_idle(&self, executor: ExecutorId) -> Result<(), Rejection> {
    if !self.executors.contains(executor) {
      return Err(Rejection::ScopeClosed);
    }
    match self.connection {
      ConnectionState::Closing => Err(Rejection::Offline),
      _ => Ok(()),
    }
  }

  /// Events that are true right now and can resolve a new waiter at once.
  pub(crate) fn current_events(&self) -> Event {
    let mut events = Event::empty();
    if self.connection == ConnectionState::Connected {
      events |= Event::CONNECT;
      if !self.queue.has_queued() && !self.queue.is_busy() {
        events |= Event::IDLE;
      }
    }
    events
  }

  pub(crate) fn next_step(&mut self, now: Instant) -> Step {
    let expired = self.idle.expire(now);
    if expired > 0 {
      log::debug!("{} idle waiters timed out", expired);
    }
    if let Some(lines) = self.queue.start_next() {
      return Step::Transmit(lines);
    }
    if self.idle.dispatch_one(Event::IDLE) {
      return Step::Yield;
    }
    if !self.idle.wire_mask().is_empty() {
      return Step::Idle(self.idle.begin());
    }
    Step::Sleep(self.idle.earliest_deadline())
  }

  /// Why an outstanding `idle` should be interrupted, if it should.
  pub(crate) fn interrupt_reason(&self) -> Option<&'static str> {
    if self.queue.has_queued() {
      return Some("request queued");
    }
    self.idle.interrupt_reason()
  }

  pub(crate) fn mark_connected(&mut self, protocol_version: String, cancel: CancellationToken) {
    log::info!("Connected to MPD (protocol {})", protocol_version);
    self.connection = ConnectionState::Connected;
    self.protocol_version = Some(protocol_version.clone());
    self.session_cancel = Some(cancel);
    self
      .executors
      .broadcast(&ConnectionEvent::Connected { protocol_version });
    let resolved = self.idle.dispatch(Event::CONNECT);
    if resolved > 0 {
      log::debug!("{} waiters resolved with CONNECT", resolved);
    }
  }

  /// A connection attempt failed. Queued requests fail; idle waiters stay.
  pub(crate) fn connection_failed(&mut self, err: &MpdError) {
    self.connection = ConnectionState::Disconnected;
    self.generation += 1;
    let failed = self.queue.fail_all(|| MpdError::ConnectionLost);
    if failed > 0 {
      log::warn!("{} queued requests failed with the connection attempt", failed);
    }
    self
      .executors
      .broadcast(&ConnectionEvent::Disconnected(DisconnectReason::FailedConnect(
        err.to_string(),
      )));
  }

  /// The session of `generation` failed. Ignored if that session is stale.
  pub(crate) fn connection_lost(&mut self, generation: u64, err: &MpdError) {
    if self.generation != generation || self.connection != ConnectionState::Connected {
      return;
    }
    log::error!("Lost connection to MPD: {}", err);
    self.disconnect(DisconnectReason::Error(err.to_string()));
  }

  /// Drop the current connection (or attempt) and fail all outstanding work
  /// with `ConnectionLost`. Returns false when there was nothing to drop.
  pub(crate) fn disconnect(&mut self, reason: DisconnectReason) -> bool {
    if self.connection == ConnectionState::Disconnected {
      return false;
    }
    log::info!("Disconnecting from MPD: {:?}", reason);
    self.generation += 1;
    if let Some(cancel) = self.session_cancel.take() {
      cancel.cancel();
    }
    if self.connection != ConnectionState::Closing {
      self.connection = ConnectionState::Disconnected;
    }
    self.protocol_version = None;

    let requests = self.queue.fail_all(|| MpdError::ConnectionLost);
    let waiters = self.idle.fail_all(|| MpdError::ConnectionLost);
    if requests + waiters > 0 {
      log::info!(
        "{} requests and {} idle waiters failed with the connection",
        requests,
        waiters
      );
    }
    self.executors.broadcast(&ConnectionEvent::Disconnected(reason));
    true
  }

  /// Close `executor` and its descendants, children first. Their queued and
  /// in-flight requests and their idle waiters resolve with `Cancelled`.
  pub(crate) fn close_executor(&mut self, executor: ExecutorId) {
    for closed in self.executors.remove_subtree(executor) {
      let requests = self.queue.cancel_owned(closed);
      let waiters = self.idle.cancel_owned(closed);
      log::debug!(
        "Executor {} closed: {} requests and {} waiters cancelled",
        closed,
        requests,
        waiters
      );
    }
  }
}
