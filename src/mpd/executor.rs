//! Executors: hierarchical scopes that own requests, idle waiters and tasks.
//!
//! Executors form a tree rooted at the client. Closing one closes its
//! descendants first, then resolves everything it still owns with
//! `Cancelled` and cancels its token so tasks bound to it stop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{join_all, JoinAll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::MpdError;

use super::commands::{Arg, Command};
use super::connection::{ConnectionEvent, ConnectionState};
use super::dispatcher::PendingRequest;
use super::idle::IdleWaiter;
use super::protocol::{Event, Reply};
use super::state::Shared;

pub(crate) type ExecutorId = u64;

/// Id handed out by `sub_scope` on a closed executor. Tree ids start at 1,
/// so it never names a live node.
pub(crate) const CLOSED_SCOPE: ExecutorId = 0;

struct Node {
  parent: Option<ExecutorId>,
  children: Vec<ExecutorId>,
  token: CancellationToken,
  subscribers: Vec<async_channel::Sender<ConnectionEvent>>,
}

/// Arena of live executors.
#[derive(Default)]
pub(crate) struct ExecutorTree {
  nodes: HashMap<ExecutorId, Node>,
  next_id: ExecutorId,
}

impl ExecutorTree {
  pub(crate) fn create_root(&mut self, token: CancellationToken) -> ExecutorId {
    self.insert(None, token)
  }

  /// Add a child of `parent`, or `None` if `parent` is closed.
  pub(crate) fn create_child(&mut self, parent: ExecutorId) -> Option<ExecutorId> {
    let token = self.nodes.get(&parent)?.token.child_token();
    let id = self.insert(Some(parent), token);
    if let Some(node) = self.nodes.get_mut(&parent) {
      node.children.push(id);
    }
    Some(id)
  }

  fn insert(&mut self, parent: Option<ExecutorId>, token: CancellationToken) -> ExecutorId {
    self.next_id += 1;
    let id = self.next_id;
    self.nodes.insert(
      id,
      Node {
        parent,
        children: Vec::new(),
        token,
        subscribers: Vec::new(),
      },
    );
    id
  }

  pub(crate) fn contains(&self, id: ExecutorId) -> bool {
    self.nodes.contains_key(&id)
  }

  pub(crate) fn token(&self, id: ExecutorId) -> Option<CancellationToken> {
    self.nodes.get(&id).map(|node| node.token.clone())
  }

  /// Add a subscriber to `id`. `current` is queued ahead of any broadcast.
  pub(crate) fn subscribe(
    &mut self,
    id: ExecutorId,
    current: Option<ConnectionEvent>,
  ) -> Option<async_channel::Receiver<ConnectionEvent>> {
    let node = self.nodes.get_mut(&id)?;
    let (tx, rx) = async_channel::unbounded();
    if let Some(event) = current {
      let _ = tx.try_send(event);
    }
    node.subscribers.push(tx);
    Some(rx)
  }

  /// Remove `id` and its descendants. Returns the removed ids, children
  /// before their parents.
  pub(crate) fn remove_subtree(&mut self, id: ExecutorId) -> Vec<ExecutorId> {
    let mut order = Vec::new();
    self.walk(id, false, &mut order);

    if let Some(parent) = self.nodes.get(&id).and_then(|node| node.parent) {
      if let Some(parent) = self.nodes.get_mut(&parent) {
        parent.children.retain(|child| *child != id);
      }
    }
    for closed in &order {
      if let Some(node) = self.nodes.remove(closed) {
        node.token.cancel();
      }
    }
    order
  }

  /// Deliver `event` to every subscriber. Connect events reach parents before
  /// children; disconnect events reach children first.
  pub(crate) fn broadcast(&mut self, event: &ConnectionEvent) {
    let parents_first = matches!(event, ConnectionEvent::Connected { .. });
    let mut order = Vec::new();
    for root in self.roots() {
      self.walk(root, parents_first, &mut order);
    }
    for id in order {
      if let Some(node) = self.nodes.get_mut(&id) {
        node
          .subscribers
          .retain(|subscriber| subscriber.try_send(event.clone()).is_ok());
      }
    }
  }

  fn roots(&self) -> Vec<ExecutorId> {
    let mut roots: Vec<ExecutorId> = self
      .nodes
      .iter()
      .filter(|(_, node)| node.parent.is_none())
      .map(|(id, _)| *id)
      .collect();
    roots.sort_unstable();
    roots
  }

  fn walk(&self, id: ExecutorId, parents_first: bool, out: &mut Vec<ExecutorId>) {
    let Some(node) = self.nodes.get(&id) else {
      return;
    };
    if parents_first {
      out.push(id);
    }
    for child in &node.children {
      self.walk(*child, parents_first, out);
    }
    if !parents_first {
      out.push(id);
    }
  }
}

/// Handle to an executor. Cheap to clone; clones refer to the same scope.
#[derive(Clone)]
pub struct Executor {
  id: ExecutorId,
  shared: Arc<Shared>,
}

impl Executor {
  pub(crate) fn new(id: ExecutorId, shared: Arc<Shared>) -> Self {
    Self { id, shared }
  }

  pub(crate) fn id(&self) -> ExecutorId {
    self.id
  }

  /// Create a child scope. Closing this executor closes the child too.
  ///
  /// On a closed executor the returned scope is already closed.
  pub fn sub_scope(&self) -> Executor {
    let mut state = self.shared.state.lock();
    let id = match state.executors.create_child(self.id) {
      Some(id) => id,
      None => {
        log::debug!("sub_scope on closed executor {}", self.id);
        CLOSED_SCOPE
      }
    };
    Executor::new(id, self.shared.clone())
  }

  /// Submit a command by name. The request is queued before this returns;
  /// awaiting the result is optional.
  pub fn request(&self, name: &str, args: impl IntoIterator<Item = Arg>) -> Pending<Reply> {
    match Command::new(name, args) {
      Ok(command) => self.execute(command),
      Err(err) => Pending::failed(err),
    }
  }

  /// Submit an already validated command.
  pub fn execute(&self, command: Command) -> Pending<Reply> {
    let mut state = self.shared.state.lock();
    if let Err(rejection) = state.check_request(self.id) {
      log::debug!("{} refused: {:?}", command.name(), rejection);
      return Pending::failed(rejection.into());
    }
    let id = state.next_id();
    let (request, rx) = PendingRequest::new(id, self.id, command);
    state.queue.submit(request);
    drop(state);

    self.shared.wake.notify_one();
    Pending::waiting(rx)
  }

  /// Submit several commands as one command list. Each member gets its own
  /// result: the failing member its `CommandError`, later ones `Aborted`.
  pub fn command_list(&self, commands: Vec<Command>) -> JoinAll<Pending<Reply>> {
    let mut state = self.shared.state.lock();
    if let Err(rejection) = state.check_request(self.id) {
      return join_all(
        commands
          .iter()
          .map(|_| Pending::failed(rejection.into()))
          .collect::<Vec<_>>(),
      );
    }

    let mut members = Vec::with_capacity(commands.len());
    let mut pending = Vec::with_capacity(commands.len());
    for command in commands {
      let id = state.next_id();
      let (request, rx) = PendingRequest::new(id, self.id, command);
      members.push(request);
      pending.push(Pending::waiting(rx));
    }
    let queued = !members.is_empty();
    state.queue.submit_list(members);
    drop(state);

    if queued {
      self.shared.wake.notify_one();
    }
    join_all(pending)
  }

  /// Wait until one of the events in `mask` happens, or `timeout` passes.
  ///
  /// Resolves with the subset of `mask` that happened, or `Event::TIMEOUT`.
  /// `CONNECT` and `IDLE` resolve immediately when already true.
  pub fn idle(&self, mask: Event, timeout: Option<Duration>) -> Pending<Event> {
    if mask.contains(Event::TIMEOUT) {
      return Pending::failed(MpdError::InvalidArguments {
        command: "idle".into(),
        reason: "TIMEOUT is not an event that can be waited for".into(),
      });
    }

    let mut state = self.shared.state.lock();
    if let Err(rejection) = state.check_idle(self.id) {
      return Pending::failed(rejection.into());
    }

    let ready = mask & state.current_events();
    if !ready.is_empty() {
      return Pending::ready(Ok(ready));
    }

    let id = state.next_id();
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let (waiter, rx) = IdleWaiter::new(id, self.id, mask, deadline);
    state.idle.register(waiter);
    drop(state);

    self.shared.wake.notify_one();
    Pending::waiting(rx)
  }

  /// Close this executor and every descendant.
  pub fn close(&self) {
    self.shared.state.lock().close_executor(self.id);
    self.shared.wake.notify_one();
  }

  pub fn is_closed(&self) -> bool {
    !self.shared.state.lock().executors.contains(self.id)
  }

  /// Spawn a task bound to this scope; see [`crate::task::spawn`].
  pub fn spawn<F>(&self, routine: F) -> JoinHandle<Result<(), MpdError>>
  where
    F: Future<Output = Result<(), MpdError>> + Send + 'static,
  {
    crate::task::spawn(self, routine)
  }

  /// Token cancelled when this executor closes.
  pub fn cancellation_token(&self) -> CancellationToken {
    match self.shared.state.lock().executors.token(self.id) {
      Some(token) => token,
      None => {
        let token = CancellationToken::new();
        token.cancel();
        token
      }
    }
  }

  /// Subscribe to connect and disconnect notifications. The channel closes
  /// when the executor does. Subscribing while connected yields `Connected`
  /// first.
  pub fn connection_events(&self) -> async_channel::Receiver<ConnectionEvent> {
    let mut state = self.shared.state.lock();
    let current = match (&state.connection, &state.protocol_version) {
      (ConnectionState::Connected, Some(version)) => Some(ConnectionEvent::Connected {
        protocol_version: version.clone(),
      }),
      _ => None,
    };
    match state.executors.subscribe(self.id, current) {
      Some(rx) => rx,
      None => {
        let (_, rx) = async_channel::unbounded();
        rx
      }
    }
  }

  pub fn is_connected(&self) -> bool {
    self.shared.state.lock().connection == ConnectionState::Connected
  }

  pub fn protocol_version(&self) -> Option<String> {
    self.shared.state.lock().protocol_version.clone()
  }
}

impl std::fmt::Debug for Executor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Executor").field("id", &self.id).finish()
  }
}

enum PendingState<T> {
  Waiting(oneshot::Receiver<Result<T, MpdError>>),
  Ready(Option<Result<T, MpdError>>),
}

/// Result of a submitted request or idle call.
///
/// The work is already queued when this is returned; dropping it only
/// discards the result.
pub struct Pending<T> {
  state: PendingState<T>,
}

impl<T> Pending<T> {
  pub(crate) fn waiting(rx: oneshot::Receiver<Result<T, MpdError>>) -> Self {
    Self {
      state: PendingState::Waiting(rx),
    }
  }

  pub(crate) fn ready(result: Result<T, MpdError>) -> Self {
    Self {
      state: PendingState::Ready(Some(result)),
    }
  }

  pub(crate) fn failed(err: MpdError) -> Self {
    Self::ready(Err(err))
  }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
  type Output = Result<T, MpdError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match &mut self.get_mut().state {
      PendingState::Waiting(rx) => Pin::new(rx)
        .poll(cx)
        .map(|result| result.unwrap_or(Err(MpdError::ConnectionLost))),
      PendingState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(MpdError::Cancelled))),
    }
  }
}
