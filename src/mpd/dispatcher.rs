//! Request multiplexer.
//!
//! Every request from every executor lands in one FIFO queue. A single
//! dispatcher task owns the transport: it writes the head of the queue, reads
//! the reply line by line and resolves the matching futures. When the queue is
//! empty and idle waiters exist it parks the connection in `idle`, and breaks
//! out with `noidle` as soon as something else needs the wire.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, MpdError};

use super::commands::Command;
use super::connection::Transport;
use super::executor::ExecutorId;
use super::protocol::{
  idle_command, parse_line, Event, Reply, ResponseLine, CHANGED, COMMAND_LIST_BEGIN,
  COMMAND_LIST_END, NOIDLE,
};
use super::state::{Shared, Step};

pub(crate) type RequestId = u64;

type ReplySlot = oneshot::Sender<Result<Reply, MpdError>>;

/// A submitted command waiting for its reply.
pub(crate) struct PendingRequest {
  pub(crate) id: RequestId,
  pub(crate) owner: ExecutorId,
  command: Command,
  slot: Option<ReplySlot>,
}

impl PendingRequest {
  pub(crate) fn new(
    id: RequestId,
    owner: ExecutorId,
    command: Command,
  ) -> (Self, oneshot::Receiver<Result<Reply, MpdError>>) {
    let (slot, rx) = oneshot::channel();
    let request = Self {
      id,
      owner,
      command,
      slot: Some(slot),
    };
    (request, rx)
  }

  /// Deliver the result. Later calls are no-ops.
  fn resolve(&mut self, result: Result<Reply, MpdError>) {
    if let Some(slot) = self.slot.take() {
      log::debug!(
        "Request {} ({}) resolved: ok={}",
        self.id,
        self.command.name(),
        result.is_ok()
      );
      let _ = slot.send(result);
    }
  }
}

/// One transmission unit.
enum Entry {
  Single(PendingRequest),
  List(Vec<PendingRequest>),
}

impl Entry {
  fn is_owned_by(&self, owner: ExecutorId) -> bool {
    match self {
      Entry::Single(request) => request.owner == owner,
      Entry::List(members) => members.first().is_some_and(|member| member.owner == owner),
    }
  }

  fn into_members(self) -> Vec<PendingRequest> {
    match self {
      Entry::Single(request) => vec![request],
      Entry::List(members) => members,
    }
  }
}

/// Whether a reply has been read to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
  Pending,
  Complete,
}

/// The entry whose reply is being read.
struct InFlight {
  members: Vec<PendingRequest>,
  grouped: bool,
  /// Member the next lines belong to.
  current: usize,
  fields: Vec<(String, String)>,
  malformed: Option<String>,
}

impl InFlight {
  fn feed(&mut self, line: &str) -> Progress {
    match parse_line(line) {
      ResponseLine::Field(key, value) => {
        self.fields.push((key.to_string(), value.to_string()));
        Progress::Pending
      }
      ResponseLine::ListOk if self.grouped => {
        self.complete_current();
        Progress::Pending
      }
      ResponseLine::Ok => {
        if !self.grouped {
          self.complete_current();
        }
        let missing = self.members.len().saturating_sub(self.current);
        if missing > 0 {
          log::warn!("Command list ended with {} unanswered commands", missing);
          for member in self.members.iter_mut().skip(self.current) {
            member.resolve(Err(MpdError::Protocol("Command list ended early".into())));
          }
        }
        Progress::Complete
      }
      ResponseLine::Ack(err) => {
        self.fail_current(err);
        Progress::Complete
      }
      ResponseLine::ListOk | ResponseLine::Malformed => {
        log::warn!("Malformed reply line: {}", line);
        self.malformed.get_or_insert_with(|| line.to_string());
        Progress::Pending
      }
    }
  }

  fn complete_current(&mut self) {
    let fields = std::mem::take(&mut self.fields);
    let malformed = self.malformed.take();
    match self.members.get_mut(self.current) {
      Some(member) => {
        let result = match malformed {
          Some(line) => Err(MpdError::Protocol(format!("Malformed reply line: {}", line))),
          None => Reply::shape(member.command.reply_kind(), fields),
        };
        member.resolve(result);
      }
      None => log::warn!("Unexpected list_OK after the last command"),
    }
    self.current += 1;
  }

  fn fail_current(&mut self, err: CommandError) {
    if err.position != self.current {
      log::warn!(
        "ACK names command {} while command {} was running",
        err.position,
        self.current
      );
    }
    let mut members = self.members.iter_mut().skip(self.current);
    if let Some(failed) = members.next() {
      failed.resolve(Err(MpdError::Command(err)));
    }
    for member in members {
      member.resolve(Err(MpdError::Aborted));
    }
  }
}

/// FIFO of submitted work plus the entry currently on the wire.
#[derive(Default)]
pub(crate) struct RequestQueue {
  queue: VecDeque<Entry>,
  in_flight: Option<InFlight>,
}

impl RequestQueue {
  pub(crate) fn submit(&mut self, request: PendingRequest) {
    log::debug!("Request {} queued: {}", request.id, request.command.line());
    self.queue.push_back(Entry::Single(request));
  }

  /// Queue a command list. Its members are transmitted as one unit.
  pub(crate) fn submit_list(&mut self, members: Vec<PendingRequest>) {
    if members.is_empty() {
      return;
    }
    log::debug!("Command list of {} queued", members.len());
    self.queue.push_back(Entry::List(members));
  }

  /// True when work is waiting to be transmitted.
  pub(crate) fn has_queued(&self) -> bool {
    !self.queue.is_empty()
  }

  pub(crate) fn is_busy(&self) -> bool {
    self.in_flight.is_some()
  }

  /// Move the head of the queue on the wire and return its lines.
  pub(crate) fn start_next(&mut self) -> Option<Vec<String>> {
    if self.in_flight.is_some() {
      return None;
    }
    let entry = self.queue.pop_front()?;
    let (members, grouped) = match entry {
      Entry::Single(request) => (vec![request], false),
      Entry::List(members) => (members, true),
    };

    let mut lines = Vec::with_capacity(members.len() + 2);
    if grouped {
      lines.push(COMMAND_LIST_BEGIN.to_string());
    }
    lines.extend(members.iter().map(|member| member.command.line().to_string()));
    if grouped {
      lines.push(COMMAND_LIST_END.to_string());
    }

    self.in_flight = Some(InFlight {
      members,
      grouped,
      current: 0,
      fields: Vec::new(),
      malformed: None,
    });
    Some(lines)
  }

  /// Feed one reply line to the in-flight entry.
  pub(crate) fn feed(&mut self, line: &str) -> Result<Progress, MpdError> {
    let Some(in_flight) = self.in_flight.as_mut() else {
      return Err(MpdError::Protocol(format!(
        "Unexpected line with no request in flight: {}",
        line
      )));
    };
    let progress = in_flight.feed(line);
    if progress == Progress::Complete {
      self.in_flight = None;
    }
    Ok(progress)
  }

  /// Resolve everything `owner` submitted with `Cancelled`. The in-flight entry
  /// stays in place so its reply is still consumed.
  pub(crate) fn cancel_owned(&mut self, owner: ExecutorId) -> usize {
    let mut cancelled = 0;
    let (owned, kept): (VecDeque<Entry>, VecDeque<Entry>) = std::mem::take(&mut self.queue)
      .into_iter()
      .partition(|entry| entry.is_owned_by(owner));
    self.queue = kept;
    for entry in owned {
      for mut member in entry.into_members() {
        member.resolve(Err(MpdError::Cancelled));
        cancelled += 1;
      }
    }

    if let Some(in_flight) = self.in_flight.as_mut() {
      for member in in_flight.members.iter_mut().filter(|m| m.owner == owner) {
        if member.slot.is_some() {
          member.resolve(Err(MpdError::Cancelled));
          cancelled += 1;
        }
      }
    }
    cancelled
  }

  /// Resolve everything queued or in flight with an error and forget it.
  pub(crate) fn fail_all(&mut self, make_err: impl Fn() -> MpdError) -> usize {
    let mut failed = 0;
    let in_flight = self.in_flight.take().map(|in_flight| in_flight.members);
    let queued = std::mem::take(&mut self.queue)
      .into_iter()
      .map(Entry::into_members);
    for mut member in in_flight.into_iter().chain(queued).flatten() {
      if member.slot.is_some() {
        member.resolve(Err(make_err()));
        failed += 1;
      }
    }
    failed
  }
}

/// A live connection handed to the dispatcher.
pub(crate) struct Session {
  pub(crate) transport: Transport,
  pub(crate) generation: u64,
  pub(crate) cancel: CancellationToken,
}

/// Dispatcher task body. Runs until `shutdown` fires.
pub(crate) async fn run(
  shared: Arc<Shared>,
  sessions: async_channel::Receiver<Session>,
  shutdown: CancellationToken,
) {
  log::info!("MPD dispatcher started");
  loop {
    let deadline = shared.state.lock().idle.earliest_deadline();
    tokio::select! {
      biased;
      _ = shutdown.cancelled() => break,
      session = sessions.recv() => match session {
        Ok(session) => run_session(&shared, session).await,
        Err(_) => break,
      },
      _ = shared.wake.notified() => {}
      _ = sleep_until_deadline(deadline) => expire_waiters(&shared),
    }
  }
  log::info!("MPD dispatcher stopped");
}

async fn run_session(shared: &Shared, session: Session) {
  let Session {
    mut transport,
    generation,
    cancel,
  } = session;
  log::info!("MPD session {} started", generation);

  let result = tokio::select! {
    biased;
    _ = cancel.cancelled() => Ok(()),
    result = drive(shared, &mut transport, generation) => result,
  };

  match result {
    Ok(()) => log::info!("MPD session {} ended", generation),
    Err(err) => shared.state.lock().connection_lost(generation, &err),
  }
}

async fn drive(shared: &Shared, transport: &mut Transport, generation: u64) -> Result<(), MpdError> {
  loop {
    let step = {
      let mut state = shared.state.lock();
      if state.generation != generation {
        return Ok(());
      }
      state.next_step(Instant::now())
    };

    match step {
      Step::Transmit(lines) => {
        transport.send(&lines).await?;
        read_reply(shared, transport, generation).await?;
      }
      Step::Idle(mask) => idle_cycle(shared, transport, generation, mask).await?,
      Step::Yield => tokio::task::yield_now().await,
      Step::Sleep(deadline) => {
        tokio::select! {
          biased;
          line = transport.next_line() => {
            let line = line?;
            return Err(MpdError::Protocol(format!(
              "Unsolicited line from server: {}",
              line
            )));
          }
          _ = shared.wake.notified() => {}
          _ = sleep_until_deadline(deadline) => {}
        }
      }
    }
  }
}

/// Read lines until the in-flight entry completes. Waiter deadlines that pass
/// meanwhile are expired without touching the wire.
async fn read_reply(shared: &Shared, transport: &mut Transport, generation: u64) -> Result<(), MpdError> {
  loop {
    let deadline = shared.state.lock().idle.earliest_deadline();
    tokio::select! {
      biased;
      line = transport.next_line() => {
        let line = line?;
        let mut state = shared.state.lock();
        if state.generation != generation {
          return Ok(());
        }
        if state.queue.feed(&line)? == Progress::Complete {
          return Ok(());
        }
      }
      // A waiter registered mid-reply may bring an earlier deadline.
      _ = shared.wake.notified() => {}
      _ = sleep_until_deadline(deadline) => expire_waiters(shared),
    }
  }
}

/// One `idle` round trip. A queued request, a waiter change or a reached
/// deadline sends `noidle`; queued requests are checked first.
async fn idle_cycle(
  shared: &Shared,
  transport: &mut Transport,
  generation: u64,
  mask: Event,
) -> Result<(), MpdError> {
  transport.send(&[idle_command(mask)]).await?;

  let mut changed = Event::empty();
  let mut interrupted = false;
  let outcome = loop {
    let deadline = if interrupted {
      None
    } else {
      shared.state.lock().idle.earliest_deadline()
    };

    tokio::select! {
      biased;
      line = transport.next_line() => {
        let line = line?;
        match parse_line(&line) {
          ResponseLine::Field(CHANGED, subsystem) => match Event::from_subsystem(subsystem) {
            Some(event) => changed |= event,
            None => log::debug!("Ignoring unknown subsystem: {}", subsystem),
          },
          ResponseLine::Ok => break Ok(changed),
          ResponseLine::Ack(err) => break Err(err),
          _ => {
            return Err(MpdError::Protocol(format!(
              "Unexpected line in idle reply: {}",
              line
            )));
          }
        }
      }
      _ = shared.wake.notified(), if !interrupted => {
        let reason = shared.state.lock().interrupt_reason();
        if let Some(reason) = reason {
          log::debug!("Interrupting idle: {}", reason);
          transport.send(&[NOIDLE.to_string()]).await?;
          interrupted = true;
        }
      }
      _ = sleep_until_deadline(deadline), if !interrupted => {
        log::debug!("Interrupting idle: waiter deadline reached");
        transport.send(&[NOIDLE.to_string()]).await?;
        expire_waiters(shared);
        interrupted = true;
      }
    }
  };

  let mut state = shared.state.lock();
  if state.generation != generation {
    return Ok(());
  }
  let mask = state.idle.finish().unwrap_or(mask);
  match outcome {
    Ok(changed) if changed.is_empty() => {}
    Ok(changed) => {
      let resolved = state.idle.dispatch(changed);
      log::debug!(
        "Idle reported {:?}: {} waiters resolved, {} still waiting",
        changed,
        resolved,
        state.idle.len()
      );
    }
    Err(err) => {
      log::warn!("Server rejected idle: {}", err);
      state.idle.fail_outstanding(mask, &err);
    }
  }
  Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

fn expire_waiters(shared: &Shared) {
  let expired = shared.state.lock().idle.expire(Instant::now());
  if expired > 0 {
    log::debug!("{} idle waiters timed out", expired);
  }
}
