//! Idle coordination.
//!
//! MPD has a single blocking `idle` command per connection. The coordinator keeps
//! any number of independent waiters (event mask plus optional deadline) and folds
//! them into that one command: the union of the waiters' masks is what goes on the
//! wire, and each reply is split back per waiter.

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CommandError, MpdError};

use super::executor::ExecutorId;
use super::protocol::Event;

pub(crate) type WaiterId = u64;

type WaiterSlot = oneshot::Sender<Result<Event, MpdError>>;

/// A pending idle call.
pub(crate) struct IdleWaiter {
  pub(crate) id: WaiterId,
  pub(crate) owner: ExecutorId,
  pub(crate) mask: Event,
  pub(crate) deadline: Option<Instant>,
  slot: WaiterSlot,
}

impl IdleWaiter {
  pub(crate) fn new(
    id: WaiterId,
    owner: ExecutorId,
    mask: Event,
    deadline: Option<Instant>,
  ) -> (Self, oneshot::Receiver<Result<Event, MpdError>>) {
    let (slot, rx) = oneshot::channel();
    let waiter = Self {
      id,
      owner,
      mask,
      deadline,
      slot,
    };
    (waiter, rx)
  }

  fn resolve(self, result: Result<Event, MpdError>) {
    log::debug!("Idle waiter {} resolved: {:?}", self.id, result);
    let _ = self.slot.send(result);
  }
}

#[derive(Default)]
pub(crate) struct IdleCoordinator {
  waiters: Vec<IdleWaiter>,
  /// Mask of the `idle` currently on the wire.
  outstanding: Option<Event>,
}

impl IdleCoordinator {
  pub(crate) fn register(&mut self, waiter: IdleWaiter) {
    log::debug!(
      "Idle waiter {} registered: mask={:?} deadline={:?}",
      waiter.id,
      waiter.mask,
      waiter.deadline
    );
    self.waiters.push(waiter);
  }

  pub(crate) fn len(&self) -> usize {
    self.waiters.len()
  }

  /// Union of the subsystems the pending waiters care about.
  pub(crate) fn wire_mask(&self) -> Event {
    self
      .waiters
      .iter()
      .fold(Event::empty(), |mask, waiter| mask | waiter.mask.wire())
  }

  pub(crate) fn earliest_deadline(&self) -> Option<Instant> {
    self.waiters.iter().filter_map(|waiter| waiter.deadline).min()
  }

  /// Mark an `idle` as sent and return its mask.
  pub(crate) fn begin(&mut self) -> Event {
    let mask = self.wire_mask();
    self.outstanding = Some(mask);
    mask
  }

  /// Mark the outstanding `idle` as answered.
  pub(crate) fn finish(&mut self) -> Option<Event> {
    self.outstanding.take()
  }

  /// Why the outstanding `idle` no longer matches the waiters, if it doesn't.
  pub(crate) fn interrupt_reason(&self) -> Option<&'static str> {
    let outstanding = self.outstanding?;
    let wanted = self.wire_mask();
    if wanted.is_empty() {
      Some("no waiters left")
    } else if !outstanding.contains(wanted) {
      Some("subscription widened")
    } else {
      None
    }
  }

  /// Resolve every waiter whose mask intersects `events` with that intersection.
  pub(crate) fn dispatch(&mut self, events: Event) -> usize {
    self.resolve_where(|waiter| {
      let hit = waiter.mask & events;
      (!hit.is_empty()).then_some(Ok(hit))
    })
  }

  /// Resolve the oldest waiter interested in `event`. Used for `IDLE`, which only
  /// one caller should observe at a time.
  pub(crate) fn dispatch_one(&mut self, event: Event) -> bool {
    match self.waiters.iter().position(|waiter| waiter.mask.intersects(event)) {
      Some(index) => {
        let waiter = self.waiters.remove(index);
        let hit = waiter.mask & event;
        waiter.resolve(Ok(hit));
        true
      }
      None => false,
    }
  }

  /// Resolve every waiter whose deadline has passed with `TIMEOUT`.
  pub(crate) fn expire(&mut self, now: Instant) -> usize {
    self.resolve_where(|waiter| match waiter.deadline {
      Some(deadline) if deadline <= now => Some(Ok(Event::TIMEOUT)),
      _ => None,
    })
  }

  /// Fail the waiters the answered `idle` was issued for.
  pub(crate) fn fail_outstanding(&mut self, mask: Event, err: &CommandError) -> usize {
    self.resolve_where(|waiter| {
      waiter
        .mask
        .wire()
        .intersects(mask)
        .then(|| Err(MpdError::Command(err.clone())))
    })
  }

  /// Remove and cancel every waiter owned by `owner`.
  pub(crate) fn cancel_owned(&mut self, owner: ExecutorId) -> usize {
    self.resolve_where(|waiter| (waiter.owner == owner).then(|| Err(MpdError::Cancelled)))
  }

  /// Fail every waiter; used on connection loss.
  pub(crate) fn fail_all(&mut self, make_err: impl Fn() -> MpdError) -> usize {
    self.outstanding = None;
    self.resolve_where(|_| Some(Err(make_err())))
  }

  fn resolve_where(
    &mut self,
    mut decide: impl FnMut(&IdleWaiter) -> Option<Result<Event, MpdError>>,
  ) -> usize {
    let mut resolved = 0;
    let mut index = 0;
    while index < self.waiters.len() {
      match decide(&self.waiters[index]) {
        Some(result) => {
          self.waiters.remove(index).resolve(result);
          resolved += 1;
        }
        None => index += 1,
      }
    }
    resolved
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpd::protocol::Reply;
  use crate::mpd::test_support::connected;
  use pretty_assertions::assert_eq;
  use std::time::Duration;

  fn waiter(
    coordinator: &mut IdleCoordinator,
    id: WaiterId,
    mask: Event,
    deadline: Option<Instant>,
  ) -> oneshot::Receiver<Result<Event, MpdError>> {
    let (waiter, rx) = IdleWaiter::new(id, 0, mask, deadline);
    coordinator.register(waiter);
    rx
  }

  #[test]
  fn test_dispatch_resolves_intersection() {
    let mut idle = IdleCoordinator::default();
    let mut rx = waiter(&mut idle, 1, Event::PLAYER | Event::MIXER, None);

    assert_eq!(idle.dispatch(Event::PLAYER | Event::DATABASE), 1);
    assert_eq!(rx.try_recv().unwrap().unwrap(), Event::PLAYER);
    assert_eq!(idle.len(), 0);
  }

  #[test]
  fn test_disjoint_masks_stay_independent() {
    let mut idle = IdleCoordinator::default();
    let mut player = waiter(&mut idle, 1, Event::PLAYER, None);
    let mut mixer = waiter(&mut idle, 2, Event::MIXER, None);

    assert_eq!(idle.wire_mask(), Event::PLAYER | Event::MIXER);
    idle.dispatch(Event::MIXER);

    assert!(player.try_recv().is_err());
    assert_eq!(mixer.try_recv().unwrap().unwrap(), Event::MIXER);
    assert_eq!(idle.wire_mask(), Event::PLAYER);
  }

  #[test]
  fn test_any_matches_every_subsystem() {
    let mut idle = IdleCoordinator::default();
    let mut rx = waiter(&mut idle, 1, Event::ANY, None);
    idle.dispatch(Event::OPTIONS);
    assert_eq!(rx.try_recv().unwrap().unwrap(), Event::OPTIONS);
  }

  #[test]
  fn test_connect_is_not_a_wire_event() {
    let mut idle = IdleCoordinator::default();
    let mut rx = waiter(&mut idle, 1, Event::CONNECT | Event::PLAYER, None);
    assert_eq!(idle.wire_mask(), Event::PLAYER);

    idle.dispatch(Event::CONNECT);
    assert_eq!(rx.try_recv().unwrap().unwrap(), Event::CONNECT);
  }

  #[test]
  fn test_expire_only_past_deadlines() {
    let mut idle = IdleCoordinator::default();
    let now = Instant::now();
    let mut soon = waiter(&mut idle, 1, Event::PLAYER, Some(now + Duration::from_secs(1)));
    let mut later = waiter(&mut idle, 2, Event::PLAYER, Some(now + Duration::from_secs(5)));
    let _forever = waiter(&mut idle, 3, Event::PLAYER, None);

    assert_eq!(idle.earliest_deadline(), Some(now + Duration::from_secs(1)));
    assert_eq!(idle.expire(now + Duration::from_secs(1)), 1);

    assert_eq!(soon.try_recv().unwrap().unwrap(), Event::TIMEOUT);
    assert!(later.try_recv().is_err());
    assert_eq!(idle.earliest_deadline(), Some(now + Duration::from_secs(5)));
  }

  #[test]
  fn test_interrupt_reasons() {
    let mut idle = IdleCoordinator::default();
    assert_eq!(idle.interrupt_reason(), None);

    let _player = waiter(&mut idle, 1, Event::PLAYER, None);
    assert_eq!(idle.begin(), Event::PLAYER);
    assert_eq!(idle.interrupt_reason(), None);

    let _mixer = waiter(&mut idle, 2, Event::MIXER, None);
    assert_eq!(idle.interrupt_reason(), Some("subscription widened"));

    idle.cancel_owned(0);
    assert_eq!(idle.interrupt_reason(), Some("no waiters left"));
    assert_eq!(idle.finish(), Some(Event::PLAYER));
    assert_eq!(idle.interrupt_reason(), None);
  }

  #[test]
  fn test_dispatch_one_picks_oldest() {
    let mut idle = IdleCoordinator::default();
    let mut first = waiter(&mut idle, 1, Event::IDLE, None);
    let mut second = waiter(&mut idle, 2, Event::IDLE, None);

    assert!(idle.dispatch_one(Event::IDLE));
    assert_eq!(first.try_recv().unwrap().unwrap(), Event::IDLE);
    assert!(second.try_recv().is_err());
  }

  #[test]
  fn test_fail_all_and_cancel() {
    let mut idle = IdleCoordinator::default();
    let (w, mut owned) = IdleWaiter::new(1, 7, Event::PLAYER, None);
    idle.register(w);
    let mut other = waiter(&mut idle, 2, Event::PLAYER, None);

    assert_eq!(idle.cancel_owned(7), 1);
    assert!(matches!(owned.try_recv().unwrap(), Err(MpdError::Cancelled)));

    idle.begin();
    assert_eq!(idle.fail_all(|| MpdError::ConnectionLost), 1);
    assert!(matches!(other.try_recv().unwrap(), Err(MpdError::ConnectionLost)));
    assert_eq!(idle.finish(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_request_interrupts_idle_and_idle_resumes() {
    let (client, mut server) = connected().await;
    let executor = client.executor();

    let waiter = executor.idle(Event::PLAYER, None);
    server.expect("idle player").await;

    let status = executor.request("status", []);
    server.expect("noidle").await;
    server.send("OK\n").await;
    server.expect("status").await;
    server.send("state: stop\nOK\n").await;
    assert_eq!(status.await.unwrap().as_map().unwrap()["state"], "stop");

    server.expect("idle player").await;
    server.send("changed: player\nOK\n").await;
    assert_eq!(waiter.await.unwrap(), Event::PLAYER);
  }

  #[tokio::test(start_paused = true)]
  async fn test_change_reported_with_noidle_reply_is_delivered() {
    let (client, mut server) = connected().await;
    let executor = client.executor();

    let waiter = executor.idle(Event::MIXER, None);
    server.expect("idle mixer").await;
    let ping = executor.request("ping", []);
    server.expect("noidle").await;
    server.send("changed: mixer\nOK\n").await;
    assert_eq!(waiter.await.unwrap(), Event::MIXER);

    server.expect("ping").await;
    server.send("OK\n").await;
    assert_eq!(ping.await.unwrap(), Reply::Empty);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_resolves_on_time() {
    let (client, mut server) = connected().await;
    let start = Instant::now();
    let waiter = client
      .executor()
      .idle(Event::PLAYER, Some(Duration::from_secs(5)));

    server.expect("idle player").await;
    server.expect("noidle").await;
    server.send("OK\n").await;

    assert_eq!(waiter.await.unwrap(), Event::TIMEOUT);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(5) + Duration::from_millis(100));
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_fires_while_reply_is_outstanding() {
    let (client, mut server) = connected().await;
    let executor = client.executor();
    let status = executor.request("status", []);
    server.expect("status").await;

    let start = Instant::now();
    let waiter = executor.idle(Event::PLAYER, Some(Duration::from_secs(1)));
    assert_eq!(waiter.await.unwrap(), Event::TIMEOUT);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(1) + Duration::from_millis(100));

    server.send("state: stop\nOK\n").await;
    assert_eq!(status.await.unwrap().as_map().unwrap()["state"], "stop");
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_does_not_wait_for_noidle_reply() {
    let (client, mut server) = connected().await;
    let executor = client.executor();
    let start = Instant::now();
    let waiter = executor.idle(Event::PLAYER, Some(Duration::from_secs(1)));

    server.expect("idle player").await;
    server.expect("noidle").await;
    assert_eq!(waiter.await.unwrap(), Event::TIMEOUT);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(1) + Duration::from_millis(100));

    server.send("OK\n").await;
    let ping = executor.request("ping", []);
    server.expect("ping").await;
    server.send("OK\n").await;
    assert_eq!(ping.await.unwrap(), Reply::Empty);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_reissues_idle_for_remaining_waiters() {
    let (client, mut server) = connected().await;
    let executor = client.executor();
    let short = executor.idle(Event::PLAYER, Some(Duration::from_secs(2)));
    let long = executor.idle(Event::MIXER, None);

    server.expect("idle player mixer").await;
    server.expect("noidle").await;
    server.send("OK\n").await;
    assert_eq!(short.await.unwrap(), Event::TIMEOUT);

    server.expect("idle mixer").await;
    server.send("changed: mixer\nOK\n").await;
    assert_eq!(long.await.unwrap(), Event::MIXER);
  }

  #[tokio::test(start_paused = true)]
  async fn test_queued_request_takes_precedence_over_timeout() {
    let (client, mut server) = connected().await;
    let executor = client.executor();
    let waiter = executor.idle(Event::PLAYER, Some(Duration::from_secs(5)));
    server.expect("idle player").await;

    // The request is queued in the same instant the deadline passes.
    let status = executor.request("status", []);
    tokio::time::advance(Duration::from_secs(5)).await;

    server.expect("noidle").await;
    server.send("OK\n").await;
    server.expect("status").await;
    // The timed-out waiter was resolved before the request went out.
    assert_eq!(waiter.await.unwrap(), Event::TIMEOUT);
    server.send("volume: 5\nOK\n").await;
    assert!(status.await.is_ok());

    // No idle was re-issued: the next line is the next request.
    let ping = executor.request("ping", []);
    server.expect("ping").await;
    server.send("OK\n").await;
    ping.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_new_subsystem_widens_idle() {
    let (client, mut server) = connected().await;
    let executor = client.executor();

    let player = executor.idle(Event::PLAYER, None);
    server.expect("idle player").await;
    let mixer = executor.idle(Event::MIXER, None);
    server.expect("noidle").await;
    server.send("OK\n").await;
    server.expect("idle player mixer").await;

    server.send("changed: mixer\nOK\n").await;
    assert_eq!(mixer.await.unwrap(), Event::MIXER);
    server.expect("idle player").await;
    server.send("changed: player\nchanged: options\nOK\n").await;
    assert_eq!(player.await.unwrap(), Event::PLAYER);
  }

  #[tokio::test(start_paused = true)]
  async fn test_last_waiter_leaving_ends_idle() {
    let (client, mut server) = connected().await;
    let scope = client.executor().sub_scope();
    let waiter = scope.idle(Event::DATABASE, None);
    server.expect("idle database").await;

    scope.close();
    assert!(matches!(waiter.await, Err(MpdError::Cancelled)));
    server.expect("noidle").await;
    server.send("OK\n").await;

    let ping = client.executor().request("ping", []);
    server.expect("ping").await;
    server.send("OK\n").await;
    ping.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_event() {
    let (client, mut server) = connected().await;
    let executor = client.executor();

    // Nothing pending: resolves at once.
    assert_eq!(executor.idle(Event::IDLE, None).await.unwrap(), Event::IDLE);

    let status = executor.request("status", []);
    let waiter = executor.idle(Event::IDLE, None);
    server.expect("status").await;
    server.send("OK\n").await;
    status.await.unwrap();
    assert_eq!(waiter.await.unwrap(), Event::IDLE);
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_rejected_by_server() {
    let (client, mut server) = connected().await;
    let waiter = client.executor().idle(Event::PLAYER, None);
    server.expect("idle player").await;
    server.send("ACK [5@0] {idle} unknown command\n").await;

    match waiter.await {
      Err(MpdError::Command(err)) => assert_eq!(err.command, "idle"),
      other => panic!("Expected command error, got {:?}", other),
    }
  }
}
