//! Tasks bound to an executor scope.
//!
//! A task starts running as soon as it is spawned and stops when its scope is
//! closed. Being stopped that way is not an error: the join handle yields
//! `Ok(())`. Any other error is logged and returned.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::MpdError;
use crate::mpd::Executor;

/// Spawn `routine` on the Tokio runtime, bound to `scope`.
pub fn spawn<F>(scope: &Executor, routine: F) -> JoinHandle<Result<(), MpdError>>
where
  F: Future<Output = Result<(), MpdError>> + Send + 'static,
{
  let token = scope.cancellation_token();
  let scope_id = scope.id();

  tokio::spawn(async move {
    tokio::select! {
      biased;
      _ = token.cancelled() => {
        log::debug!("Task in scope {} stopped: scope closed", scope_id);
        Ok(())
      }
      result = routine => match result {
        Err(MpdError::Cancelled) => {
          log::debug!("Task in scope {} cancelled", scope_id);
          Ok(())
        }
        Err(e) => {
          log::error!("Task in scope {} failed: {}", scope_id, e);
          Err(e)
        }
        Ok(()) => Ok(()),
      },
    }
  })
}
