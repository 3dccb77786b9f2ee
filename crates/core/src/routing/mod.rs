pub mod dispatch;
pub mod gate;
pub mod queue;
pub mod rate_limit;

use std::time::Duration;
use thiserror::Error;

use crate::domain::message::MessageError;

#[derive(Debug, Error)]
pub enum RouterError {
  /// Quota exceeded. Never fatal: callers drop, requeue lower, or retry
  /// after the given wait.
  #[error("rate limited; retry after {retry_after:?}")]
  RateLimited { retry_after: Duration },
  #[error(transparent)]
  Rejected(#[from] MessageError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
