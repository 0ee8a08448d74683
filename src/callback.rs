//! One-shot result delivery between storage producers and their callers.
//!
//! A [`Continuation`] is consumed when it fires, so a producer cannot deliver
//! twice. [`Continuation::remembering`] pairs a continuation with a
//! [`Remembered`] receiver that a synchronous caller can block on while the
//! storage work completes on another thread.

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::fmt;
use tracing::error;

/// Why a storage operation did not produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageStatus {
  /// The key (or row) does not exist.
  KeyNotFound,
  /// The write matched nothing and was not stored.
  NotStored,
  /// The backend reported a failure.
  Failed,
  /// The producer dropped the continuation without delivering a result.
  Abandoned,
}

impl fmt::Display for StorageStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      StorageStatus::KeyNotFound => "key not found",
      StorageStatus::NotStored => "not stored",
      StorageStatus::Failed => "failed",
      StorageStatus::Abandoned => "abandoned",
    };
    write!(f, "{value}")
  }
}

/// Outcome of a single storage operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageResult<T> {
  Success(T),
  Failure(StorageStatus),
}

impl<T> StorageResult<T> {
  pub fn is_success(&self) -> bool {
    matches!(self, StorageResult::Success(_))
  }

  pub fn payload(&self) -> Option<&T> {
    match self {
      StorageResult::Success(value) => Some(value),
      StorageResult::Failure(_) => None,
    }
  }

  pub fn into_payload(self) -> Option<T> {
    match self {
      StorageResult::Success(value) => Some(value),
      StorageResult::Failure(_) => None,
    }
  }

  pub fn status(&self) -> Option<StorageStatus> {
    match self {
      StorageResult::Success(_) => None,
      StorageResult::Failure(status) => Some(*status),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StorageResult<U> {
    match self {
      StorageResult::Success(value) => StorageResult::Success(f(value)),
      StorageResult::Failure(status) => StorageResult::Failure(status),
    }
  }
}

/// Single-use receiver of a [`StorageResult`], callable from any thread.
///
/// Dropping a continuation that was never fired is logged as an error.
pub struct Continuation<T> {
  deliver: Option<Box<dyn FnOnce(StorageResult<T>) + Send + 'static>>,
}

impl<T: Send + 'static> Continuation<T> {
  pub fn new(deliver: impl FnOnce(StorageResult<T>) + Send + 'static) -> Self {
    Self {
      deliver: Some(Box::new(deliver)),
    }
  }

  /// A continuation that discards its result.
  pub fn ignore() -> Self {
    Self::new(|_| {})
  }

  /// Blocking variant: the returned [`Remembered`] captures the delivered value.
  pub fn remembering() -> (Self, Remembered<T>) {
    let (tx, rx) = bounded(1);
    let continuation = Self::new(move |result| {
      // A dropped receiver means nobody waits for the value any more.
      let _ = tx.send(result);
    });
    (continuation, Remembered { rx })
  }

  /// Fire the continuation.
  pub fn call(mut self, result: StorageResult<T>) {
    if let Some(deliver) = self.deliver.take() {
      deliver(result);
    }
  }

  pub fn success(self, value: T) {
    self.call(StorageResult::Success(value))
  }

  pub fn failure(self, status: StorageStatus) {
    self.call(StorageResult::Failure(status))
  }
}

impl<T> Drop for Continuation<T> {
  fn drop(&mut self) {
    if self.deliver.is_some() {
      error!("storage continuation dropped without delivering a result");
    }
  }
}

impl<T> fmt::Debug for Continuation<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Continuation").finish_non_exhaustive()
  }
}

/// Receiving half of [`Continuation::remembering`].
#[derive(Debug)]
pub struct Remembered<T> {
  rx: Receiver<StorageResult<T>>,
}

impl<T> Remembered<T> {
  /// True once the producer has delivered a value.
  pub fn is_fired(&self) -> bool {
    !self.rx.is_empty()
  }

  /// Return the delivered value, blocking until the producer fires.
  ///
  /// Returns immediately when the value already arrived. A producer that
  /// drops its continuation without firing yields `Failure(Abandoned)`.
  pub fn wait_for_value(self) -> StorageResult<T> {
    match self.rx.recv() {
      Ok(result) => result,
      Err(_) => {
        error!("storage continuation dropped without delivering a result");
        StorageResult::Failure(StorageStatus::Abandoned)
      }
    }
  }

  /// Non-blocking check; hands the receiver back when nothing arrived yet.
  pub fn try_value(self) -> std::result::Result<StorageResult<T>, Self> {
    match self.rx.try_recv() {
      Ok(result) => Ok(result),
      Err(TryRecvError::Empty) => Err(self),
      Err(TryRecvError::Disconnected) => Ok(StorageResult::Failure(StorageStatus::Abandoned)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Continuation, StorageResult, StorageStatus};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn wait_after_delivery_returns_immediately() {
    let (continuation, remembered) = Continuation::<u64>::remembering();
    continuation.success(42);
    assert!(remembered.is_fired());
    assert_eq!(remembered.wait_for_value(), StorageResult::Success(42));
  }

  #[test]
  fn wait_blocks_until_other_thread_delivers() {
    let (continuation, remembered) = Continuation::<String>::remembering();
    let producer = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      continuation.success("done".to_string());
    });

    assert_eq!(
      remembered.wait_for_value(),
      StorageResult::Success("done".to_string())
    );
    producer.join().expect("join producer");
  }

  #[test]
  fn dropped_continuation_is_reported_as_abandoned() {
    let (continuation, remembered) = Continuation::<bool>::remembering();
    drop(continuation);
    assert_eq!(
      remembered.wait_for_value(),
      StorageResult::Failure(StorageStatus::Abandoned)
    );
  }

  #[test]
  fn try_value_hands_back_receiver_when_pending() {
    let (continuation, remembered) = Continuation::<i64>::remembering();
    let remembered = remembered.try_value().expect_err("nothing delivered yet");
    continuation.failure(StorageStatus::KeyNotFound);
    let result = remembered.try_value().expect("delivered");
    assert_eq!(result.status(), Some(StorageStatus::KeyNotFound));
  }

  #[test]
  fn unfired_continuation_is_dropped_without_delivery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let continuation = Continuation::<u32>::new(move |_| {
      counted.fetch_add(1, Ordering::SeqCst);
    });
    drop(continuation);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let counted = Arc::clone(&calls);
    let continuation = Continuation::<u32>::new(move |_| {
      counted.fetch_add(1, Ordering::SeqCst);
    });
    continuation.success(7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
