//! Single-shot completion primitive.
//!
//! A [`Completer`] / [`WaitHandle`] pair replaces the observable +
//! cancellation source + wrapping future triple: the handle exposes one
//! future, and fulfilment, failure, cancellation and timeout all complete
//! it at most once. The losing side of any race is discarded.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ProtocolError, ProtocolResult};

/// Create a connected completer / wait-handle pair.
pub fn completion<T>() -> (Completer<T>, WaitHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, WaitHandle { rx })
}

/// The fulfilment side of a single-shot completion.
///
/// Consuming methods make double-completion unrepresentable. Dropping an
/// unfulfilled completer cancels the wait.
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<ProtocolResult<T>>,
}

impl<T> Completer<T> {
    /// Complete the wait with a value.
    ///
    /// Returns false when the waiter is already gone (timed out or
    /// dropped), in which case the value is discarded.
    pub fn fulfil(self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Complete the wait with a failure.
    pub fn fail(self, error: ProtocolError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Complete the wait with [`ProtocolError::Cancelled`].
    pub fn cancel(self) -> bool {
        self.fail(ProtocolError::Cancelled)
    }

    /// Whether the waiting side is already gone.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The waiting side of a single-shot completion.
#[derive(Debug)]
pub struct WaitHandle<T> {
    rx: oneshot::Receiver<ProtocolResult<T>>,
}

impl<T> WaitHandle<T> {
    /// Wait for completion, at most `timeout`.
    ///
    /// Resolves with the fulfilled value, the failure the completer chose,
    /// [`ProtocolError::Cancelled`] when the completer was dropped, or
    /// [`ProtocolError::Timeout`] when the deadline passed first. Exactly
    /// one of these happens, even when a fulfilment races the deadline.
    pub async fn wait(self, timeout: Duration) -> ProtocolResult<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(ProtocolError::Cancelled),
            Err(_elapsed) => Err(ProtocolError::Timeout),
        }
    }
}
