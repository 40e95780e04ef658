//! Change notification unifier.
//!
//! Every adapter feeds full snapshots into a [`SnapshotSink`]; callers consume
//! them either as a [`SnapshotStream`] or through a callback bound to a
//! [`Subscription`] handle. Whatever the native transport (event stream,
//! channel, timer), delivery looks the same: full current snapshot, errors do
//! not end the subscription, and cancellation is idempotent.

use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use parking_lot::ReentrantMutex;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    core::{Operation, Provider, Record},
    error::{ConnectorResult, NativeError, NormalizedError},
};

/// One delivery: the full current result set, or a normalized error.
pub type SnapshotResult = Result<Vec<Record>, NormalizedError>;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Producer side
// ============================================================================

/// Handle the adapter's producer task delivers snapshots through.
pub(crate) struct SnapshotSink {
    provider: Provider,
    path: String,
    tx: mpsc::Sender<SnapshotResult>,
    cancel: CancellationToken,
}

impl SnapshotSink {
    /// Returns `false` once the consumer is gone and the producer should stop.
    pub async fn deliver(&self, item: SnapshotResult) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    pub async fn deliver_records(&self, records: Vec<Record>) -> bool {
        self.deliver(Ok(records)).await
    }

    /// Deliver a `<PREFIX>_SNAPSHOT_ERROR` without ending the subscription.
    pub async fn deliver_error(&self, native: NativeError) -> bool {
        let err = match native {
            NativeError::Normalized(err) => *err,
            other => NormalizedError::from_native(self.provider, Operation::Snapshot, other)
                .with_context("path", self.path.as_str()),
        };
        tracing::warn!(
            provider = %self.provider,
            path = %self.path,
            code = %err.code,
            "Snapshot error delivered to subscriber"
        );
        self.deliver(Err(err)).await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Sleep for `duration`, returning `false` if cancelled first.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

// ============================================================================
// Stream side
// ============================================================================

/// Cancellable stream of full snapshots.
///
/// Closing (or dropping) the stream stops the producer task and discards any
/// buffered snapshot.
pub struct SnapshotStream {
    provider: Provider,
    rx: mpsc::Receiver<SnapshotResult>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl SnapshotStream {
    /// Start `producer` on the current runtime.
    ///
    /// Registration fails with `<PREFIX>_SNAPSHOT_SETUP_ERROR` when the path is
    /// empty or no async runtime is available.
    pub(crate) fn spawn<F, Fut>(
        provider: Provider,
        path: &str,
        producer: F,
    ) -> ConnectorResult<Self>
    where
        F: FnOnce(SnapshotSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let setup_error = |message: String| {
            NormalizedError::new(
                provider.error_code(Operation::SnapshotSetup),
                message,
                provider.as_str(),
            )
            .with_context("path", path)
        };

        if path.trim().is_empty() {
            return Err(setup_error("subscription path must not be empty".to_string()));
        }
        let runtime = Handle::try_current()
            .map_err(|e| setup_error(format!("no async runtime available: {e}")))?;

        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let sink = SnapshotSink {
            provider,
            path: path.to_string(),
            tx,
            cancel: cancel.clone(),
        };

        let task = producer(sink);
        let token = cancel.clone();
        let log_path = path.to_string();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
            debug!(provider = %provider, path = %log_path, "Snapshot producer stopped");
        });

        debug!(provider = %provider, path = %path, "Snapshot producer started");
        Ok(Self {
            provider,
            rx,
            cancel,
            runtime,
        })
    }

    /// Stop delivery. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

impl Stream for SnapshotStream {
    type Item = SnapshotResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStream")
            .field("provider", &self.provider)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Callback side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Unsubscribed,
}

/// Serializes callback invocations against `unsubscribe`.
///
/// Reentrant so a callback may unsubscribe itself.
struct DeliveryGate {
    state: ReentrantMutex<Cell<SubscriptionState>>,
}

/// Handle returned by `on_snapshot`.
///
/// After [`Subscription::unsubscribe`] returns, the callback is never invoked
/// again. Dropping the handle unsubscribes.
pub struct Subscription {
    provider: Provider,
    gate: Arc<DeliveryGate>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn attach<F>(stream: SnapshotStream, callback: F) -> Self
    where
        F: FnMut(SnapshotResult) + Send + 'static,
    {
        let gate = Arc::new(DeliveryGate {
            state: ReentrantMutex::new(Cell::new(SubscriptionState::Idle)),
        });
        let provider = stream.provider;
        let cancel = stream.cancel.clone();
        let runtime = stream.runtime.clone();

        gate.state.lock().set(SubscriptionState::Subscribed);

        let driver_gate = gate.clone();
        runtime.spawn(async move {
            let mut stream = stream;
            let mut callback = callback;
            while let Some(item) = stream.next().await {
                let guard = driver_gate.state.lock();
                if guard.get() != SubscriptionState::Subscribed {
                    break;
                }
                callback(item);
            }
        });

        Self {
            provider,
            gate,
            cancel,
        }
    }

    /// Stop all further delivery. Idempotent.
    pub fn unsubscribe(&self) {
        let guard = self.gate.state.lock();
        if guard.get() == SubscriptionState::Unsubscribed {
            return;
        }
        guard.set(SubscriptionState::Unsubscribed);
        drop(guard);
        self.cancel.cancel();
        debug!(provider = %self.provider, "Subscription cancelled");
    }

    pub fn state(&self) -> SubscriptionState {
        self.gate.state.lock().get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Subscribed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish()
    }
}
