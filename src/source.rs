//! State sources.
//!
//! Any [`Stream`] of states can drive a [`Controller`] through [`Controller::subscribe`].
//! [`watch`] adapts a [`tokio::sync::watch`] channel, the usual way to share a
//! last-value-wins flag between a UI and a controller.

use crate::{ActivationError, Controller, Executor, Outcome, Unit};
use futures::{
    future::{self, AbortHandle, Abortable, BoxFuture, Either, FutureExt},
    poll, stream,
    task::Poll,
    Stream, StreamExt,
};
use std::{
    fmt,
    hash::Hash,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::watch as tokio_watch;

/// Create a state source from a watch channel.
///
/// The source yields the current value first, then the latest value after every change.
/// It ends when the sender is dropped.
pub fn watch<S>(receiver: tokio_watch::Receiver<S>) -> impl Stream<Item = S> + Send + 'static
where
    S: Clone + Send + Sync + 'static,
{
    stream::unfold((receiver, true), |(mut receiver, is_first)| async move {
        if !is_first && receiver.changed().await.is_err() {
            return None;
        }

        let state = receiver.borrow_and_update().clone();
        Some((state, (receiver, false)))
    })
}

/// Handle to a running subscription created by [`Controller::subscribe`].
///
/// Dropping the handle stops the subscription. Use [`Subscription::detach`] to let it run
/// until its source ends or the controller shuts down.
#[must_use = "Subscriptions stop when dropped."]
pub struct Subscription {
    handle: Option<AbortHandle>,
    is_finished: Arc<AtomicBool>,
}

impl Subscription {
    /// Returns `true` if the subscription is still driving its controller.
    pub fn is_active(&self) -> bool {
        let is_aborted = self
            .handle
            .as_ref()
            .is_some_and(|handle| handle.is_aborted());

        !is_aborted && !self.is_finished.load(Ordering::SeqCst)
    }

    /// Stop the subscription.
    ///
    /// In-flight activations started by this subscription are dropped before they commit.
    pub fn unsubscribe(mut self) {
        self.abort();
    }

    /// Let the subscription run without this handle.
    pub fn detach(mut self) {
        self.handle = None;
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            #[cfg(feature = "tracing")]
            tracing::trace!("Unsubscribe");

            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("is_active", &self.is_active())
            .finish()
    }
}

impl<S, K, T> Controller<S, K, T>
where
    S: Send + 'static,
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Unit,
{
    /// Drive this controller from `source` on `executor`.
    ///
    /// Every state from the source is passed to [`Controller::on_state_change`].
    /// A new state is handled as soon as it arrives, so it supersedes any activation
    /// that is still resolving.
    ///
    /// The subscription stops when the source ends, when the returned [`Subscription`]
    /// is dropped, or when the controller shuts down.
    pub fn subscribe(
        self: &Arc<Self>,
        executor: &impl Executor,
        source: impl Stream<Item = S> + Send + 'static,
    ) -> Subscription {
        let (handle, registration) = AbortHandle::new_pair();
        let key = self.lock().subscriptions.insert(handle.clone());

        let is_finished = Arc::new(AtomicBool::new(false));
        let is_finished_handle = is_finished.clone();

        let controller = self.clone();
        let task = Abortable::new(drive(controller.clone(), source), registration);

        executor.spawn(Box::pin(async move {
            let _ = task.await;

            is_finished_handle.store(true, Ordering::SeqCst);
            controller.lock().subscriptions.remove(key);
        }));

        Subscription {
            handle: Some(handle),
            is_finished,
        }
    }
}

async fn drive<S, K, T>(
    controller: Arc<Controller<S, K, T>>,
    source: impl Stream<Item = S> + Send,
) where
    S: Send + 'static,
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Unit,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Subscribe");

    let mut source = pin!(source);
    let mut current: Option<BoxFuture<'_, Result<Outcome<K>, ActivationError>>> = None;

    loop {
        let state = match current.as_mut() {
            None => match source.next().await {
                Some(state) => state,
                None => break,
            },
            Some(activation) => {
                let next = match future::select(activation, source.next()).await {
                    Either::Left((result, _)) => Either::Left(result),
                    Either::Right((state, _)) => Either::Right(state),
                };

                match next {
                    Either::Left(result) => {
                        report(result);
                        current = None;
                        continue;
                    }
                    Either::Right(Some(state)) => state,
                    Either::Right(None) => break,
                }
            }
        };

        // Starting an activation supersedes the current one, which is dropped.
        // A state for the in-flight key leaves it running.
        let mut activation = controller.on_state_change(state).boxed();
        match poll!(activation.as_mut()) {
            Poll::Pending => current = Some(activation),
            Poll::Ready(result) => {
                let is_in_flight =
                    matches!(result, Ok(Outcome::Unchanged)) && controller.pending_key().is_some();
                if !is_in_flight {
                    current = None;
                }
                report(result);
            }
        }
    }

    if let Some(activation) = current {
        report(activation.await);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("State source ended");
}

fn report<K: fmt::Debug>(result: Result<Outcome<K>, ActivationError>) {
    match result {
        Ok(_outcome) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("Activation finished: {:?}", _outcome);
        }
        Err(_error) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Activation failed: {}", _error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::watch;
    use futures::{executor::block_on, StreamExt};
    use tokio::sync::watch as tokio_watch;

    #[test]
    fn it_yields_the_current_value_first() {
        let (tx, rx) = tokio_watch::channel(false);
        let source = watch(rx);
        let mut source = Box::pin(source);

        assert_eq!(block_on(source.next()), Some(false));

        tx.send(true).unwrap();
        assert_eq!(block_on(source.next()), Some(true));

        drop(tx);
        assert_eq!(block_on(source.next()), None);
    }

    #[test]
    fn it_skips_to_the_latest_value() {
        let (tx, rx) = tokio_watch::channel(0);
        let mut source = Box::pin(watch(rx));

        assert_eq!(block_on(source.next()), Some(0));

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(block_on(source.next()), Some(2));
    }
}
