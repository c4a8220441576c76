use crate::{BoxError, PresentationSink, Registry, ResolutionError, Scope, Unit};
use futures::future::AbortHandle;
use slotmap::{DefaultKey, SlotMap};
use std::{
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::broadcast;

mod builder;
pub use self::builder::ControllerBuilder;

/// Lifecycle phase of a [`Controller`].
///
/// [`Controller::phase`] only reports settled or resolving phases. Retirement runs
/// inside the same critical section as the swap that triggers it, so
/// [`Phase::Deactivating`] is never observed from outside the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No unit is active and nothing is in flight.
    #[default]
    Idle,
    /// A variant is resolving. The previous unit, if any, is still active.
    Activating,
    /// A unit is active and nothing is in flight.
    Active,
    /// The active unit is being retired.
    ///
    /// Internal to a swap, [`clear`](Controller::clear) or
    /// [`shutdown`](Controller::shutdown).
    Deactivating,
}

/// Result of a successful [`Controller::on_state_change`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<K> {
    /// The unit for this key was installed.
    Activated(K),
    /// The state mapped to the active or in-flight key, so nothing changed.
    Unchanged,
    /// A newer state change arrived before this activation resolved.
    Superseded,
}

/// Error activating a variant.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// The variant could not be resolved from the registry.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// The resolved constructor failed.
    #[error("failed to construct variant `{key}`")]
    Construct {
        /// Debug representation of the requested key.
        key: String,
        /// Error reported by the constructor.
        #[source]
        source: BoxError,
    },
}

/// Event broadcast by a [`Controller`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<K> {
    /// Resolution of a variant started.
    Activating(K),
    /// An in-flight activation was discarded.
    Superseded(K),
    /// A unit was retired.
    Deactivated(K),
    /// A unit was installed and presented.
    Activated(K),
    /// An activation failed. The previous unit, if any, is still active.
    Failed {
        /// Key of the failed activation.
        key: K,
        /// Rendered error.
        reason: String,
    },
}

struct Active<K, T> {
    key: K,
    unit: T,
    scope: Scope,
    deactivate: fn(&mut T),
}

impl<K, T> Active<K, T> {
    fn retire(mut self) -> K {
        (self.deactivate)(&mut self.unit);
        self.scope.release();
        self.key
    }
}

pub(crate) struct State<K, T> {
    active: Option<Active<K, T>>,
    pending: Option<K>,
    generation: u64,
    phase: Phase,
    sink: Box<dyn PresentationSink<K, T>>,
    pub(crate) subscriptions: SlotMap<DefaultKey, AbortHandle>,
}

impl<K, T> State<K, T> {
    fn settled_phase(&self) -> Phase {
        if self.active.is_some() {
            Phase::Active
        } else {
            Phase::Idle
        }
    }
}

/// Activation controller.
///
/// The controller owns at most one active unit. Each observed state of type `S`
/// is mapped to a variant key `K`; when the key changes, the variant is resolved
/// from the [`Registry`], constructed, and swapped in. The old unit is retired
/// before the new one is presented, and it stays active until then.
///
/// Only the latest state change can commit: an activation that is still resolving
/// when a newer one starts is discarded.
///
/// Unit constructors, teardown hooks and the [`PresentationSink`] run while the
/// controller is locked, and must not call back into it.
pub struct Controller<S, K, T> {
    registry: Arc<Registry<K, T>>,
    mapper: Box<dyn Fn(&S) -> K + Send + Sync>,
    state: Mutex<State<K, T>>,
    events: broadcast::Sender<Event<K>>,
}

impl<S, K, T> Controller<S, K, T>
where
    K: Clone + 'static,
    T: 'static,
{
    /// Create a new [`Controller`] that maps states to keys with `mapper`.
    pub fn new(
        registry: Arc<Registry<K, T>>,
        mapper: impl Fn(&S) -> K + Send + Sync + 'static,
    ) -> Self {
        Self::builder(registry, mapper).build()
    }

    /// Create a [`ControllerBuilder`] for a controller that maps states to keys with `mapper`.
    pub fn builder(
        registry: Arc<Registry<K, T>>,
        mapper: impl Fn(&S) -> K + Send + Sync + 'static,
    ) -> ControllerBuilder<S, K, T> {
        ControllerBuilder::new(registry, mapper)
    }
}

impl<S, K, T> Controller<S, K, T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State<K, T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry this controller resolves variants from.
    pub fn registry(&self) -> &Arc<Registry<K, T>> {
        &self.registry
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Subscribe to events from this controller.
    pub fn events(&self) -> broadcast::Receiver<Event<K>> {
        self.events.subscribe()
    }

    /// Run `f` with the active unit, if any.
    pub fn with_active<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().active.as_ref().map(|active| f(&active.unit))
    }

    fn emit(&self, event: Event<K>) {
        // Sending only fails when nobody is listening.
        let _ = self.events.send(event);
    }
}

impl<S, K, T> Controller<S, K, T>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Unit,
{
    /// Key of the active unit, if any.
    pub fn active_key(&self) -> Option<K> {
        self.lock().active.as_ref().map(|active| active.key.clone())
    }

    /// Key of the in-flight activation, if any.
    pub fn pending_key(&self) -> Option<K> {
        self.lock().pending.clone()
    }

    /// Handle a new observed state.
    ///
    /// If `state` maps to the key of the in-flight activation, or to the active key
    /// while nothing is in flight, this does nothing. Mapping back to the active key
    /// while another key is in flight discards the in-flight activation.
    ///
    /// On failure the previous unit stays active, and the error is both returned and
    /// broadcast as [`Event::Failed`].
    pub async fn on_state_change(&self, state: S) -> Result<Outcome<K>, ActivationError> {
        let key = (self.mapper)(&state);

        let generation = {
            let mut inner = self.lock();

            let is_active = inner.active.as_ref().is_some_and(|active| active.key == key);
            let is_pending = inner.pending.as_ref() == Some(&key);
            if is_pending || (is_active && inner.pending.is_none()) {
                return Ok(Outcome::Unchanged);
            }

            inner.generation += 1;

            if is_active {
                if let Some(pending) = inner.pending.take() {
                    self.emit(Event::Superseded(pending));
                }
                inner.phase = Phase::Active;
                return Ok(Outcome::Unchanged);
            }

            if let Some(pending) = inner.pending.replace(key.clone()) {
                #[cfg(feature = "tracing")]
                tracing::trace!("Supersede activation: {:?}", pending);

                self.emit(Event::Superseded(pending));
            }
            inner.phase = Phase::Activating;

            #[cfg(feature = "tracing")]
            tracing::trace!("Activate: {:?}", key);

            self.emit(Event::Activating(key.clone()));
            inner.generation
        };

        let mut guard = InFlight {
            controller: self,
            generation,
            is_armed: true,
        };
        let result = self.registry.resolve(&key).await;
        guard.is_armed = false;

        let mut inner = self.lock();
        if inner.generation != generation {
            #[cfg(feature = "tracing")]
            tracing::trace!("Discard superseded activation: {:?}", key);

            return Ok(Outcome::Superseded);
        }
        inner.pending = None;

        let constructor = match result {
            Ok(constructor) => constructor,
            Err(error) => return Err(self.fail(&mut inner, key, error.into())),
        };

        let mut scope = Scope::new();
        let unit = match constructor.construct(&mut scope) {
            Ok(unit) => unit,
            Err(source) => {
                scope.release();

                let error = ActivationError::Construct {
                    key: format!("{key:?}"),
                    source,
                };
                return Err(self.fail(&mut inner, key, error));
            }
        };

        if let Some(old) = inner.active.take() {
            inner.phase = Phase::Deactivating;
            let old_key = old.retire();

            #[cfg(feature = "tracing")]
            tracing::trace!("Retired: {:?}", old_key);

            self.emit(Event::Deactivated(old_key));
        }

        inner.sink.present(&key, &unit);
        inner.active = Some(Active {
            key: key.clone(),
            unit,
            scope,
            deactivate: T::deactivate,
        });
        inner.phase = Phase::Active;

        #[cfg(feature = "tracing")]
        tracing::trace!("Activated: {:?}", key);

        self.emit(Event::Activated(key.clone()));
        Ok(Outcome::Activated(key))
    }

    fn fail(
        &self,
        inner: &mut State<K, T>,
        key: K,
        error: ActivationError,
    ) -> ActivationError {
        #[cfg(feature = "tracing")]
        tracing::warn!("Activation of {:?} failed: {}", key, error);

        inner.phase = inner.settled_phase();
        self.emit(Event::Failed {
            key,
            reason: error.to_string(),
        });
        error
    }

    /// Retire the active unit and clear the sink.
    ///
    /// Any in-flight activation is discarded. Subscriptions keep running.
    pub fn clear(&self) {
        let mut inner = self.lock();
        self.clear_locked(&mut inner);
    }

    fn clear_locked(&self, inner: &mut State<K, T>) {
        inner.generation += 1;
        if let Some(pending) = inner.pending.take() {
            self.emit(Event::Superseded(pending));
        }

        if let Some(old) = inner.active.take() {
            inner.phase = Phase::Deactivating;
            let old_key = old.retire();

            #[cfg(feature = "tracing")]
            tracing::trace!("Retired: {:?}", old_key);

            self.emit(Event::Deactivated(old_key));
        }

        inner.sink.clear();
        inner.phase = Phase::Idle;
    }

    /// Stop every subscription, then retire the active unit and clear the sink.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::trace!("Shutdown controller");

        let mut inner = self.lock();
        for (_, handle) in inner.subscriptions.drain() {
            handle.abort();
        }
        self.clear_locked(&mut inner);
    }
}

impl<S, K, T> Drop for Controller<S, K, T> {
    fn drop(&mut self) {
        let inner = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in inner.subscriptions.drain() {
            handle.abort();
        }
        if let Some(old) = inner.active.take() {
            old.retire();
            inner.sink.clear();
        }
    }
}

/// Clears the pending key if an activation is dropped while resolving.
struct InFlight<'a, S, K, T> {
    controller: &'a Controller<S, K, T>,
    generation: u64,
    is_armed: bool,
}

impl<S, K, T> Drop for InFlight<'_, S, K, T> {
    fn drop(&mut self) {
        if !self.is_armed {
            return;
        }

        let mut inner = self.controller.lock();
        if inner.generation == self.generation {
            inner.generation += 1;
            inner.pending = None;
            inner.phase = inner.settled_phase();
        }
    }
}

impl<S, K, T> fmt::Debug for Controller<S, K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Controller")
            .field("active", &inner.active.as_ref().map(|active| &active.key))
            .field("pending", &inner.pending)
            .field("phase", &inner.phase)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Controller, Event, Outcome, Phase};
    use crate::{factory, Registry, Unit};
    use futures::executor::block_on;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Unit1;

    impl Unit for Unit1 {}

    #[test]
    fn it_starts_idle() {
        let registry: Arc<Registry<u8, Unit1>> = Arc::new(Registry::new());
        let controller = Controller::new(registry, |state: &u8| *state);

        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.active_key(), None);
        assert_eq!(controller.pending_key(), None);
        assert!(controller.with_active(|_| ()).is_none());
    }

    #[test]
    fn it_clamps_event_capacity() {
        let registry = Arc::new(Registry::new());
        registry.register(1, factory::ready(|_| Ok(Unit1)));

        let controller = Controller::builder(registry, |state: &u8| *state)
            .event_capacity(0)
            .build();
        let mut events = controller.events();

        assert_eq!(
            block_on(controller.on_state_change(1)).unwrap(),
            Outcome::Activated(1)
        );
        assert_eq!(events.try_recv(), Err(TryRecvError::Lagged(1)));
        assert_eq!(events.try_recv().unwrap(), Event::Activated(1));
    }

    #[test]
    fn it_clears_without_unsubscribing() {
        let registry = Arc::new(Registry::new());
        registry.register(1, factory::ready(|_| Ok(Unit1)));

        let controller = Controller::new(registry, |state: &u8| *state);
        block_on(controller.on_state_change(1)).unwrap();

        controller.clear();
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.active_key(), None);

        assert_eq!(
            block_on(controller.on_state_change(1)).unwrap(),
            Outcome::Activated(1)
        );
        assert!(format!("{controller:?}").contains("Some(1)"));
    }

    #[test]
    fn it_settles_after_retiring() {
        let registry = Arc::new(Registry::new());
        registry.register(1, factory::ready(|_| Ok(Unit1)));
        registry.register(2, factory::ready(|_| Ok(Unit1)));

        let controller = Controller::new(registry, |state: &u8| *state);
        block_on(controller.on_state_change(1)).unwrap();
        block_on(controller.on_state_change(2)).unwrap();
        assert_eq!(controller.phase(), Phase::Active);

        controller.shutdown();
        assert_eq!(controller.phase(), Phase::Idle);
    }
}
