use super::{Controller, State};
use crate::{PresentationSink, Registry};
use slotmap::SlotMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Builder for a [`Controller`].
///
/// Created with [`Controller::builder`].
pub struct ControllerBuilder<S, K, T> {
    registry: Arc<Registry<K, T>>,
    mapper: Box<dyn Fn(&S) -> K + Send + Sync>,
    sink: Box<dyn PresentationSink<K, T>>,
    event_capacity: usize,
}

impl<S, K, T> ControllerBuilder<S, K, T>
where
    K: Clone + 'static,
    T: 'static,
{
    pub(super) fn new(
        registry: Arc<Registry<K, T>>,
        mapper: impl Fn(&S) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            mapper: Box::new(mapper),
            sink: Box::new(()),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the sink that displays the active unit.
    pub fn sink(mut self, sink: impl PresentationSink<K, T> + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Set how many events a lagging [`Controller::events`] receiver may fall behind.
    ///
    /// Values below 1 are raised to 1.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build the [`Controller`].
    pub fn build(self) -> Controller<S, K, T> {
        let (events, _) = broadcast::channel(self.event_capacity);

        Controller {
            registry: self.registry,
            mapper: self.mapper,
            state: Mutex::new(State {
                active: None,
                pending: None,
                generation: 0,
                phase: Default::default(),
                sink: self.sink,
                subscriptions: SlotMap::new(),
            }),
            events,
        }
    }
}
