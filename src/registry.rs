use crate::{BoxError, Scope};
use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use std::{
    fmt,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

type Map<K, V> = HashMap<K, V, ahash::RandomState>;

/// Realized unit-constructor, produced by resolving a [`Factory`].
pub struct Constructor<T> {
    f: Arc<dyn Fn(&mut Scope) -> Result<T, BoxError> + Send + Sync>,
}

impl<T> Constructor<T> {
    /// Create a new [`Constructor`] from a function.
    pub fn new(f: impl Fn(&mut Scope) -> Result<T, BoxError> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Construct a new unit, registering its resources on `scope`.
    pub fn construct(&self, scope: &mut Scope) -> Result<T, BoxError> {
        (self.f)(scope)
    }
}

impl<T> Clone for Constructor<T> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<T> fmt::Debug for Constructor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constructor")
            .field("unit", &std::any::type_name::<T>())
            .finish()
    }
}

/// Deferred producer of a [`Constructor`].
///
/// Loading may suspend (for example to fetch or decode a plugin) and may fail.
/// This is implemented for any `Fn() -> impl Future<Output = Result<Constructor<T>, BoxError>>`.
pub trait Factory<T>: Send + Sync + 'static {
    /// Load the constructor for this factory's variant.
    fn load(&self) -> BoxFuture<'static, Result<Constructor<T>, BoxError>>;
}

impl<T, F, Fut> Factory<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Constructor<T>, BoxError>> + Send + 'static,
{
    fn load(&self) -> BoxFuture<'static, Result<Constructor<T>, BoxError>> {
        self().boxed()
    }
}

/// Factory constructors.
pub mod factory {
    use super::{Constructor, Factory};
    use crate::{BoxError, Scope};
    use futures::future::{self, TryFutureExt};
    use std::future::Future;

    /// Create a factory that resolves immediately to `f`.
    pub fn ready<T: 'static>(
        f: impl Fn(&mut Scope) -> Result<T, BoxError> + Send + Sync + 'static,
    ) -> impl Factory<T> {
        let constructor = Constructor::new(f);
        move || future::ready(Ok::<_, BoxError>(constructor.clone()))
    }

    /// Create a factory that runs `load` to obtain its constructor function.
    ///
    /// `load` runs again on every resolution that misses the registry cache.
    pub fn lazy<T, F, Fut, C>(load: F) -> impl Factory<T>
    where
        T: 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, BoxError>> + Send + 'static,
        C: Fn(&mut Scope) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        move || load().map_ok(Constructor::new)
    }
}

/// Error resolving a variant from a [`Registry`].
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No factory is registered for the key.
    #[error("no factory registered for variant `{key}`")]
    Missing {
        /// Debug representation of the requested key.
        key: String,
    },
    /// The factory failed to load its constructor.
    #[error("failed to load variant `{key}`")]
    Load {
        /// Debug representation of the requested key.
        key: String,
        /// Error reported by the factory.
        #[source]
        source: BoxError,
    },
}

struct Inner<K, T> {
    factories: Map<K, Arc<dyn Factory<T>>>,
    cache: Map<K, Constructor<T>>,
    /// Bumped whenever a load that is still running could become stale.
    epoch: u64,
}

/// Registry of variant factories.
///
/// Resolved constructors are cached per key until [`Registry::reset`] is called.
pub struct Registry<K, T> {
    inner: Mutex<Inner<K, T>>,
    is_cached: bool,
}

impl<K, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::with_cache(true)
    }
}

impl<K, T> Registry<K, T> {
    /// Create a new, empty [`Registry`] that caches resolved constructors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, empty [`Registry`] that loads its factory on every resolution.
    pub fn uncached() -> Self {
        Self::with_cache(false)
    }

    fn with_cache(is_cached: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                factories: Map::default(),
                cache: Map::default(),
                epoch: 0,
            }),
            is_cached,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.lock().factories.len()
    }

    /// Returns `true` if no factories are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().factories.is_empty()
    }

    /// Clear every cached constructor.
    ///
    /// The next resolution of each key will load its factory again.
    pub fn reset(&self) {
        #[cfg(feature = "tracing")]
        tracing::trace!("Reset registry cache");

        let mut inner = self.lock();
        inner.cache.clear();
        inner.epoch += 1;
    }
}

impl<K, T> Registry<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug,
    T: 'static,
{
    /// Register a factory for `key`, replacing any previous factory for the same key.
    pub fn register(&self, key: K, factory: impl Factory<T>) {
        #[cfg(feature = "tracing")]
        tracing::trace!("Register variant: {:?}", key);

        let mut inner = self.lock();
        inner.factories.insert(key, Arc::new(factory));
        inner.epoch += 1;
    }

    /// Remove the factory for `key`, returning `true` if one was registered.
    pub fn unregister(&self, key: &K) -> bool {
        let mut inner = self.lock();
        inner.cache.remove(key);
        inner.epoch += 1;
        inner.factories.remove(key).is_some()
    }

    /// Returns `true` if a factory is registered for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().factories.contains_key(key)
    }

    /// Returns `true` if a resolved constructor is cached for `key`.
    pub fn is_cached(&self, key: &K) -> bool {
        self.lock().cache.contains_key(key)
    }

    /// Registered keys, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.lock().factories.keys().cloned().collect()
    }

    /// Resolve the constructor for `key`.
    ///
    /// A load that finishes after [`Registry::reset`], [`Registry::register`] or
    /// [`Registry::unregister`] is returned to its caller but not cached.
    pub async fn resolve(&self, key: &K) -> Result<Constructor<T>, ResolutionError> {
        let (factory, epoch) = {
            let inner = self.lock();

            if let Some(constructor) = inner.cache.get(key) {
                #[cfg(feature = "tracing")]
                tracing::trace!("Resolve from cache: {:?}", key);

                return Ok(constructor.clone());
            }

            (inner.factories.get(key).cloned(), inner.epoch)
        };

        let Some(factory) = factory else {
            return Err(ResolutionError::Missing {
                key: format!("{key:?}"),
            });
        };

        #[cfg(feature = "tracing")]
        tracing::trace!("Load variant: {:?}", key);

        let constructor = factory
            .load()
            .await
            .map_err(|source| ResolutionError::Load {
                key: format!("{key:?}"),
                source,
            })?;

        if self.is_cached {
            let mut inner = self.lock();
            if inner.epoch == epoch {
                inner.cache.insert(key.clone(), constructor.clone());
            } else {
                #[cfg(feature = "tracing")]
                tracing::trace!("Discard stale load: {:?}", key);
            }
        }

        Ok(constructor)
    }
}

impl<K, T> fmt::Debug for Registry<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Registry")
            .field("keys", &inner.factories.keys().collect::<Vec<_>>())
            .field("cached", &inner.cache.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{factory, Constructor, Registry, ResolutionError};
    use crate::{BoxError, Scope};
    use futures::{channel::oneshot, executor::block_on, pin_mut, poll, task::Poll};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting(loads: Arc<AtomicUsize>, value: u32) -> impl super::Factory<u32> {
        move || {
            loads.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(Constructor::new(move |_: &mut Scope| Ok(value))) }
        }
    }

    #[test]
    fn it_resolves_registered_factories() {
        let registry = Registry::new();
        registry.register("a", factory::ready(|_| Ok(1)));
        registry.register("b", factory::ready(|_| Ok(2)));

        let constructor = block_on(registry.resolve(&"b")).unwrap();
        assert_eq!(constructor.construct(&mut Scope::new()).unwrap(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn it_reports_missing_keys() {
        let registry: Registry<&str, u32> = Registry::new();

        let error = block_on(registry.resolve(&"nope")).unwrap_err();
        assert!(matches!(error, ResolutionError::Missing { ref key } if key == "\"nope\""));
    }

    #[test]
    fn it_overwrites_duplicate_registrations() {
        let registry = Registry::uncached();
        registry.register("a", factory::ready(|_| Ok(1)));
        registry.register("a", factory::ready(|_| Ok(2)));

        let constructor = block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(constructor.construct(&mut Scope::new()).unwrap(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn it_caches_until_reset() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        registry.register("a", counting(loads.clone(), 7));

        block_on(registry.resolve(&"a")).unwrap();
        block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_cached(&"a"));

        registry.reset();
        assert!(!registry.is_cached(&"a"));

        block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn it_skips_cache_when_uncached() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = Registry::uncached();
        registry.register("a", counting(loads.clone(), 7));

        block_on(registry.resolve(&"a")).unwrap();
        block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn it_does_not_cache_failures() {
        let loads = Arc::new(AtomicUsize::new(0));
        let handle = loads.clone();

        let registry: Registry<&str, u32> = Registry::new();
        registry.register("a", move || {
            handle.fetch_add(1, Ordering::SeqCst);
            async { Err::<Constructor<u32>, BoxError>("decode failed".into()) }
        });

        for _ in 0..2 {
            let error = block_on(registry.resolve(&"a")).unwrap_err();
            assert!(matches!(error, ResolutionError::Load { .. }));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(!registry.is_cached(&"a"));
    }

    #[test]
    fn it_loads_lazy_factories() {
        let registry = Registry::new();
        registry.register(
            "a",
            factory::lazy(|| async {
                Ok::<_, BoxError>(|_: &mut Scope| Ok::<_, BoxError>(String::from("loaded")))
            }),
        );

        let constructor = block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(constructor.construct(&mut Scope::new()).unwrap(), "loaded");
    }

    #[test]
    fn it_unregisters() {
        let registry = Registry::new();
        registry.register("a", factory::ready(|_| Ok(1)));
        block_on(registry.resolve(&"a")).unwrap();

        assert!(registry.unregister(&"a"));
        assert!(!registry.contains(&"a"));
        assert!(!registry.is_cached(&"a"));
        assert!(!registry.unregister(&"a"));
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn it_keeps_reset_when_a_load_finishes_late() {
        let (tx, rx) = oneshot::channel::<()>();
        let gate = Arc::new(std::sync::Mutex::new(Some(rx)));

        let registry = Registry::new();
        registry.register("a", move || {
            let rx = gate.lock().unwrap().take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok::<_, BoxError>(Constructor::new(|_: &mut Scope| Ok(1)))
            }
        });

        block_on(async {
            let stale = registry.resolve(&"a");
            pin_mut!(stale);
            assert!(poll!(stale.as_mut()).is_pending());

            registry.register("a", factory::ready(|_| Ok(2)));
            registry.reset();

            tx.send(()).unwrap();
            let Poll::Ready(constructor) = poll!(stale) else {
                panic!("load should finish once released");
            };
            assert_eq!(constructor.unwrap().construct(&mut Scope::new()).unwrap(), 1);
        });

        assert!(!registry.is_cached(&"a"));
        let constructor = block_on(registry.resolve(&"a")).unwrap();
        assert_eq!(constructor.construct(&mut Scope::new()).unwrap(), 2);
    }
}
