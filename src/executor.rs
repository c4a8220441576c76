//! Task executors.
//!
//! A [`Controller`](crate::Controller) never spawns on its own. Subscriptions hand their
//! driving task to an [`Executor`], so the crate works with tokio, a `futures` thread pool,
//! or anything that can accept a boxed future.

use futures::future::BoxFuture;
use std::sync::Arc;

/// Background task handed to an [`Executor`].
pub type Task = BoxFuture<'static, ()>;

/// Spawner for background tasks.
pub trait Executor {
    /// Run `task` to completion in the background.
    fn spawn(&self, task: Task);
}

/// Create an [`Executor`] from a function that spawns tasks.
///
/// ```
/// use swapview::executor::{self, Executor};
///
/// let pool = futures::executor::ThreadPool::new().unwrap();
/// let executor = executor::from_fn(move |task| pool.spawn_ok(task));
/// executor.spawn(Box::pin(async {}));
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: Fn(Task),
{
    FromFn { f }
}

/// [`Executor`] returned by [`from_fn`].
#[derive(Clone, Copy, Debug)]
pub struct FromFn<F> {
    f: F,
}

impl<F> Executor for FromFn<F>
where
    F: Fn(Task),
{
    fn spawn(&self, task: Task) {
        (self.f)(task)
    }
}

#[cfg(feature = "rt")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt")))]
impl Executor for tokio::runtime::Runtime {
    fn spawn(&self, task: Task) {
        // Dropping the join handle detaches the task.
        drop(tokio::runtime::Runtime::spawn(self, task));
    }
}

#[cfg(feature = "rt")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt")))]
impl Executor for tokio::runtime::Handle {
    fn spawn(&self, task: Task) {
        drop(tokio::runtime::Handle::spawn(self, task));
    }
}

impl Executor for futures::executor::ThreadPool {
    fn spawn(&self, task: Task) {
        self.spawn_ok(task);
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn spawn(&self, task: Task) {
        E::spawn(self, task)
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn spawn(&self, task: Task) {
        E::spawn(self, task)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn spawn(&self, task: Task) {
        E::spawn(self, task)
    }
}
