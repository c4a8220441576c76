//! # swapview
//! Swapview activates one variant of a view at a time, chosen by an observed state.
//!
//! A [`Registry`] holds lazily resolved factories keyed by a variant key.
//! A [`Controller`] maps each observed state to a key, resolves the factory for it,
//! and swaps the active unit: the old unit is always retired before the new one
//! becomes visible.
//!
//! ```
//! use swapview::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! enum View {
//!     Guest,
//!     LoggedIn,
//! }
//!
//! struct Page(&'static str);
//!
//! impl Unit for Page {}
//!
//! let registry = Arc::new(Registry::new());
//! registry.register(View::Guest, factory::ready(|_| Ok(Page("guest"))));
//! registry.register(View::LoggedIn, factory::ready(|_| Ok(Page("client"))));
//!
//! let controller = Controller::new(registry, |is_logged_in: &bool| {
//!     if *is_logged_in {
//!         View::LoggedIn
//!     } else {
//!         View::Guest
//!     }
//! });
//!
//! futures::executor::block_on(async {
//!     controller.on_state_change(false).await.unwrap();
//!     assert_eq!(controller.active_key(), Some(View::Guest));
//!
//!     controller.on_state_change(true).await.unwrap();
//!     assert_eq!(controller.with_active(|page| page.0), Some("client"));
//! });
//! ```

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Prelude of commonly-used types.
/// `use swapview::prelude::*;`
pub mod prelude {
    pub use crate::{
        factory, ActivationError, Constructor, Controller, Event, Factory, Outcome, Phase,
        PresentationSink, Registry, ResolutionError, Scope, Subscription, Unit,
    };
}

mod controller;
pub use self::controller::{
    ActivationError, Controller, ControllerBuilder, Event, Outcome, Phase,
};

pub mod executor;
pub use self::executor::Executor;

mod registry;
pub use self::registry::{factory, Constructor, Factory, Registry, ResolutionError};

mod scope;
pub use self::scope::Scope;

mod sink;
pub use self::sink::PresentationSink;

pub mod source;
pub use self::source::Subscription;

/// Boxed error returned by user factories and constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Activatable unit owned by a [`Controller`].
///
/// A unit is created by a [`Constructor`] and lives until it is replaced
/// or the controller shuts down.
pub trait Unit: Send + 'static {
    /// Teardown hook, run before the unit is retired.
    ///
    /// Resources registered on the construction [`Scope`] are released right after this returns.
    fn deactivate(&mut self) {}
}

impl<T: Unit + ?Sized> Unit for Box<T> {
    fn deactivate(&mut self) {
        (**self).deactivate()
    }
}
