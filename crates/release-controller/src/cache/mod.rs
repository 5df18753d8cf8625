//! Watch-fed caches of external objects.
//!
//! This module provides:
//!
//! - [`Store`]: read-only, eventually consistent view of one resource kind
//! - [`Informer`]: keeps a [`Store`] in sync with one namespace through a
//!   list-then-watch subscription and fans changes out to event handlers
//! - [`ReadinessGate`]: blocks until every informer finished its initial list
//!
//! Readers must treat store contents as advisory. A worker never writes the
//! store; it writes the backend and observes its own writes through the next
//! watch event.

mod informer;
mod store;

pub use informer::{EventHandler, Informer, ListWatch, ReadinessGate, SyncHandle};
pub use store::Store;
