//! An offline-first caching worker.
//!
//! The worker sits between a page and the network. It caches the static shell
//! at install time, routes every intercepted request to a caching strategy,
//! flushes queued work on background sync and turns push messages into
//! notifications.

pub mod cache;
pub mod clients;
pub mod config;
pub mod event;
pub mod http;
pub mod logging;
pub mod network;
pub mod notify;
pub mod pending;
pub mod router;
pub mod strategy;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;
