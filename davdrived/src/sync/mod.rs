pub mod backoff;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
mod filter;
pub mod full_sync;
pub mod incoming;
pub mod local_item;
pub mod local_watcher;
pub mod locks;
pub mod mapping;
pub mod monitor;
pub mod outgoing;
pub mod placeholder;
pub mod queue;
mod shadow;
pub mod side_store;

#[cfg(test)]
mod testing;
