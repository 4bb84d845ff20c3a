//! Integration tests for `PersistenceCoordinator` over fault-injecting stores.

mod common;
mod coordinator;
mod sync;
