//! Port implementations bundled with the core crate.
//!
//! - **InMemoryTaskStore**: TaskStore for tests and local runs
//!
//! Durable stores live outside this crate and plug in through `TaskStore`.

pub mod memory_store;

pub use self::memory_store::InMemoryTaskStore;
