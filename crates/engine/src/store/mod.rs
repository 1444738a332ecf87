//! Transactional queue storage
//!
//! This module provides:
//! - [`QueueStore`] and [`StoreTransaction`] traits for durable named queues
//! - [`InMemoryQueueStore`] for tests and the demo host
//! - [`WorkItem`], the unit of work routed through the queues

mod item;
mod memory;
mod store;

pub use item::WorkItem;
pub use memory::InMemoryQueueStore;
pub use store::{QueueStore, StoreError, StoreTransaction};
