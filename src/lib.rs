//! storylink: serialized operation queues and synchronized JSON link
//! documents for composing multi-module stories on top of a replicated
//! key-value store.

pub mod link;
pub mod operation;
pub mod storage;
pub mod story;
