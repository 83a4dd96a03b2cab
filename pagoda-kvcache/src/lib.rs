//! Pagoda KV cache: block manager and paged K/V store.
//!
//! This crate plays the cache-manager role around the attention kernels: it
//! owns the memory, hands out physical blocks, and produces the block tables
//! and [`KvCacheView`](pagoda_core::KvCacheView)s the kernels borrow.

pub mod block;
pub mod store;

pub use block::BlockManager;
pub use store::PagedKvStore;
