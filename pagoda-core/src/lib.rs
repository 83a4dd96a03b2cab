//! Pagoda core types: geometry, numeric element traits, cache views, config and errors.

pub mod cache;
pub mod config;
pub mod element;
pub mod error;
pub mod geometry;
pub mod types;

pub use cache::{CacheUsage, KvCacheView};
pub use config::EngineConfig;
pub use element::{Accumulator, Element};
pub use error::{PagodaError, Result, ensure_len};
pub use geometry::Geometry;
pub use types::*;
