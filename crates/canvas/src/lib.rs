//! Shared pixel canvas: validation, storage, the full-canvas read cache and
//! fan-out of committed writes.
//!
//! A write flows `CanvasService::place_pixel` → [`PixelStore::upsert`] →
//! [`CanvasCache::invalidate`] → `BroadcastBus::publish(Scope::Canvas)`.

pub mod error;
pub mod model;
pub mod redis_store;
pub mod service;
pub mod store;

pub use error::{CanvasError, Result};
pub use model::{CanvasSize, Pixel, Region};
pub use redis_store::{RedisCanvasCache, RedisPixelStore};
pub use service::{CanvasService, DEFAULT_CACHE_TTL};
pub use store::{CanvasCache, MemoryCanvasCache, MemoryPixelStore, PixelStore};
