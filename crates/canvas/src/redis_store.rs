//! Redis-backed pixel store and canvas cache.
//!
//! Pixels live in one hash, field `{x}:{y}` → JSON, so an upsert is a single
//! `HSET`. The full-canvas cache is a plain string key with an expiry,
//! guarded by a generation counter that every invalidation increments.

use crate::error::Result;
use crate::model::{Pixel, Region};
use crate::store::{CanvasCache, PixelStore};
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hash of all committed pixels.
pub const PIXELS_KEY: &str = "canvas:pixels";

/// Full-canvas cache key.
pub const CANVAS_CACHE_KEY: &str = "canvas:full";

/// Counter bumped on every cache invalidation.
pub const CANVAS_GENERATION_KEY: &str = "canvas:generation";

/// KEYS[1] = generation, KEYS[2] = cache; ARGV = expected generation, json, ttl.
const GUARDED_FILL_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1]) or '0'
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
return 1
"#;

fn cell_field(x: u32, y: u32) -> String {
    format!("{}:{}", x, y)
}

#[derive(Clone)]
pub struct RedisPixelStore {
    client: Arc<redis::Client>,
}

impl RedisPixelStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl PixelStore for RedisPixelStore {
    async fn upsert(&self, pixel: &Pixel) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(pixel)?;
        conn.hset::<_, _, _, ()>(PIXELS_KEY, cell_field(pixel.x, pixel.y), json)
            .await?;
        Ok(())
    }

    async fn get(&self, x: u32, y: u32) -> Result<Option<Pixel>> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn.hget(PIXELS_KEY, cell_field(x, y)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn region(&self, region: Region) -> Result<Vec<Pixel>> {
        let mut conn = self.get_connection().await?;
        let values: Vec<String> = conn.hvals(PIXELS_KEY).await?;
        let mut pixels = Vec::new();
        for raw in values {
            match serde_json::from_str::<Pixel>(&raw) {
                Ok(p) if region.contains(p.x, p.y) => pixels.push(p),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed pixel record: {}", e),
            }
        }
        pixels.sort_by_key(|p| (p.y, p.x));
        Ok(pixels)
    }

    async fn count(&self) -> Result<usize> {
        let mut conn = self.get_connection().await?;
        let count: usize = conn.hlen(PIXELS_KEY).await?;
        Ok(count)
    }
}

#[derive(Clone)]
pub struct RedisCanvasCache {
    client: Arc<redis::Client>,
    fill_script: Arc<Script>,
}

impl RedisCanvasCache {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            fill_script: Arc::new(Script::new(GUARDED_FILL_SCRIPT)),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl CanvasCache for RedisCanvasCache {
    async fn get_full(&self) -> Result<Option<Vec<Pixel>>> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn.get(CANVAS_CACHE_KEY).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn generation(&self) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let generation: Option<u64> = conn.get(CANVAS_GENERATION_KEY).await?;
        Ok(generation.unwrap_or(0))
    }

    async fn put_full(&self, pixels: &[Pixel], ttl: Duration, generation: u64) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(pixels)?;
        let stored: i32 = self
            .fill_script
            .key(CANVAS_GENERATION_KEY)
            .key(CANVAS_CACHE_KEY)
            .arg(generation.to_string())
            .arg(json)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        if stored == 1 {
            debug!("Cached full canvas ({} pixels)", pixels.len());
        }
        Ok(stored == 1)
    }

    async fn invalidate(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .incr(CANVAS_GENERATION_KEY, 1)
            .ignore()
            .del(CANVAS_CACHE_KEY)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
