//! Storage seams for canvas pixels and the derived full-canvas cache.

use crate::error::Result;
use crate::model::{Pixel, Region};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait PixelStore: Send + Sync {
    /// Insert or replace the pixel at `(pixel.x, pixel.y)`.
    async fn upsert(&self, pixel: &Pixel) -> Result<()>;

    async fn get(&self, x: u32, y: u32) -> Result<Option<Pixel>>;

    async fn region(&self, region: Region) -> Result<Vec<Pixel>>;

    async fn count(&self) -> Result<usize>;
}

/// Full-canvas snapshot cache.
///
/// Every `invalidate` bumps a generation counter. A loader reads the
/// generation before taking its store snapshot and hands it to `put_full`,
/// which refuses the refill if a write invalidated the cache in between.
#[async_trait]
pub trait CanvasCache: Send + Sync {
    async fn get_full(&self) -> Result<Option<Vec<Pixel>>>;

    async fn generation(&self) -> Result<u64>;

    /// Store `pixels` only if the generation still equals `generation`.
    /// Returns whether the snapshot was cached.
    async fn put_full(&self, pixels: &[Pixel], ttl: Duration, generation: u64) -> Result<bool>;

    async fn invalidate(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryPixelStore {
    pixels: DashMap<(u32, u32), Pixel>,
}

impl MemoryPixelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PixelStore for MemoryPixelStore {
    async fn upsert(&self, pixel: &Pixel) -> Result<()> {
        self.pixels.insert((pixel.x, pixel.y), pixel.clone());
        Ok(())
    }

    async fn get(&self, x: u32, y: u32) -> Result<Option<Pixel>> {
        Ok(self.pixels.get(&(x, y)).map(|p| p.clone()))
    }

    async fn region(&self, region: Region) -> Result<Vec<Pixel>> {
        let mut pixels: Vec<Pixel> = self
            .pixels
            .iter()
            .filter(|entry| region.contains(entry.x, entry.y))
            .map(|entry| entry.value().clone())
            .collect();
        pixels.sort_by_key(|p| (p.y, p.x));
        Ok(pixels)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.pixels.len())
    }
}

struct CachedCanvas {
    pixels: Vec<Pixel>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    slot: Option<CachedCanvas>,
    generation: u64,
}

#[derive(Default)]
pub struct MemoryCanvasCache {
    state: Mutex<CacheState>,
}

impl MemoryCanvasCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanvasCache for MemoryCanvasCache {
    async fn get_full(&self) -> Result<Option<Vec<Pixel>>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.slot.as_ref() {
            Some(cached) if Instant::now() < cached.expires_at => Ok(Some(cached.pixels.clone())),
            Some(_) => {
                state.slot = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn generation(&self) -> Result<u64> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.generation)
    }

    async fn put_full(&self, pixels: &[Pixel], ttl: Duration, generation: u64) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            return Ok(false);
        }
        state.slot = Some(CachedCanvas {
            pixels: pixels.to_vec(),
            expires_at: Instant::now() + ttl,
        });
        Ok(true)
    }

    async fn invalidate(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        state.slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pixel(x: u32, y: u32, color: &str) -> Pixel {
        Pixel {
            x,
            y,
            color: color.to_string(),
            user_id: 1,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_cell() {
        let store = MemoryPixelStore::new();
        store.upsert(&pixel(1, 1, "#000000")).await.unwrap();
        store.upsert(&pixel(1, 1, "#FFFFFF")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(1, 1).await.unwrap().unwrap().color, "#FFFFFF");
        assert!(store.get(2, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_region_filters_half_open() {
        let store = MemoryPixelStore::new();
        for (x, y) in [(0, 0), (5, 5), (10, 10), (9, 3)] {
            store.upsert(&pixel(x, y, "#123456")).await.unwrap();
        }
        let region = Region {
            x_min: 0,
            y_min: 0,
            x_max: 10,
            y_max: 10,
        };
        let cells: Vec<_> = store
            .region(region)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.x, p.y))
            .collect();
        assert_eq!(cells, vec![(0, 0), (9, 3), (5, 5)]);
    }

    #[tokio::test]
    async fn test_cache_expiry_and_invalidation() {
        let cache = MemoryCanvasCache::new();
        assert!(cache.get_full().await.unwrap().is_none());

        let generation = cache.generation().await.unwrap();
        assert!(cache
            .put_full(&[pixel(1, 1, "#000000")], Duration::from_secs(60), generation)
            .await
            .unwrap());
        assert_eq!(cache.get_full().await.unwrap().unwrap().len(), 1);

        cache.invalidate().await.unwrap();
        assert!(cache.get_full().await.unwrap().is_none());

        let generation = cache.generation().await.unwrap();
        cache
            .put_full(&[pixel(1, 1, "#000000")], Duration::from_millis(10), generation)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_full().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refill_from_older_generation_is_refused() {
        let cache = MemoryCanvasCache::new();
        let before = cache.generation().await.unwrap();
        cache.invalidate().await.unwrap();
        assert_eq!(cache.generation().await.unwrap(), before + 1);

        let stored = cache
            .put_full(&[], Duration::from_secs(60), before)
            .await
            .unwrap();
        assert!(!stored);
        assert!(cache.get_full().await.unwrap().is_none());
    }
}
