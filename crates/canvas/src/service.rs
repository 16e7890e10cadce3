//! CanvasMutationPipeline: validate → commit → invalidate → publish.

use crate::error::{CanvasError, Result};
use crate::model::{is_valid_color, CanvasSize, Pixel, Region};
use crate::store::{CanvasCache, PixelStore};
use chrono::Utc;
use metrics::counter;
use realtime::{BroadcastBus, BroadcastEvent, Scope, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Full-canvas cache expiry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct CanvasService {
    store: Arc<dyn PixelStore>,
    cache: Arc<dyn CanvasCache>,
    bus: Arc<BroadcastBus>,
    size: CanvasSize,
    cache_ttl: Duration,
}

impl CanvasService {
    pub fn new(
        store: Arc<dyn PixelStore>,
        cache: Arc<dyn CanvasCache>,
        bus: Arc<BroadcastBus>,
        size: CanvasSize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            size,
            cache_ttl,
        }
    }

    pub fn size(&self) -> CanvasSize {
        self.size
    }

    /// Validate and commit one pixel, then fan it out to every canvas viewer.
    ///
    /// The cache is invalidated before the event is published, so a viewer
    /// reacting to the event never re-reads a stale full canvas. Publish
    /// failures are logged; the write itself stays committed.
    pub async fn place_pixel(&self, user_id: UserId, x: u32, y: u32, color: &str) -> Result<Pixel> {
        if !self.size.contains(x, y) {
            counter!("canvas_rejected_total", "reason" => "bounds").increment(1);
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.size.width,
                height: self.size.height,
            });
        }
        if !is_valid_color(color) {
            counter!("canvas_rejected_total", "reason" => "color").increment(1);
            return Err(CanvasError::InvalidColor(color.to_string()));
        }

        let pixel = Pixel {
            x,
            y,
            color: color.to_string(),
            user_id,
            created_at: Utc::now(),
        };
        self.store.upsert(&pixel).await?;
        counter!("canvas_pixels_placed_total").increment(1);

        if let Err(e) = self.cache.invalidate().await {
            warn!("Failed to invalidate canvas cache: {}", e);
        }

        let event = BroadcastEvent::PixelUpdated {
            x,
            y,
            color: pixel.color.clone(),
            user_id,
            timestamp: pixel.created_at,
        };
        if let Err(e) = self.bus.publish(Scope::Canvas, event, None).await {
            warn!("Pixel ({}, {}) committed but not broadcast: {}", x, y, e);
        }

        info!("User {} placed {} at ({}, {})", user_id, pixel.color, x, y);
        Ok(pixel)
    }

    pub async fn pixel(&self, x: u32, y: u32) -> Result<Option<Pixel>> {
        if !self.size.contains(x, y) {
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.size.width,
                height: self.size.height,
            });
        }
        self.store.get(x, y).await
    }

    /// Uncached read of a half-open rectangle, clamped to the canvas.
    pub async fn region(&self, region: Region) -> Result<Vec<Pixel>> {
        if region.x_min > region.x_max || region.y_min > region.y_max {
            return Err(CanvasError::InvalidRegion(format!(
                "min ({}, {}) exceeds max ({}, {})",
                region.x_min, region.y_min, region.x_max, region.y_max
            )));
        }
        let clamped = Region {
            x_max: region.x_max.min(self.size.width),
            y_max: region.y_max.min(self.size.height),
            ..region
        };
        self.store.region(clamped).await
    }

    /// Read-through cached view of every pixel.
    ///
    /// The refill is tagged with the cache generation seen before the store
    /// read, so a snapshot that raced a write is served once but never cached.
    pub async fn full_canvas(&self) -> Result<Vec<Pixel>> {
        match self.cache.get_full().await {
            Ok(Some(pixels)) => {
                counter!("canvas_cache_hits_total").increment(1);
                return Ok(pixels);
            }
            Ok(None) => {}
            Err(e) => warn!("Canvas cache read failed, falling back to store: {}", e),
        }

        counter!("canvas_cache_misses_total").increment(1);
        let generation = match self.cache.generation().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("Canvas cache generation unavailable, not refilling: {}", e);
                None
            }
        };
        let pixels = self.store.region(self.size.full()).await?;
        if let Some(generation) = generation {
            match self.cache.put_full(&pixels, self.cache_ttl, generation).await {
                Ok(true) => {}
                Ok(false) => {
                    counter!("canvas_cache_stale_refills_total").increment(1);
                    debug!("Canvas changed during load, snapshot not cached");
                }
                Err(e) => warn!("Failed to populate canvas cache: {}", e),
            }
        }
        debug!("Loaded full canvas from store ({} pixels)", pixels.len());
        Ok(pixels)
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }
}
