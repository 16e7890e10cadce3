//! Shared application state and backend wiring.

use crate::config::{BrokerBackend, GatewayConfig, StorageBackend};
use crate::error::Result;
use canvas::{
    CanvasCache, CanvasService, CanvasSize, MemoryCanvasCache, MemoryPixelStore, PixelStore,
    RedisCanvasCache, RedisPixelStore,
};
use game::{
    DuelEngine, MatchmakingQueue, MemoryQueueStore, MemorySessionStore, QueueStore,
    RedisQueueStore, RedisSessionStore, SessionStore,
};
use realtime::{Broker, BroadcastBus, ConnectionRegistry, MemoryBroker, NatsBroker, TopicConfig};
use std::sync::Arc;
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<BroadcastBus>,
    pub canvas: CanvasService,
    pub engine: Arc<DuelEngine>,
    pub matchmaking: MatchmakingQueue,
}

/// Storage collaborators behind the core services.
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub sessions: Arc<dyn SessionStore>,
    pub queue: Arc<dyn QueueStore>,
    pub pixels: Arc<dyn PixelStore>,
    pub cache: Arc<dyn CanvasCache>,
}

impl Backends {
    /// Everything in process; suitable for a single instance and tests.
    pub fn in_memory() -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            queue: Arc::new(MemoryQueueStore::new()),
            pixels: Arc::new(MemoryPixelStore::new()),
            cache: Arc::new(MemoryCanvasCache::new()),
        }
    }

    /// Backends selected by `STORAGE_BACKEND` / `BROKER_BACKEND`.
    pub async fn connect(config: &GatewayConfig) -> Result<Self> {
        let mut backends = Self::in_memory();

        if config.broker == BrokerBackend::Nats {
            backends.broker = Arc::new(NatsBroker::connect(&config.nats_url).await?);
            info!("Connected to NATS");
        }

        if config.storage == StorageBackend::Redis {
            info!("Using Redis at {}", config.redis_url);
            backends.sessions = Arc::new(RedisSessionStore::new(&config.redis_url)?);
            backends.queue = Arc::new(RedisQueueStore::new(&config.redis_url)?);
            backends.pixels = Arc::new(RedisPixelStore::new(&config.redis_url)?);
            backends.cache = Arc::new(RedisCanvasCache::new(&config.redis_url)?);
        }

        Ok(backends)
    }
}

impl AppState {
    pub fn new(config: &GatewayConfig, backends: Backends) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::with_send_timeout(config.send_timeout));
        let topics = TopicConfig {
            canvas: config.canvas_topic.clone(),
            duel_prefix: config.duel_topic_prefix.clone(),
        };
        let bus = Arc::new(BroadcastBus::new(backends.broker, registry.clone(), topics));

        let canvas = CanvasService::new(
            backends.pixels,
            backends.cache,
            bus.clone(),
            CanvasSize {
                width: config.canvas_width,
                height: config.canvas_height,
            },
            config.canvas_cache_ttl,
        );
        let engine = Arc::new(DuelEngine::new(backends.sessions, bus.clone()));
        let matchmaking =
            MatchmakingQueue::with_ttl(backends.queue, engine.clone(), config.matchmaking_ttl);

        Arc::new(Self {
            registry,
            bus,
            canvas,
            engine,
            matchmaking,
        })
    }
}
