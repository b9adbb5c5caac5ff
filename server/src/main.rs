//! Process entry point. No argument parser (out of scope): every setting
//! comes from the environment via the `config` crate. Wires together storage,
//! the event bus, the queue processor, and the subscription hub, then serves
//! the WebSocket endpoint until the process receives a shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use event_bus::EventBus;
use gateway::SubscriptionHub;
use queue::{Queue, QueueProcessor, RuntimeRegistry};
use world_core::{ApprovalCache, InMemoryStorage, SqliteStorage, Storage};
use world_runtime::{AgentResponder, Dispatcher, MockProvider, NoopToolExecutor, WorldRuntime};

const LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Lazily builds and caches one [`WorldRuntime`] per world id. The provider
/// and tool executor here are the boundary stubs named in §4.5.6 — swapping
/// in a real `ModelProvider` is the only change needed to point this at an
/// actual LLM backend.
struct RuntimeCache {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    /// Process-wide singleton (§4.6/§9): one cache, built once at boot and
    /// shared by every world's responder, not one per world.
    approvals: ApprovalCache,
    cache: DashMap<String, Arc<dyn Dispatcher>>,
}

impl RuntimeRegistry for RuntimeCache {
    fn dispatcher_for(&self, world_id: &str) -> Option<Arc<dyn Dispatcher>> {
        if let Some(existing) = self.cache.get(world_id) {
            return Some(existing.clone());
        }
        let responder = AgentResponder::new(
            MockProvider::text(""),
            NoopToolExecutor,
            self.approvals.clone(),
            self.bus.clone(),
        );
        let runtime: Arc<dyn Dispatcher> = Arc::new(WorldRuntime::new(
            world_id.to_string(),
            self.storage.clone(),
            self.bus.clone(),
            responder,
        ));
        self.cache.insert(world_id.to_string(), runtime.clone());
        Some(runtime)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::ServerConfig::from_env().context("loading configuration from environment")?;
    config::init_tracing(&cfg.logger_levels);

    let storage: Arc<dyn Storage> = match cfg.storage_backend {
        config::StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
        config::StorageBackend::Sqlite => {
            Arc::new(SqliteStorage::new(&cfg.data_path).context("opening sqlite storage")?)
        }
    };

    let bus = EventBus::new();
    let approvals = ApprovalCache::new();
    let registry: Arc<dyn RuntimeRegistry> = Arc::new(RuntimeCache {
        storage: storage.clone(),
        bus: bus.clone(),
        approvals: approvals.clone(),
        cache: DashMap::new(),
    });

    let processor = Arc::new(QueueProcessor::new(storage.clone(), bus.clone(), registry));
    let processor_handle = processor.spawn().await;

    let queue = Queue::new(storage.clone());
    let hub = Arc::new(SubscriptionHub::new(storage.clone(), bus.clone(), queue));
    let app = gateway::router(hub);

    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR)
        .await
        .with_context(|| format!("binding {LISTEN_ADDR}"))?;
    tracing::info!(addr = LISTEN_ADDR, "agent-world-server listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server loop exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    processor_handle.abort();
    approvals.clear_all();
    Ok(())
}
