//! Queue processor (§4.7): a single process-wide polling worker that spawns
//! one task per world with pending work, dequeues in order, and drives that
//! world's runtime until it drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use event_bus::{EventBus, QueueStatus, StatusPayload, WorldEvent, WorldPayload};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use world_core::{MessageRole, Storage, StoredMessage};
use world_runtime::Dispatcher;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_TIMEOUT_SECS: i64 = 15;
pub const DEFAULT_WORLD_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Looks up (or lazily builds) the [`Dispatcher`] for a world. Implementors
/// typically cache one `WorldRuntime` per world keyed by world id.
pub trait RuntimeRegistry: Send + Sync {
    fn dispatcher_for(&self, world_id: &str) -> Option<Arc<dyn Dispatcher>>;
}

/// `RuntimeRegistry` backed by a fixed, pre-populated map — the common case
/// when every world shares one provider/tool-executor configuration.
pub struct StaticRegistry {
    runtimes: HashMap<String, Arc<dyn Dispatcher>>,
}

impl StaticRegistry {
    pub fn new(runtimes: HashMap<String, Arc<dyn Dispatcher>>) -> Self {
        Self { runtimes }
    }
}

impl RuntimeRegistry for StaticRegistry {
    fn dispatcher_for(&self, world_id: &str) -> Option<Arc<dyn Dispatcher>> {
        self.runtimes.get(world_id).cloned()
    }
}

pub struct QueueProcessor {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    registry: Arc<dyn RuntimeRegistry>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    lease_timeout_secs: i64,
    world_idle_timeout: Duration,
    max_concurrent: usize,
    active_worlds: Arc<DashMap<String, ()>>,
}

impl QueueProcessor {
    pub fn new(storage: Arc<dyn Storage>, bus: EventBus, registry: Arc<dyn RuntimeRegistry>) -> Self {
        Self {
            storage,
            bus,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
            world_idle_timeout: DEFAULT_WORLD_IDLE_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            active_worlds: Arc::new(DashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_world_idle_timeout(mut self, timeout: Duration) -> Self {
        self.world_idle_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Starts the poll loop as a background task. Call `reclaim_stale` once
    /// before spawning so orphaned leases from a prior process are requeued.
    pub async fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        match self.storage.reclaim_stale(self.lease_timeout_secs).await {
            Ok(n) if n > 0 => warn!(reclaimed = n, "requeued stale leased entries on startup"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "reclaim_stale failed on startup"),
        }

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                self.poll_once().await;
            }
        })
    }

    async fn poll_once(self: &Arc<Self>) {
        let stats = match self.storage.get_queue_stats().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "get_queue_stats failed");
                return;
            }
        };
        for world_id in stats.worlds_with_pending {
            if self.active_worlds.len() >= self.max_concurrent {
                break;
            }
            if self.active_worlds.contains_key(&world_id) {
                continue;
            }
            let Some(dispatcher) = self.registry.dispatcher_for(&world_id) else {
                warn!(%world_id, "no runtime registered for world with pending work");
                continue;
            };
            self.active_worlds.insert(world_id.clone(), ());
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process_world(world_id.clone(), dispatcher).await;
                this.active_worlds.remove(&world_id);
            });
        }
    }

    /// Drains one world's queue: dequeue, process, report status, repeat
    /// until the queue is empty. No two calls for the same world overlap
    /// because `active_worlds` gates spawning in `poll_once`.
    async fn process_world(&self, world_id: String, dispatcher: Arc<dyn Dispatcher>) {
        loop {
            let entry = match self.storage.dequeue(&world_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(%world_id, error = %e, "dequeue failed");
                    break;
                }
            };

            let heartbeat_storage = self.storage.clone();
            let queue_id = entry.queue_id.clone();
            let heartbeat_interval = self.heartbeat_interval;
            let heartbeat: JoinHandle<()> = tokio::spawn(async move {
                let mut tick = tokio::time::interval(heartbeat_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    if let Err(e) = heartbeat_storage.update_heartbeat(&queue_id).await {
                        warn!(%queue_id, error = %e, "heartbeat update failed");
                    }
                }
            });

            let chat_id = entry.chat_id.clone().unwrap_or_else(|| "default".to_string());
            let message = StoredMessage {
                message_id: entry.message_id.clone(),
                world_id: world_id.clone(),
                chat_id,
                role: MessageRole::User,
                sender: entry.sender.clone(),
                content: entry.content.clone(),
                tool_calls: None,
                tool_call_id: None,
                reply_to_message_id: None,
                timestamp: entry.enqueued_at,
            };

            let mut idle_rx = self.bus.subscribe(&world_id);
            let result = dispatcher.dispatch(&message).await;
            heartbeat.abort();

            match &result {
                Ok(_) => {
                    if let Err(e) = self.storage.mark_completed(&entry.queue_id).await {
                        error!(%world_id, error = %e, "mark_completed failed");
                    }
                    self.bus.publish(
                        &world_id,
                        WorldEvent::Status {
                            payload: StatusPayload {
                                world_id: world_id.clone(),
                                message_id: entry.message_id.clone(),
                                status: QueueStatus::Completed,
                                error: None,
                            },
                        },
                    );
                }
                Err(e) => {
                    let err_text = e.to_string();
                    if let Err(storage_err) = self.storage.mark_failed(&entry.queue_id, &err_text).await {
                        error!(%world_id, error = %storage_err, "mark_failed failed");
                    }
                    self.bus.publish(
                        &world_id,
                        WorldEvent::Status {
                            payload: StatusPayload {
                                world_id: world_id.clone(),
                                message_id: entry.message_id.clone(),
                                status: QueueStatus::Failed,
                                error: Some(err_text),
                            },
                        },
                    );
                }
            }

            let _ = tokio::time::timeout(self.world_idle_timeout, async {
                loop {
                    match idle_rx.recv().await {
                        Ok(published) => {
                            if matches!(
                                published.event,
                                WorldEvent::World {
                                    payload: WorldPayload::Idle
                                }
                            ) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .await;
            debug!(%world_id, queue_id = %entry.queue_id, "queue entry processed");
        }
    }
}
