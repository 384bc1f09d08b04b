use crate::mqtt::ConnectionState;
use crate::router::{TopicParts, TopicRouter};
use crate::rules::{DeviceRuleState, RestoredRules, RuleEngine, RuleOutcome};
use crate::session::{ConnectivityTransition, DeviceSessionState, SessionRegistry};
use crate::sink::{EventSink, EventStore, EventTransition};
use crate::telemetry::MessageDecoder;
use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub samples_accepted: AtomicU64,
    pub routing_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub dropped_backpressure: AtomicU64,
    pub transitions_persisted: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub sink_queue_depth: AtomicU64,
    pub mqtt_connected: AtomicBool,
    connection_state: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            samples_accepted: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dropped_backpressure: AtomicU64::new(0),
            transitions_persisted: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            sink_queue_depth: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_state: AtomicU8::new(ConnectionState::Disconnected as u8),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state as u8, Ordering::Relaxed);
        self.mqtt_connected
            .store(state == ConnectionState::Connected, Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection_state.load(Ordering::Relaxed))
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RoutedMessage {
    parts: TopicParts,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

#[derive(Debug)]
enum ControlCommand {
    Sweep {
        now: DateTime<Utc>,
        done: oneshot::Sender<()>,
    },
    Deregister {
        device_id: String,
        done: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Queued,
    Rejected,
    Unroutable,
}

#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub workers: usize,
    pub queue: usize,
    pub window_capacity: usize,
    pub stale_after: ChronoDuration,
    pub offline_after: ChronoDuration,
}

/// Everything a shard owns: the sessions of its devices and their rule state.
#[derive(Debug)]
struct ShardState {
    registry: SessionRegistry,
    rules: HashMap<String, DeviceRuleState>,
}

/// Read side plus control channel of one shard.
#[derive(Clone)]
struct ShardHandle {
    state: Arc<RwLock<ShardState>>,
    control: mpsc::Sender<ControlCommand>,
}

/// Query and control access to all shards. Cheap to clone.
#[derive(Clone)]
pub struct Shards {
    handles: Arc<Vec<ShardHandle>>,
}

/// Routes inbound messages onto the owning shard's bounded queue.
#[derive(Clone)]
pub struct Dispatcher {
    router: TopicRouter,
    queues: Arc<Vec<mpsc::Sender<RoutedMessage>>>,
    stats: Arc<IngestStats>,
}

/// Join handles of the shard workers, consumed on shutdown.
pub struct ShardWorkers {
    handles: Vec<JoinHandle<()>>,
}

struct ShardWorker {
    index: usize,
    state: Arc<RwLock<ShardState>>,
    router: TopicRouter,
    decoder: MessageDecoder,
    engine: Arc<RuleEngine>,
    sink: EventSink,
    store: EventStore,
    stats: Arc<IngestStats>,
}

fn shard_for(device_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

pub fn spawn_shards(
    settings: &ShardSettings,
    router: TopicRouter,
    decoder: MessageDecoder,
    engine: Arc<RuleEngine>,
    sink: EventSink,
    store: EventStore,
    stats: Arc<IngestStats>,
) -> (Shards, Dispatcher, ShardWorkers) {
    let workers = settings.workers.max(1);
    let mut handles = Vec::with_capacity(workers);
    let mut queues = Vec::with_capacity(workers);
    let mut joins = Vec::with_capacity(workers);

    for index in 0..workers {
        let (tx, rx) = mpsc::channel::<RoutedMessage>(settings.queue.max(1));
        let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(64);
        let state = Arc::new(RwLock::new(ShardState {
            registry: SessionRegistry::new(
                settings.window_capacity,
                settings.stale_after,
                settings.offline_after,
            ),
            rules: HashMap::new(),
        }));

        let worker = ShardWorker {
            index,
            state: state.clone(),
            router: router.clone(),
            decoder: decoder.clone(),
            engine: engine.clone(),
            sink: sink.clone(),
            store: store.clone(),
            stats: stats.clone(),
        };
        joins.push(tokio::spawn(worker.run(rx, control_rx)));
        handles.push(ShardHandle {
            state,
            control: control_tx,
        });
        queues.push(tx);
    }

    (
        Shards {
            handles: Arc::new(handles),
        },
        Dispatcher {
            router,
            queues: Arc::new(queues),
            stats,
        },
        ShardWorkers { handles: joins },
    )
}

impl Dispatcher {
    /// Never blocks: a full shard queue rejects the message.
    pub fn dispatch(&self, message: InboundMessage) -> DispatchResult {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let parts = match self.router.parse(&message.topic) {
            Ok(parts) => parts,
            Err(err) => {
                self.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %message.topic, error = %err, "dropping unroutable message");
                return DispatchResult::Unroutable;
            }
        };

        let shard = shard_for(&parts.device_id, self.queues.len());
        let routed = RoutedMessage {
            parts,
            payload: message.payload,
            received_at: message.received_at,
        };
        match self.queues[shard].try_send(routed) {
            Ok(()) => DispatchResult::Queued,
            Err(TrySendError::Full(rejected)) => {
                self.stats
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    shard,
                    device = %rejected.parts.device_id,
                    "shard queue full; rejecting message"
                );
                DispatchResult::Rejected
            }
            Err(TrySendError::Closed(_)) => DispatchResult::Rejected,
        }
    }
}

impl Shards {
    fn handle_for(&self, device_id: &str) -> &ShardHandle {
        &self.handles[shard_for(device_id, self.handles.len())]
    }

    pub fn session_state(&self, device_id: &str) -> Option<DeviceSessionState> {
        let handle = self.handle_for(device_id);
        let state = handle.state.read().unwrap_or_else(PoisonError::into_inner);
        state.registry.get(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for handle in self.handles.iter() {
            let state = handle.state.read().unwrap_or_else(PoisonError::into_inner);
            ids.extend(state.registry.device_ids());
        }
        ids
    }

    /// Each shard computes its own sweep; this only delivers the tick and
    /// waits until every live shard has applied it.
    pub async fn broadcast_sweep(&self, now: DateTime<Utc>) {
        let mut pending = Vec::with_capacity(self.handles.len());
        for handle in self.handles.iter() {
            let (done, rx) = oneshot::channel();
            if handle
                .control
                .send(ControlCommand::Sweep { now, done })
                .await
                .is_ok()
            {
                pending.push(rx);
            }
        }
        join_all(pending).await;
    }

    /// Drops the session and rule state of a device, closing its open events.
    /// Returns whether a session existed.
    pub async fn deregister(&self, device_id: &str) -> bool {
        let handle = self.handle_for(device_id);
        let (done, rx) = oneshot::channel();
        let command = ControlCommand::Deregister {
            device_id: device_id.to_string(),
            done,
        };
        if handle.control.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl ShardWorkers {
    /// Waits for workers to drain their queues, aborting whatever is left after `timeout`.
    pub async fn drain(self, timeout: Duration) {
        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::warn!(?timeout, "shard drain timed out; aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl ShardWorker {
    async fn run(
        self,
        mut rx: mpsc::Receiver<RoutedMessage>,
        mut control_rx: mpsc::Receiver<ControlCommand>,
    ) {
        let mut control_open = true;
        loop {
            tokio::select! {
                cmd = control_rx.recv(), if control_open => match cmd {
                    Some(ControlCommand::Sweep { now, done }) => {
                        self.sweep(now).await;
                        let _ = done.send(());
                    }
                    Some(ControlCommand::Deregister { device_id, done }) => {
                        let removed = self.deregister(&device_id, Utc::now()).await;
                        let _ = done.send(removed);
                    }
                    None => control_open = false,
                },
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }
        tracing::debug!(shard = self.index, "shard worker drained");
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ShardState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ShardState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// First sample of a device on this shard: adopt the events it still has
    /// open in the log, so a restart continues them instead of opening new ones.
    async fn ensure_rule_state(&self, device_id: &str, now: DateTime<Utc>) {
        let known = self.read_state().rules.contains_key(device_id);
        if known {
            return;
        }
        // closes still buffered from an earlier deregistration must land first
        self.sink.flush().await;
        let restored = match self.store.active_events(device_id).await {
            Ok(events) => self.engine.restore(events),
            Err(err) => {
                tracing::warn!(
                    device = %device_id,
                    error = %err,
                    "could not load open events; starting from clear rule state"
                );
                RestoredRules::default()
            }
        };

        let adopted = restored.state.active_count();
        if adopted > 0 {
            tracing::info!(shard = self.index, device = %device_id, adopted, "resumed open diagnostic events");
        }
        for event in &restored.orphaned {
            tracing::info!(
                device = %device_id,
                rule = %event.rule_id,
                event_id = %event.event_id,
                "closing open event with no matching rule slot"
            );
            self.sink.append(EventTransition::closing(event, now)).await;
        }
        self.write_state()
            .rules
            .entry(device_id.to_string())
            .or_insert(restored.state);
    }

    async fn handle_message(&self, msg: RoutedMessage) {
        let route = match self.router.resolve_parts(msg.parts).await {
            Ok(route) => route,
            Err(err) => {
                self.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "dropping message for unresolved device");
                return;
            }
        };

        let mut payload = msg.payload.to_vec();
        let sample = match self.decoder.decode(&route, &mut payload, msg.received_at) {
            Ok(sample) => sample,
            Err(err) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device = %route.device_id, channel = %route.channel, error = %err, "dropping undecodable payload");
                return;
            }
        };
        self.stats.samples_accepted.fetch_add(1, Ordering::Relaxed);

        let device_id = sample.device_id.clone();
        self.ensure_rule_state(&device_id, msg.received_at).await;
        let channel = sample.channel;
        let (transition, outcomes) = {
            let mut guard = self.write_state();
            let state = &mut *guard;
            let transition = state.registry.update(sample);
            let outcomes = match state.registry.session(&device_id) {
                Some(session) => {
                    let rule_state = state.rules.entry(device_id.clone()).or_default();
                    self.engine
                        .evaluate(session, channel, rule_state, msg.received_at)
                }
                None => Vec::new(),
            };
            (transition, outcomes)
        };

        if let Some(transition) = transition {
            self.emit_connectivity(&transition).await;
        }
        self.emit_outcomes(&outcomes).await;
    }

    async fn sweep(&self, now: DateTime<Utc>) {
        let (transitions, outcomes) = {
            let mut guard = self.write_state();
            let state = &mut *guard;
            let transitions = state.registry.sweep(now);
            let mut outcomes = Vec::new();
            for session in state.registry.sessions() {
                let rule_state = state
                    .rules
                    .entry(session.device_id().to_string())
                    .or_default();
                outcomes.extend(self.engine.sweep(session, rule_state, now));
            }
            (transitions, outcomes)
        };

        for transition in &transitions {
            self.emit_connectivity(transition).await;
        }
        self.emit_outcomes(&outcomes).await;
    }

    async fn deregister(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        let (removed, closed) = {
            let mut guard = self.write_state();
            let state = &mut *guard;
            let mut rules = state.rules.remove(device_id);
            let closed = match (state.registry.session(device_id), rules.as_mut()) {
                (Some(session), Some(rules)) => self.engine.close_all(session, rules, now),
                _ => Vec::new(),
            };
            (state.registry.remove(device_id), closed)
        };
        if removed {
            tracing::info!(
                shard = self.index,
                device = %device_id,
                closed_events = closed.len(),
                "removed session for deregistered device"
            );
        }
        self.emit_outcomes(&closed).await;
        removed
    }

    async fn emit_connectivity(&self, transition: &ConnectivityTransition) {
        match transition.from {
            None => tracing::info!(device = %transition.device_id, "device seen for the first time"),
            Some(from) => tracing::info!(
                device = %transition.device_id,
                %from,
                to = %transition.to,
                "connectivity changed"
            ),
        }
        self.sink.append(EventTransition::from_connectivity(transition)).await;
    }

    async fn emit_outcomes(&self, outcomes: &[RuleOutcome]) {
        for outcome in outcomes {
            if let Some(transition) = EventTransition::from_outcome(outcome) {
                tracing::info!(
                    device = %outcome.device_id,
                    rule = %outcome.rule_id,
                    severity = outcome.severity.as_str(),
                    state = transition.state.as_str(),
                    "diagnostic event transition"
                );
                self.sink.append(transition).await;
            }
        }
    }
}
