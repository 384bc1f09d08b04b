use super::{EventStore, EventTransition, PERSISTENCE_ERROR_TARGET};
use crate::pipeline::IngestStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long an append waits for room when the writer is behind.
const FULL_QUEUE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum SinkCommand {
    Append(EventTransition),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub queue: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

/// Append-only handle used by shard workers. Never waits on the database; a full
/// queue holds the caller for at most [`FULL_QUEUE_WAIT`] before the transition is dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SinkCommand>,
    stats: Arc<IngestStats>,
}

impl EventSink {
    pub async fn append(&self, transition: EventTransition) {
        self.stats.sink_queue_depth.fetch_add(1, Ordering::Relaxed);
        let (reason, cmd) = match self.tx.try_send(SinkCommand::Append(transition)) {
            Ok(()) => return,
            Err(TrySendError::Full(cmd)) => {
                tracing::debug!("event sink queue full; waiting for the writer");
                match self.tx.send_timeout(cmd, FULL_QUEUE_WAIT).await {
                    Ok(()) => return,
                    Err(SendTimeoutError::Timeout(cmd)) => ("sink queue full", cmd),
                    Err(SendTimeoutError::Closed(cmd)) => ("sink closed", cmd),
                }
            }
            Err(TrySendError::Closed(cmd)) => ("sink closed", cmd),
        };
        self.stats.sink_queue_depth.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .persistence_failures
            .fetch_add(1, Ordering::Relaxed);
        let SinkCommand::Append(transition) = cmd else {
            return;
        };
        tracing::error!(
            target: PERSISTENCE_ERROR_TARGET,
            device = %transition.device_id,
            rule = %transition.rule_id,
            state = transition.state.as_str(),
            at = %transition.at,
            reason,
            "event transition not persisted"
        );
    }

    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub fn spawn_writer(
    store: EventStore,
    settings: SinkSettings,
    stats: Arc<IngestStats>,
) -> (EventSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SinkCommand>(settings.queue.max(1));
    let sink = EventSink {
        tx,
        stats: stats.clone(),
    };

    let handle = tokio::spawn(async move {
        let batch_size = settings.batch_size.max(1);
        let mut buffer: Vec<EventTransition> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(settings.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(&store, &mut buffer, &stats, &settings).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(SinkCommand::Append(transition)) => {
                            stats.sink_queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(transition);
                            if buffer.len() >= batch_size {
                                flush(&store, &mut buffer, &stats, &settings).await;
                            }
                        }
                        Some(SinkCommand::Flush(done)) => {
                            flush(&store, &mut buffer, &stats, &settings).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush(&store, &mut buffer, &stats, &settings).await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("event sink writer stopped");
    });

    (sink, handle)
}

/// Writes the buffered batch, retrying with exponential backoff. After the last
/// attempt the batch is dropped and each transition is reported on the error target.
async fn flush(
    store: &EventStore,
    buffer: &mut Vec<EventTransition>,
    stats: &Arc<IngestStats>,
    settings: &SinkSettings,
) {
    if buffer.is_empty() {
        return;
    }
    let items = std::mem::take(buffer);
    let len = items.len();
    let max_attempts = settings.max_attempts.max(1);

    let mut attempt = 1u32;
    loop {
        match store.append(&items).await {
            Ok(inserted) => {
                stats
                    .transitions_persisted
                    .fetch_add(inserted, Ordering::Relaxed);
                if (inserted as usize) < len {
                    tracing::debug!(
                        inserted,
                        skipped = len.saturating_sub(inserted as usize),
                        "skipped replayed event transitions"
                    );
                }
                stats.clear_error();
                return;
            }
            Err(err) if attempt < max_attempts => {
                stats.record_error(err.to_string());
                let delay = settings.retry_base.saturating_mul(1 << (attempt - 1).min(16));
                tracing::warn!(error = %err, attempt, ?delay, len, "event log write failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                stats.record_error(err.to_string());
                stats
                    .persistence_failures
                    .fetch_add(len as u64, Ordering::Relaxed);
                for transition in &items {
                    tracing::error!(
                        target: PERSISTENCE_ERROR_TARGET,
                        device = %transition.device_id,
                        rule = %transition.rule_id,
                        state = transition.state.as_str(),
                        at = %transition.at,
                        error = %err,
                        "event transition dropped after {max_attempts} attempts"
                    );
                }
                return;
            }
        }
    }
}
