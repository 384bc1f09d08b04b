use crate::error::PersistenceError;
use crate::pipeline::{IngestStats, Shards};
use crate::rules::types::Recommendation;
use crate::session::DeviceSessionState;
use crate::sink::{DiagnosticEvent as StoredEvent, EventStore};
use crate::telemetry::{SampleValue, TelemetrySample};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("ro.diagnostics");
}

use proto::diagnostics_query_server::{DiagnosticsQuery, DiagnosticsQueryServer};
use proto::{
    ConnectivityResponse, DeviceRequest, DiagnosticEvent as RpcEvent, EventList, HealthRequest,
    HealthResponse, HistoryRequest, Recommendation as RpcRecommendation, Sample as RpcSample,
    SessionStateResponse,
};

#[derive(Clone)]
pub struct QueryService {
    shards: Shards,
    store: EventStore,
    stats: Arc<IngestStats>,
    policy_digest: String,
}

impl QueryService {
    pub fn new(
        shards: Shards,
        store: EventStore,
        stats: Arc<IngestStats>,
        policy_digest: String,
    ) -> Self {
        Self {
            shards,
            store,
            stats,
            policy_digest,
        }
    }

    fn to_health(&self) -> HealthResponse {
        let stats = &self.stats;
        HealthResponse {
            connection_state: stats.connection_state().as_str().to_string(),
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            samples_accepted: stats.samples_accepted.load(Ordering::Relaxed),
            routing_errors: stats.routing_errors.load(Ordering::Relaxed),
            decode_errors: stats.decode_errors.load(Ordering::Relaxed),
            dropped_backpressure: stats.dropped_backpressure.load(Ordering::Relaxed),
            transitions_persisted: stats.transitions_persisted.load(Ordering::Relaxed),
            persistence_failures: stats.persistence_failures.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            sink_queue_depth: stats.sink_queue_depth.load(Ordering::Relaxed),
            last_error: stats.last_error().unwrap_or_default(),
            policy_digest: self.policy_digest.clone(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn device_id_of(raw: &str) -> Result<String, Status> {
    let device_id = raw.trim().to_ascii_uppercase();
    if !crate::router::is_device_id_like(&device_id) {
        return Err(Status::invalid_argument("device_id must look like RO-YYYY-NNNN"));
    }
    Ok(device_id)
}

fn from_millis(ms: i64, field: &str) -> Result<DateTime<Utc>, Status> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Status::invalid_argument(format!("invalid {field}")))
}

fn unavailable(err: PersistenceError) -> Status {
    Status::unavailable(format!("event log query failed: {err}"))
}

fn map_sample(sample: &TelemetrySample) -> RpcSample {
    let (value, is_boolean) = match sample.value {
        SampleValue::Number(value) => (value, false),
        SampleValue::Bool(value) => (if value { 1.0 } else { 0.0 }, true),
    };
    RpcSample {
        channel: sample.channel.as_str().to_string(),
        value,
        is_boolean,
        unit: sample.unit.clone().unwrap_or_default(),
        observed_at_ms: sample.observed_at.timestamp_millis(),
        received_at_ms: sample.received_at.timestamp_millis(),
    }
}

fn map_session(state: &DeviceSessionState) -> SessionStateResponse {
    SessionStateResponse {
        device_id: state.device_id.clone(),
        tenant_id: state.tenant_id.clone(),
        connectivity: state.connectivity.as_str().to_string(),
        last_seen_at_ms: state.last_seen_at.timestamp_millis(),
        first_seen_at_ms: state.first_seen_at.timestamp_millis(),
        last_samples: state.last_sample_per_channel.values().map(map_sample).collect(),
    }
}

fn trigger_text(trigger: Option<&serde_json::Value>, key: &str) -> String {
    trigger
        .and_then(|trigger| trigger.get(key))
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string()
}

fn map_event(event: StoredEvent) -> RpcEvent {
    let trigger = event.trigger.as_ref();
    let title = trigger_text(trigger, "title");
    let detail = trigger_text(trigger, "detail");
    let recommendation = trigger
        .and_then(|trigger| trigger.get("recommendation"))
        .filter(|value| !value.is_null())
        .and_then(|value| serde_json::from_value::<Recommendation>(value.clone()).ok())
        .map(|rec| RpcRecommendation {
            code: rec.code,
            title: rec.title,
            detail: rec.detail.unwrap_or_default(),
        });
    RpcEvent {
        title,
        detail,
        recommendation,
        event_id: event.event_id.to_string(),
        device_id: event.device_id,
        tenant_id: event.tenant_id,
        rule_id: event.rule_id,
        severity: event
            .severity
            .map(|severity| severity.as_str().to_string())
            .unwrap_or_default(),
        opened_at_ms: event.opened_at.timestamp_millis(),
        closed_at_ms: event.closed_at.map(|at| at.timestamp_millis()),
        trigger_json: event
            .trigger
            .map(|trigger| trigger.to_string())
            .unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl DiagnosticsQuery for QueryService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(self.to_health()))
    }

    async fn get_session_state(
        &self,
        request: Request<DeviceRequest>,
    ) -> Result<Response<SessionStateResponse>, Status> {
        let device_id = device_id_of(&request.into_inner().device_id)?;
        let state = self
            .shards
            .session_state(&device_id)
            .ok_or_else(|| Status::not_found(format!("no live session for {device_id}")))?;
        Ok(Response::new(map_session(&state)))
    }

    async fn get_active_events(
        &self,
        request: Request<DeviceRequest>,
    ) -> Result<Response<EventList>, Status> {
        let device_id = device_id_of(&request.into_inner().device_id)?;
        let events = self
            .store
            .active_events(&device_id)
            .await
            .map_err(unavailable)?;
        Ok(Response::new(EventList {
            events: events.into_iter().map(map_event).collect(),
        }))
    }

    async fn get_event_history(
        &self,
        request: Request<HistoryRequest>,
    ) -> Result<Response<EventList>, Status> {
        let payload = request.into_inner();
        let device_id = device_id_of(&payload.device_id)?;
        let from = from_millis(payload.from_ms, "from_ms")?;
        let to = from_millis(payload.to_ms, "to_ms")?;
        if from >= to {
            return Err(Status::invalid_argument("from_ms must be before to_ms"));
        }
        let events = self
            .store
            .history(&device_id, from, to)
            .await
            .map_err(unavailable)?;
        Ok(Response::new(EventList {
            events: events.into_iter().map(map_event).collect(),
        }))
    }

    async fn get_connectivity(
        &self,
        request: Request<DeviceRequest>,
    ) -> Result<Response<ConnectivityResponse>, Status> {
        let device_id = device_id_of(&request.into_inner().device_id)?;
        if let Some(state) = self.shards.session_state(&device_id) {
            return Ok(Response::new(ConnectivityResponse {
                device_id,
                connectivity: state.connectivity.as_str().to_string(),
                changed_at_ms: state.connectivity_since.timestamp_millis(),
                source: "live".to_string(),
            }));
        }
        let record = self
            .store
            .latest_connectivity(&device_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Status::not_found(format!("no connectivity recorded for {device_id}")))?;
        Ok(Response::new(ConnectivityResponse {
            device_id,
            connectivity: record.connectivity.as_str().to_string(),
            changed_at_ms: record.at.timestamp_millis(),
            source: "event_log".to_string(),
        }))
    }
}

pub async fn serve_uds(
    socket_path: &str,
    service: QueryService,
    cancel: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<DiagnosticsQueryServer<QueryService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = %socket_path, "diagnostics query service listening");

    Server::builder()
        .add_service(health_service)
        .add_service(DiagnosticsQueryServer::new(service))
        .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
        .await?;

    Ok(())
}
