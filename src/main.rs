mod config;
mod error;
mod grpc;
mod mqtt;
mod pipeline;
mod policy;
mod router;
mod rules;
mod session;
mod sink;
mod sweep;
mod telemetry;

use crate::config::Config;
use crate::grpc::{serve_uds, QueryService};
use crate::pipeline::{build_pool, spawn_shards, IngestStats, ShardSettings};
use crate::router::{DeviceDirectory, TopicRouter};
use crate::rules::RuleEngine;
use crate::sink::{spawn_writer, EventStore, PgEventLog};
use crate::telemetry::MessageDecoder;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ro_diagnostics_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "ro-diagnostics-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let policy = config
        .load_policy()
        .with_context(|| format!("loading diagnostic policy {}", config.policy_path.display()))?;
    tracing::info!(
        digest = %policy.digest,
        rules = policy.rules.len(),
        channels = policy.channels.len(),
        "diagnostic policy loaded"
    );

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("connecting to Postgres")?;
    let store = EventStore::Postgres(PgEventLog::new(pool.clone()));
    store
        .ensure_schema()
        .await
        .context("creating diagnostic_event_log")?;

    let stats = Arc::new(IngestStats::new());
    let cancel = CancellationToken::new();

    let (sink, writer_handle) = spawn_writer(store.clone(), config.sink_settings(), stats.clone());
    let directory = DeviceDirectory::postgres(pool, config.device_cache_ttl());
    let router = TopicRouter::new(config.topic_root.clone(), directory.clone());
    let (shards, dispatcher, workers) = spawn_shards(
        &ShardSettings {
            workers: config.workers,
            queue: config.shard_queue,
            window_capacity: policy.window_capacity,
            stale_after: policy.stale_after,
            offline_after: policy.offline_after,
        },
        router,
        MessageDecoder::new(policy.channels.clone()),
        Arc::new(RuleEngine::new(policy.rules.clone())),
        sink.clone(),
        store.clone(),
        stats.clone(),
    );

    let supervisor_handle = tokio::spawn(mqtt::run_supervisor(
        config.clone(),
        dispatcher,
        stats.clone(),
        cancel.clone(),
    ));
    let sweeper_handle = tokio::spawn(sweep::run_sweeper(
        shards.clone(),
        directory,
        policy.sweep_interval,
        cancel.clone(),
    ));

    let grpc_service = QueryService::new(shards, store, stats.clone(), policy.digest.clone());
    let grpc_path = config.grpc_socket_path.clone();
    let grpc_cancel = cancel.clone();
    let mut grpc_handle =
        tokio::spawn(async move { serve_uds(&grpc_path, grpc_service, grpc_cancel).await });

    tokio::select! {
        res = &mut grpc_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error = %err, "gRPC server exited"),
                Err(err) => tracing::error!(error = %err, "gRPC task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Stop intake first; the supervisor owns the last dispatcher handle.
    cancel.cancel();
    if let Err(err) = supervisor_handle.await {
        tracing::warn!(error = %err, "supervisor task failed");
    }
    let _ = sweeper_handle.await;
    workers.drain(config.drain_timeout()).await;

    drop(sink);
    if tokio::time::timeout(config.drain_timeout(), writer_handle)
        .await
        .is_err()
    {
        tracing::warn!("event sink did not flush before the drain timeout");
    }
    if !grpc_handle.is_finished() {
        grpc_handle.abort();
    }

    tracing::info!("ro-diagnostics-sidecar stopped");
    Ok(())
}
