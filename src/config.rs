use crate::error::ConfigError;
use crate::policy::DiagnosticPolicy;
use crate::sink::SinkSettings;
use dotenvy::dotenv;
use rumqttc::QoS;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub mqtt_qos: QoS,
    pub topic_root: String,
    pub policy_path: PathBuf,
    pub workers: usize,
    pub shard_queue: usize,
    pub sink_queue: usize,
    pub sink_batch_size: usize,
    pub sink_flush_ms: u64,
    pub sink_max_attempts: u32,
    pub sink_retry_base_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub drain_timeout_ms: u64,
    pub device_cache_ttl_seconds: u64,
    pub grpc_socket_path: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = get("DATABASE_URL")
            .or_else(|| get("DB_URL"))
            .ok_or_else(|| ConfigError::Missing("DATABASE_URL or DB_URL".to_string()))?;
        let database_url = normalize_database_url(database_url);

        let mqtt_qos = match parsed::<u8>(&get, "MQTT_QOS")?.unwrap_or(1) {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            other => {
                return Err(ConfigError::invalid(
                    "MQTT_QOS",
                    format!("{other} is not supported (use 0 or 1)"),
                ))
            }
        };

        let policy_path = get("DIAG_POLICY_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::Missing("DIAG_POLICY_PATH".to_string()))?;

        let config = Self {
            database_url,
            db_pool_size: parsed(&get, "DB_POOL_SIZE")?.unwrap_or(10),
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "localhost".to_string()),
            mqtt_port: parsed(&get, "MQTT_PORT")?.unwrap_or(1883),
            mqtt_username: get("MQTT_USER"),
            mqtt_password: lookup("MQTT_PASS").filter(|value| !value.is_empty()),
            mqtt_tls: get("MQTT_TLS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            mqtt_keepalive_secs: parsed(&get, "MQTT_KEEPALIVE_SECS")?.unwrap_or(30),
            mqtt_client_id: lookup("MQTT_CLIENT_ID")
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| format!("ro-diagnostics-{}", std::process::id())),
            mqtt_qos,
            topic_root: get("TOPIC_ROOT").unwrap_or_else(|| "plant".to_string()),
            policy_path,
            workers: parsed(&get, "DIAG_WORKERS")?.unwrap_or(4),
            shard_queue: parsed(&get, "DIAG_SHARD_QUEUE")?.unwrap_or(1024),
            sink_queue: parsed(&get, "DIAG_SINK_QUEUE")?.unwrap_or(4096),
            sink_batch_size: parsed(&get, "DIAG_SINK_BATCH_SIZE")?.unwrap_or(100),
            sink_flush_ms: parsed(&get, "DIAG_SINK_FLUSH_MS")?.unwrap_or(500),
            sink_max_attempts: parsed(&get, "DIAG_SINK_MAX_ATTEMPTS")?.unwrap_or(5),
            sink_retry_base_ms: parsed(&get, "DIAG_SINK_RETRY_BASE_MS")?.unwrap_or(200),
            backoff_initial_ms: parsed(&get, "DIAG_BACKOFF_INITIAL_MS")?.unwrap_or(500),
            backoff_max_ms: parsed(&get, "DIAG_BACKOFF_MAX_MS")?.unwrap_or(30_000),
            drain_timeout_ms: parsed(&get, "DIAG_DRAIN_TIMEOUT_MS")?.unwrap_or(5_000),
            device_cache_ttl_seconds: parsed(&get, "DIAG_DEVICE_CACHE_TTL_SECONDS")?
                .unwrap_or(10),
            grpc_socket_path: get("DIAG_GRPC_SOCKET")
                .unwrap_or_else(|| "/tmp/ro_diagnostics.sock".to_string()),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt_port == 0 {
            return Err(ConfigError::invalid("MQTT_PORT", "port must be non-zero"));
        }
        if self.mqtt_host.chars().any(char::is_whitespace) || self.mqtt_host.contains('/') {
            return Err(ConfigError::invalid(
                "MQTT_HOST",
                format!("`{}` is not a host name", self.mqtt_host),
            ));
        }
        if self.mqtt_client_id.is_empty() || self.mqtt_client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "MQTT_CLIENT_ID",
                "client id must be non-empty and not start with whitespace",
            ));
        }
        if self.topic_root.contains(['/', '+', '#']) {
            return Err(ConfigError::invalid(
                "TOPIC_ROOT",
                "must be a single topic level without wildcards",
            ));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::invalid(
                "DIAG_BACKOFF_INITIAL_MS",
                "expected 0 < initial <= DIAG_BACKOFF_MAX_MS",
            ));
        }
        for (key, value) in [
            ("DIAG_WORKERS", self.workers),
            ("DIAG_SHARD_QUEUE", self.shard_queue),
            ("DIAG_SINK_QUEUE", self.sink_queue),
            ("DIAG_SINK_BATCH_SIZE", self.sink_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be > 0"));
            }
        }
        if self.sink_max_attempts == 0 {
            return Err(ConfigError::invalid("DIAG_SINK_MAX_ATTEMPTS", "must be > 0"));
        }
        Ok(())
    }

    /// Loads the policy and checks it against settings that depend on it.
    pub fn load_policy(&self) -> Result<DiagnosticPolicy, ConfigError> {
        let policy = DiagnosticPolicy::load(&self.policy_path)?;
        self.check_policy(&policy)?;
        Ok(policy)
    }

    fn check_policy(&self, policy: &DiagnosticPolicy) -> Result<(), ConfigError> {
        let ttl = self.device_cache_ttl();
        if let Some(shortest) = policy.shortest_hysteresis() {
            // shortest is positive, so it always converts
            if shortest.to_std().is_ok_and(|shortest| ttl > shortest) {
                return Err(ConfigError::invalid(
                    "DIAG_DEVICE_CACHE_TTL_SECONDS",
                    format!(
                        "{}s exceeds the shortest hysteresis window ({}s)",
                        self.device_cache_ttl_seconds,
                        shortest.num_seconds()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn device_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.device_cache_ttl_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            queue: self.sink_queue,
            batch_size: self.sink_batch_size,
            flush_interval: Duration::from_millis(self.sink_flush_ms),
            max_attempts: self.sink_max_attempts,
            retry_base: Duration::from_millis(self.sink_retry_base_ms),
        }
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse `{raw}`"))),
        None => Ok(None),
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
