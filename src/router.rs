use crate::error::RoutingError;
use crate::telemetry::Channel;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Topic segments after shape validation, before the device lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub tenant: String,
    pub device_id: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tenant_id: String,
    pub device_id: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub tenant_id: String,
    pub tenant_name: Option<String>,
}

impl DeviceRecord {
    /// The tenant segment may carry either the numeric id or the tenant's slug.
    fn owned_by(&self, tenant_segment: &str) -> bool {
        if tenant_segment == self.tenant_id {
            return true;
        }
        self.tenant_name
            .as_deref()
            .is_some_and(|name| slugify(name) == tenant_segment.to_ascii_lowercase())
    }
}

/// Splits `<root>/<tenant>/<device>/<channel>` and validates each segment.
pub fn parse_topic(root: &str, topic: &str) -> Result<TopicParts, RoutingError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 {
        return Err(RoutingError::SegmentCount(parts.len()));
    }
    if parts[0] != root {
        return Err(RoutingError::RootMismatch {
            expected: root.to_string(),
        });
    }
    let tenant = parts[1].trim();
    let device_id = parts[2].trim();
    if tenant.is_empty() || device_id.is_empty() || parts[3].trim().is_empty() {
        return Err(RoutingError::EmptySegment);
    }
    if !is_device_id_like(device_id) {
        return Err(RoutingError::InvalidDeviceId(device_id.to_string()));
    }
    let channel = parts[3]
        .parse::<Channel>()
        .map_err(|_| RoutingError::UnknownChannel(parts[3].to_string()))?;

    Ok(TopicParts {
        tenant: tenant.to_string(),
        device_id: device_id.to_ascii_uppercase(),
        channel,
    })
}

/// `RO-YYYY-NNNN`, case-insensitive on the prefix.
pub fn is_device_id_like(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 12
        && bytes[..3].eq_ignore_ascii_case(b"RO-")
        && bytes[3..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..].iter().all(u8::is_ascii_digit)
}

/// Lower-cases and collapses every run of non-alphanumerics into a single `_`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Upper bound on cached lookups, hits and misses together.
const MAX_CACHED_LOOKUPS: usize = 10_000;

#[derive(Debug, Clone)]
enum DirectorySource {
    Postgres(PgPool),
    #[cfg(test)]
    Static(Arc<HashMap<String, DeviceRecord>>),
}

#[derive(Debug, Clone)]
struct CachedLookup {
    record: Option<DeviceRecord>,
    fetched_at: Instant,
}

/// TTL cache of device lookups. Misses are cached too so bursts from
/// unregistered devices don't hammer the database, which makes the key
/// space publisher-controlled: the map is pruned and capped on insert.
#[derive(Debug)]
struct LookupCache {
    entries: HashMap<String, CachedLookup>,
    ttl: Duration,
    capacity: usize,
}

impl LookupCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn get(&self, device_id: &str, now: Instant) -> Option<Option<DeviceRecord>> {
        self.entries
            .get(device_id)
            .filter(|hit| now.saturating_duration_since(hit.fetched_at) < self.ttl)
            .map(|hit| hit.record.clone())
    }

    fn insert(&mut self, device_id: String, record: Option<DeviceRecord>, now: Instant) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&device_id) {
            let ttl = self.ttl;
            self.entries
                .retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < ttl);
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&device_id) {
            // still full of fresh entries: misses go first, then the oldest hit
            self.entries.retain(|_, entry| entry.record.is_some());
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.fetched_at)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(
            device_id,
            CachedLookup {
                record,
                fetched_at: now,
            },
        );
    }

    fn forget(&mut self, device_id: &str) {
        self.entries.remove(device_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Read-only view of the external device table with a short-lived cache.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    source: DirectorySource,
    cache: Arc<Mutex<LookupCache>>,
}

impl DeviceDirectory {
    pub fn postgres(pool: PgPool, ttl: Duration) -> Self {
        Self {
            source: DirectorySource::Postgres(pool),
            cache: Arc::new(Mutex::new(LookupCache::new(ttl, MAX_CACHED_LOOKUPS))),
        }
    }

    #[cfg(test)]
    pub fn fixed(records: Vec<DeviceRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.device_id.clone(), record))
            .collect();
        Self {
            source: DirectorySource::Static(Arc::new(map)),
            cache: Arc::new(Mutex::new(LookupCache::new(Duration::ZERO, 1))),
        }
    }

    pub async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, sqlx::Error> {
        let pool = match &self.source {
            #[cfg(test)]
            DirectorySource::Static(records) => return Ok(records.get(device_id).cloned()),
            DirectorySource::Postgres(pool) => pool,
        };

        if let Some(cached) = self.cache.lock().await.get(device_id, Instant::now()) {
            return Ok(cached);
        }

        let row = sqlx::query(
            r#"
            SELECT
                d.device_id,
                d.tenant_id::text AS tenant_id,
                t.name AS tenant_name
            FROM devices d
            LEFT JOIN tenants t ON t.id = d.tenant_id
            WHERE d.device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(pool)
        .await?;

        let record = match row {
            Some(row) => Some(DeviceRecord {
                device_id: row.try_get::<String, _>("device_id")?,
                tenant_id: row.try_get::<String, _>("tenant_id")?,
                tenant_name: row.try_get::<Option<String>, _>("tenant_name")?,
            }),
            None => None,
        };

        self.cache
            .lock()
            .await
            .insert(device_id.to_string(), record.clone(), Instant::now());

        Ok(record)
    }

    /// Returns the subset of `device_ids` still present in the device table.
    pub async fn registered_among(
        &self,
        device_ids: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        let present: HashSet<String> = match &self.source {
            #[cfg(test)]
            DirectorySource::Static(records) => device_ids
                .iter()
                .filter(|id| records.contains_key(id.as_str()))
                .cloned()
                .collect(),
            DirectorySource::Postgres(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT device_id FROM devices WHERE device_id = ANY($1)",
                )
                .bind(device_ids)
                .fetch_all(pool)
                .await?
                .into_iter()
                .collect()
            }
        };

        let mut cache = self.cache.lock().await;
        for id in device_ids {
            if !present.contains(id) {
                cache.forget(id);
            }
        }
        Ok(present)
    }
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    root: String,
    directory: DeviceDirectory,
}

impl TopicRouter {
    pub fn new(root: impl Into<String>, directory: DeviceDirectory) -> Self {
        Self {
            root: root.into(),
            directory,
        }
    }

    pub fn parse(&self, topic: &str) -> Result<TopicParts, RoutingError> {
        parse_topic(&self.root, topic)
    }

    /// Attributes already-parsed segments to a registered device.
    pub async fn resolve_parts(&self, parts: TopicParts) -> Result<Route, RoutingError> {
        let record = self
            .directory
            .lookup(&parts.device_id)
            .await?
            .ok_or_else(|| RoutingError::UnknownDevice(parts.device_id.clone()))?;
        if !record.owned_by(&parts.tenant) {
            return Err(RoutingError::TenantMismatch {
                device_id: parts.device_id,
                tenant: parts.tenant,
            });
        }
        Ok(Route {
            tenant_id: record.tenant_id,
            device_id: record.device_id,
            channel: parts.channel,
        })
    }
}
