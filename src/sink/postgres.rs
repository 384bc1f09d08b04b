use super::{ConnectivityRecord, DiagnosticEvent, EventTransition, TransitionState};
use crate::error::PersistenceError;
use crate::rules::types::{Severity, CONNECTIVITY_RULE_ID};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS diagnostic_event_log (
                id bigserial PRIMARY KEY,
                event_id uuid NULL,
                device_id text NOT NULL,
                tenant_id text NOT NULL,
                rule_id text NOT NULL,
                state text NOT NULL,
                severity text NULL,
                opened_at timestamptz NOT NULL,
                closed_at timestamptz NULL,
                transition_at timestamptz NOT NULL,
                trigger jsonb NULL,
                recorded_at timestamptz NOT NULL DEFAULT now(),
                UNIQUE (device_id, rule_id, state, transition_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS diagnostic_event_log_device_opened_idx \
             ON diagnostic_event_log (device_id, opened_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append(&self, batch: &[EventTransition]) -> Result<u64, PersistenceError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO diagnostic_event_log \
             (event_id, device_id, tenant_id, rule_id, state, severity, opened_at, closed_at, transition_at, trigger) ",
        );
        builder.push_values(batch.iter(), |mut b, transition| {
            b.push_bind(transition.event_id)
                .push_bind(&transition.device_id)
                .push_bind(&transition.tenant_id)
                .push_bind(&transition.rule_id)
                .push_bind(transition.state.as_str())
                .push_bind(transition.severity.map(Severity::as_str))
                .push_bind(transition.opened_at)
                .push_bind(transition.closed_at)
                .push_bind(transition.at)
                .push_bind(transition.trigger.clone().map(SqlJson));
        });
        builder.push(" ON CONFLICT (device_id, rule_id, state, transition_at) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn active_events(
        &self,
        device_id: &str,
    ) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT o.event_id, o.device_id, o.tenant_id, o.rule_id, o.severity,
                   o.opened_at, NULL::timestamptz AS closed_at, o.trigger
            FROM diagnostic_event_log o
            WHERE o.device_id = $1
              AND o.state = 'OPEN'
              AND NOT EXISTS (
                  SELECT 1 FROM diagnostic_event_log c
                  WHERE c.event_id = o.event_id AND c.state = 'CLOSED'
              )
            ORDER BY o.opened_at ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn history(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT o.event_id, o.device_id, o.tenant_id, o.rule_id, o.severity,
                   o.opened_at, c.closed_at, o.trigger
            FROM diagnostic_event_log o
            LEFT JOIN diagnostic_event_log c
                ON c.event_id = o.event_id AND c.state = 'CLOSED'
            WHERE o.device_id = $1
              AND o.state = 'OPEN'
              AND o.opened_at >= $2
              AND o.opened_at < $3
            ORDER BY o.opened_at ASC
            "#,
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn latest_connectivity(
        &self,
        device_id: &str,
    ) -> Result<Option<ConnectivityRecord>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT state, transition_at
            FROM diagnostic_event_log
            WHERE device_id = $1 AND rule_id = $2
            ORDER BY transition_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(CONNECTIVITY_RULE_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw_state: String = row.try_get("state")?;
        let Some(TransitionState::Connectivity(connectivity)) = TransitionState::parse(&raw_state)
        else {
            tracing::warn!(device = %device_id, state = %raw_state, "unexpected connectivity state in event log");
            return Ok(None);
        };
        Ok(Some(ConnectivityRecord {
            device_id: device_id.to_string(),
            connectivity,
            at: row.try_get("transition_at")?,
        }))
    }
}

fn event_from_row(row: &PgRow) -> Result<DiagnosticEvent, PersistenceError> {
    let severity: Option<String> = row.try_get("severity")?;
    let trigger: Option<SqlJson<JsonValue>> = row.try_get("trigger")?;
    Ok(DiagnosticEvent {
        event_id: row.try_get::<Uuid, _>("event_id")?,
        device_id: row.try_get("device_id")?,
        tenant_id: row.try_get("tenant_id")?,
        rule_id: row.try_get("rule_id")?,
        severity: severity.as_deref().and_then(Severity::parse),
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
        trigger: trigger.map(|json| json.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connectivity;
    use anyhow::Result;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use sqlx::postgres::PgPoolOptions;
    use std::env;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_event_log_roundtrip_against_postgres() -> Result<()> {
        if env::var("DIAG_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("DIAG_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let schema = format!("diag_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let log = PgEventLog::new(pool.clone());
        log.ensure_schema().await?;

        let event_id = Uuid::new_v4();
        let open = EventTransition {
            event_id: Some(event_id),
            device_id: "RO-2025-0001".to_string(),
            tenant_id: "1".to_string(),
            rule_id: "pressure_in_low".to_string(),
            state: TransitionState::Open,
            severity: Some(Severity::Fault),
            opened_at: at(0),
            closed_at: None,
            at: at(0),
            trigger: Some(serde_json::json!({"channel": "PRESSURE_IN", "observed": 0.2})),
        };
        let online = EventTransition {
            event_id: None,
            device_id: "RO-2025-0001".to_string(),
            tenant_id: "1".to_string(),
            rule_id: CONNECTIVITY_RULE_ID.to_string(),
            state: TransitionState::Connectivity(Connectivity::Online),
            severity: None,
            opened_at: at(0),
            closed_at: None,
            at: at(0),
            trigger: None,
        };

        assert_eq!(log.append(&[online.clone(), open.clone()]).await?, 2);
        assert_eq!(log.append(&[open.clone()]).await?, 0);

        let active = log.active_events("RO-2025-0001").await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event_id, event_id);
        assert_eq!(active[0].severity, Some(Severity::Fault));

        let closed = EventTransition {
            state: TransitionState::Closed,
            closed_at: Some(at(90)),
            at: at(90),
            ..open
        };
        log.append(&[closed]).await?;
        assert!(log.active_events("RO-2025-0001").await?.is_empty());

        let history = log.history("RO-2025-0001", at(-10), at(10)).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].closed_at, Some(at(90)));

        let connectivity = log
            .latest_connectivity("RO-2025-0001")
            .await?
            .expect("connectivity row");
        assert_eq!(connectivity.connectivity, Connectivity::Online);

        sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema))
            .execute(&pool)
            .await?;
        Ok(())
    }
}
