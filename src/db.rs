use anyhow::Result;
use chrono::NaiveDate;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

/// Name of the reserved catch-all archetype row. The platform's own "other"
/// deck bucket maps here; the classifier backfill also keys off it.
pub const UNKNOWN_ARCHETYPE: &str = "UNKNOWN";

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when the DSN asks for it; sqlx with
        // runtime-tokio-rustls handles the rest.
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }
}

/// Classify a store error as a uniqueness violation.
///
/// Duplicate-key failures are expected under re-entry between sync and repair
/// passes and are swallowed by callers; everything else is a real error.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct StoreRef {
    pub store_id: i64,
    pub name: String,
}

impl Db {
    /// Look up the local store associated with an external organizer id.
    /// Stores are curated by hand and must pre-exist before syncing.
    pub async fn store_for_organizer(&self, organizer_id: i64) -> Result<Option<StoreRef>> {
        let row = sqlx::query("SELECT store_id, name FROM stores WHERE organizer_id = $1")
            .bind(organizer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoreRef {
            store_id: r.get("store_id"),
            name: r.get("name"),
        }))
    }

    pub async fn archetype_id_by_name(&self, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT archetype_id FROM archetypes WHERE archetype_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("archetype_id")))
    }

    /// Full archetype catalog, name -> id. Used by the classifier paths.
    pub async fn archetype_catalog(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT archetype_id, archetype_name FROM archetypes")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("archetype_name"), r.get::<i64, _>("archetype_id")))
            .collect())
    }

    /// Most recently released format on or before the event date.
    /// Date-based fallback for format inference.
    pub async fn latest_format_on_or_before(&self, date: NaiveDate) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT format_id FROM formats WHERE release_date <= $1
             ORDER BY release_date DESC LIMIT 1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("format_id")))
    }

    /// Upsert per-organizer sync state after a successful pass.
    ///
    /// `last_tournament_date` is monotonic non-decreasing: GREATEST keeps an
    /// older re-sync from winding the watermark backwards.
    pub async fn update_sync_state(
        &self,
        organizer_id: i64,
        tournaments_synced: i64,
        last_tournament_date: Option<NaiveDate>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_state (organizer_id, last_synced_at, last_tournament_date, tournaments_synced)
             VALUES ($1, now(), $2, $3)
             ON CONFLICT (organizer_id) DO UPDATE SET
                 last_synced_at = now(),
                 last_tournament_date = GREATEST(sync_state.last_tournament_date, EXCLUDED.last_tournament_date),
                 tournaments_synced = sync_state.tournaments_synced + EXCLUDED.tournaments_synced",
        )
        .bind(organizer_id)
        .bind(last_tournament_date)
        .bind(tournaments_synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append an entry to the ingestion audit log. The log is append-only;
    /// nothing in this crate updates or deletes it.
    pub async fn log_ingestion(
        &self,
        organizer_id: i64,
        action: &str,
        status: &str,
        records_affected: i64,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_log (source, action, status, records_affected, error_message, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())",
        )
        .bind(format!("organizer_{organizer_id}"))
        .bind(action)
        .bind(status)
        .bind(records_affected)
        .bind(error_message)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
