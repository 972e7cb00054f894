//! Reset operator: deletes ingested tournament data while preserving the
//! curated tables (deck_map, deck_requests, archetypes) and the append-only
//! ingestion log.
//!
//! Deletion runs in dependency order: matches, results, tournaments,
//! sync_state. Players are shared across organizers, so only a global reset
//! removes them.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::db::Db;

#[derive(Debug, Default)]
pub struct ResetSummary {
    pub matches: u64,
    pub results: u64,
    pub tournaments: u64,
    pub sync_states: u64,
    pub players: u64,
}

/// Current row counts for the tables a reset touches, for display before
/// confirmation.
pub async fn ingested_counts(db: &Db) -> Result<Vec<(&'static str, i64)>> {
    let mut out = Vec::new();
    for table in ["matches", "results", "tournaments", "sync_state", "players"] {
        let count: i64 = sqlx::query(&format!("SELECT count(*) AS n FROM {table}"))
            .fetch_one(&db.pool)
            .await?
            .get("n");
        out.push((table, count));
    }
    Ok(out)
}

/// Delete ingested rows. An empty organizer list means a global reset, which
/// additionally removes players; a scoped reset keeps them.
pub async fn reset(db: &Db, organizer_ids: &[i64]) -> Result<ResetSummary> {
    if organizer_ids.is_empty() {
        reset_all(db).await
    } else {
        reset_organizers(db, organizer_ids).await
    }
}

async fn reset_all(db: &Db) -> Result<ResetSummary> {
    let mut summary = ResetSummary::default();
    summary.matches = exec(db, "DELETE FROM matches", &[]).await?;
    summary.results = exec(db, "DELETE FROM results", &[]).await?;
    summary.tournaments = exec(db, "DELETE FROM tournaments", &[]).await?;
    summary.sync_states = exec(db, "DELETE FROM sync_state", &[]).await?;
    summary.players = exec(db, "DELETE FROM players", &[]).await?;
    info!(
        matches = summary.matches,
        results = summary.results,
        tournaments = summary.tournaments,
        sync_states = summary.sync_states,
        players = summary.players,
        "global reset complete"
    );
    Ok(summary)
}

async fn reset_organizers(db: &Db, organizer_ids: &[i64]) -> Result<ResetSummary> {
    let mut summary = ResetSummary::default();
    summary.matches = exec(
        db,
        "DELETE FROM matches WHERE tournament_id IN
             (SELECT t.tournament_id FROM tournaments t
              JOIN stores s ON t.store_id = s.store_id
              WHERE s.organizer_id = ANY($1))",
        organizer_ids,
    )
    .await?;
    summary.results = exec(
        db,
        "DELETE FROM results WHERE tournament_id IN
             (SELECT t.tournament_id FROM tournaments t
              JOIN stores s ON t.store_id = s.store_id
              WHERE s.organizer_id = ANY($1))",
        organizer_ids,
    )
    .await?;
    summary.tournaments = exec(
        db,
        "DELETE FROM tournaments WHERE store_id IN
             (SELECT store_id FROM stores WHERE organizer_id = ANY($1))",
        organizer_ids,
    )
    .await?;
    summary.sync_states = exec(
        db,
        "DELETE FROM sync_state WHERE organizer_id = ANY($1)",
        organizer_ids,
    )
    .await?;
    info!(
        organizers = ?organizer_ids,
        matches = summary.matches,
        results = summary.results,
        tournaments = summary.tournaments,
        sync_states = summary.sync_states,
        "scoped reset complete"
    );
    Ok(summary)
}

async fn exec(db: &Db, sql: &str, organizer_ids: &[i64]) -> Result<u64> {
    let mut query = sqlx::query(sql);
    if !organizer_ids.is_empty() {
        query = query.bind(organizer_ids);
    }
    Ok(query.execute(&db.pool).await?.rows_affected())
}
