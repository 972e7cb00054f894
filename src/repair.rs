//! Repair/reconciliation of partially-ingested tournaments.
//!
//! A crash between the tournament insert and the completion of its result and
//! match rows leaves a partial tournament behind. This pass finds them (no
//! result rows at all, or result rows without match rows), re-fetches the
//! same API payloads, and fills in only what is missing. Unlike the sync
//! pass, every insert is guarded by a row-level existence check, so repair is
//! safe to run any number of times and safe after a mid-tournament crash.

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};

use crate::db::{is_unique_violation, Db, UNKNOWN_ARCHETYPE};
use crate::limitless::LimitlessClient;
use crate::sync::resolve::Resolver;
use crate::sync::{drop_note, pairing_perspectives, resolve_standing_archetype};

#[derive(Debug, Default)]
pub struct RepairSummary {
    pub tournaments_flagged: usize,
    pub results_inserted: usize,
    pub matches_inserted: usize,
}

#[derive(Debug)]
struct FlaggedTournament {
    tournament_id: i64,
    external_id: String,
    reason: &'static str,
}

/// Repair all flagged tournaments, optionally scoped to one organizer's
/// store.
pub async fn repair(
    db: &Db,
    api: &LimitlessClient,
    organizer_id: Option<i64>,
) -> Result<RepairSummary> {
    let unknown_archetype_id = db
        .archetype_id_by_name(UNKNOWN_ARCHETYPE)
        .await?
        .context("archetype catalog is missing the UNKNOWN row")?;

    let flagged = flagged_tournaments(db, organizer_id).await?;
    info!(flagged = flagged.len(), "tournaments flagged for repair");

    let mut summary = RepairSummary {
        tournaments_flagged: flagged.len(),
        ..Default::default()
    };

    for t in &flagged {
        info!(
            tournament_id = t.tournament_id,
            external_id = %t.external_id,
            reason = t.reason,
            "repairing tournament"
        );
        match repair_tournament(db, api, t, unknown_archetype_id).await {
            Ok((results, matches)) => {
                summary.results_inserted += results;
                summary.matches_inserted += matches;
            }
            Err(e) => {
                warn!(
                    tournament_id = t.tournament_id,
                    error = %e,
                    "repair failed for tournament, continuing"
                );
            }
        }
    }

    if let Some(organizer_id) = organizer_id {
        db.log_ingestion(
            organizer_id,
            "repair",
            "success",
            (summary.results_inserted + summary.matches_inserted) as i64,
            None,
            Some(json!({
                "tournaments_flagged": summary.tournaments_flagged,
                "results_inserted": summary.results_inserted,
                "matches_inserted": summary.matches_inserted,
            })),
        )
        .await?;
    }

    info!(
        flagged = summary.tournaments_flagged,
        results = summary.results_inserted,
        matches = summary.matches_inserted,
        "repair pass finished"
    );
    Ok(summary)
}

/// Ingested tournaments in a partial state: (a) zero result rows, or
/// (b) result rows but zero match rows. Only tournaments that came from the
/// platform (external id present) qualify.
async fn flagged_tournaments(
    db: &Db,
    organizer_id: Option<i64>,
) -> Result<Vec<FlaggedTournament>> {
    let sql = "SELECT t.tournament_id, t.external_id,
                      COALESCE(r.n, 0) AS result_count,
                      COALESCE(m.n, 0) AS match_count
               FROM tournaments t
               LEFT JOIN (SELECT tournament_id, count(*) AS n FROM results GROUP BY tournament_id) r
                      USING (tournament_id)
               LEFT JOIN (SELECT tournament_id, count(*) AS n FROM matches GROUP BY tournament_id) m
                      USING (tournament_id)
               WHERE t.external_id IS NOT NULL
                 AND (COALESCE(r.n, 0) = 0 OR COALESCE(m.n, 0) = 0)
                 AND ($1::bigint IS NULL OR t.store_id IN
                      (SELECT store_id FROM stores WHERE organizer_id = $1))
               ORDER BY t.tournament_id";
    let rows = sqlx::query(sql)
        .bind(organizer_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let result_count: i64 = row.get("result_count");
            FlaggedTournament {
                tournament_id: row.get("tournament_id"),
                external_id: row.get("external_id"),
                reason: if result_count == 0 {
                    "no results"
                } else {
                    "no matches"
                },
            }
        })
        .collect())
}

/// Re-fetch standings and pairings for one tournament and insert whatever is
/// missing. Row-level existence checks make this re-entrant.
async fn repair_tournament(
    db: &Db,
    api: &LimitlessClient,
    flagged: &FlaggedTournament,
    unknown_archetype_id: i64,
) -> Result<(usize, usize)> {
    let tournament_id = flagged.tournament_id;
    let external_id = flagged.external_id.as_str();
    let mut resolver = Resolver::preload(db, unknown_archetype_id).await?;

    let mut results_inserted = 0usize;
    let standings = api.tournament_standings(external_id).await;
    for standing in &standings {
        if standing.player.is_empty() {
            continue;
        }
        let display_name = standing.name.as_deref().unwrap_or(&standing.player);
        let player_id = resolver
            .resolve_player(db, &standing.player, display_name)
            .await?;

        let exists =
            sqlx::query("SELECT 1 FROM results WHERE tournament_id = $1 AND player_id = $2")
                .bind(tournament_id)
                .bind(player_id)
                .fetch_optional(&db.pool)
                .await?;
        if exists.is_some() {
            continue;
        }

        let (archetype_id, request_id) =
            resolve_standing_archetype(db, &mut resolver, standing).await?;
        let notes = drop_note(standing.drop_round.as_ref());
        let decklist_url = standing
            .decklist
            .as_ref()
            .map(|_| api.decklist_url(external_id, &standing.player));

        let inserted = sqlx::query(
            "INSERT INTO results
                 (tournament_id, player_id, archetype_id, pending_request_id, placement,
                  wins, losses, ties, decklist, decklist_url, notes, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now(), now())",
        )
        .bind(tournament_id)
        .bind(player_id)
        .bind(archetype_id)
        .bind(request_id)
        .bind(standing.placing)
        .bind(standing.record.wins)
        .bind(standing.record.losses)
        .bind(standing.record.ties)
        .bind(&standing.decklist)
        .bind(decklist_url)
        .bind(notes)
        .execute(&db.pool)
        .await;
        match inserted {
            Ok(_) => results_inserted += 1,
            Err(e) if is_unique_violation(&e) => {}
            Err(e) => {
                warn!(tournament_id, player = %standing.player, error = %e, "result repair insert failed");
            }
        }
    }

    let mut matches_inserted = 0usize;
    let pairings = api.tournament_pairings(external_id).await;
    for pairing in &pairings {
        let Some(round) = pairing.round else {
            continue;
        };
        let Some(rows) = pairing_perspectives(
            pairing,
            resolver.player_id(&pairing.player1),
            resolver.player_id(&pairing.player2),
        ) else {
            continue;
        };

        for (player_id, opponent_id, points) in rows {
            let exists = sqlx::query(
                "SELECT 1 FROM matches
                 WHERE tournament_id = $1 AND round_number = $2
                   AND player_id = $3 AND opponent_id = $4",
            )
            .bind(tournament_id)
            .bind(round)
            .bind(player_id)
            .bind(opponent_id)
            .fetch_optional(&db.pool)
            .await?;
            if exists.is_some() {
                continue;
            }

            let inserted = sqlx::query(
                "INSERT INTO matches
                     (tournament_id, round_number, player_id, opponent_id, match_points, submitted_at)
                 VALUES ($1, $2, $3, $4, $5, now())",
            )
            .bind(tournament_id)
            .bind(round)
            .bind(player_id)
            .bind(opponent_id)
            .bind(points)
            .execute(&db.pool)
            .await;
            match inserted {
                Ok(_) => matches_inserted += 1,
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => {
                    warn!(tournament_id, round, error = %e, "match repair insert failed");
                }
            }
        }
    }

    info!(
        tournament_id,
        results = results_inserted,
        matches = matches_inserted,
        "tournament repaired"
    );
    Ok((results_inserted, matches_inserted))
}
