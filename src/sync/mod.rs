//! Tournament sync orchestration.
//!
//! One pass per organizer: list candidate tournaments since a date, skip the
//! ones already ingested (whole-tournament skip — one existence probe saves
//! the whole API round-trip), and materialize tournament/result/match rows
//! for the rest. Partial failures are left for the repair pass, which uses
//! row-level checks instead.

pub mod resolve;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::classify;
use crate::db::{is_unique_violation, Db, UNKNOWN_ARCHETYPE};
use crate::limitless::{LimitlessClient, Pairing, TournamentDetails, TournamentSummary};
use resolve::Resolver;

/// Tier-1 organizers for the --all-tier1 flag.
pub const TIER1_ORGANIZERS: &[(i64, &str)] = &[
    (452, "Eagle's Nest"),
    (281, "PHOENIX REBORN"),
    (559, "DMV Drakes"),
    (578, "MasterRukasu"),
];

/// Tournaments below this player count are too small to be meaningful.
const MIN_PLAYER_COUNT: i64 = 4;

pub fn organizer_label(organizer_id: i64) -> String {
    TIER1_ORGANIZERS
        .iter()
        .find(|(id, _)| *id == organizer_id)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| format!("Organizer {organizer_id}"))
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub since: NaiveDate,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct OrganizerStats {
    pub organizer_id: i64,
    pub tournaments_found: usize,
    pub tournaments_synced: usize,
    pub tournaments_skipped: usize,
    pub results_inserted: usize,
    pub matches_inserted: usize,
    pub players_created: usize,
    pub deck_requests_created: usize,
    pub last_tournament_date: Option<NaiveDate>,
}

#[derive(Debug, Default)]
struct TournamentStats {
    results: usize,
    matches: usize,
    players_created: usize,
    deck_requests: usize,
    event_date: Option<NaiveDate>,
}

/// Sync all tournaments for one organizer. A missing store association or a
/// missing UNKNOWN archetype is fatal for this organizer's run; the caller
/// continues with the remaining organizers.
pub async fn sync_organizer(
    db: &Db,
    api: &LimitlessClient,
    organizer_id: i64,
    opts: &SyncOptions,
) -> Result<OrganizerStats> {
    let label = organizer_label(organizer_id);
    info!(organizer_id, organizer = %label, since = %opts.since, dry_run = opts.dry_run, "starting sync");

    let Some(store) = db.store_for_organizer(organizer_id).await? else {
        if !opts.dry_run {
            db.log_ingestion(
                organizer_id,
                "sync",
                "error",
                0,
                Some(&format!("no store configured for organizer {organizer_id}")),
                None,
            )
            .await?;
        }
        bail!("no store configured for organizer {organizer_id}; create it and set its organizer_id first");
    };
    info!(store_id = store.store_id, store = %store.name, "resolved store");

    let Some(unknown_archetype_id) = db.archetype_id_by_name(UNKNOWN_ARCHETYPE).await? else {
        if !opts.dry_run {
            db.log_ingestion(
                organizer_id,
                "sync",
                "error",
                0,
                Some("archetype catalog is missing the UNKNOWN row"),
                None,
            )
            .await?;
        }
        bail!("archetype catalog is missing the UNKNOWN row");
    };

    let mut tournaments = api.list_tournaments(organizer_id, opts.since).await;
    if let Some(limit) = opts.limit {
        tournaments.truncate(limit);
    }

    let mut stats = OrganizerStats {
        organizer_id,
        tournaments_found: tournaments.len(),
        ..Default::default()
    };

    for tournament in &tournaments {
        match sync_tournament(
            db,
            api,
            tournament,
            organizer_id,
            store.store_id,
            unknown_archetype_id,
            opts,
        )
        .await
        {
            Ok(None) => stats.tournaments_skipped += 1,
            Ok(Some(t)) => {
                stats.tournaments_synced += 1;
                stats.results_inserted += t.results;
                stats.matches_inserted += t.matches;
                stats.players_created += t.players_created;
                stats.deck_requests_created += t.deck_requests;
                if let Some(date) = t.event_date {
                    stats.last_tournament_date = Some(match stats.last_tournament_date {
                        Some(prev) => prev.max(date),
                        None => date,
                    });
                }
            }
            Err(e) => {
                warn!(external_id = %tournament.id, error = %e, "tournament sync failed");
                stats.tournaments_skipped += 1;
                if !opts.dry_run {
                    db.log_ingestion(
                        organizer_id,
                        "sync_tournament",
                        "error",
                        0,
                        Some(&e.to_string()),
                        Some(json!({ "external_id": tournament.id })),
                    )
                    .await?;
                }
            }
        }
    }

    if !opts.dry_run && stats.tournaments_synced > 0 {
        db.update_sync_state(
            organizer_id,
            stats.tournaments_synced as i64,
            stats.last_tournament_date,
        )
        .await?;
        db.log_ingestion(
            organizer_id,
            "sync",
            "success",
            stats.results_inserted as i64,
            None,
            Some(json!({
                "tournaments_synced": stats.tournaments_synced,
                "tournaments_skipped": stats.tournaments_skipped,
                "players_created": stats.players_created,
                "deck_requests_created": stats.deck_requests_created,
            })),
        )
        .await?;
    }

    info!(
        organizer_id,
        synced = stats.tournaments_synced,
        skipped = stats.tournaments_skipped,
        results = stats.results_inserted,
        matches = stats.matches_inserted,
        new_players = stats.players_created,
        deck_requests = stats.deck_requests_created,
        "sync pass finished"
    );
    Ok(stats)
}

/// Sync one tournament: details, standings, pairings. Returns None when the
/// tournament was skipped (already ingested, too small, or unfetchable).
async fn sync_tournament(
    db: &Db,
    api: &LimitlessClient,
    tournament: &TournamentSummary,
    organizer_id: i64,
    store_id: i64,
    unknown_archetype_id: i64,
    opts: &SyncOptions,
) -> Result<Option<TournamentStats>> {
    let external_id = tournament.id.as_str();

    // Sync-time idempotency: one probe by external id skips the whole
    // tournament, including all of its API calls.
    let existing = sqlx::query("SELECT tournament_id FROM tournaments WHERE external_id = $1")
        .bind(external_id)
        .fetch_optional(&db.pool)
        .await?;
    if existing.is_some() {
        info!(external_id, name = %tournament.name, "skipping: already synced");
        return Ok(None);
    }

    if let Some(players) = tournament.players {
        if players < MIN_PLAYER_COUNT {
            info!(external_id, players, "skipping: too few players");
            return Ok(None);
        }
    }

    let Some(details) = api.tournament_details(external_id).await else {
        warn!(external_id, "skipping: details fetch failed");
        return Ok(None);
    };
    let Some(event_date) = tournament.event_date() else {
        warn!(external_id, date = %tournament.date, "skipping: unparsable event date");
        return Ok(None);
    };

    let rounds = count_total_rounds(&details);
    let format = infer_format(db, &tournament.name, event_date).await;
    info!(
        external_id,
        name = %tournament.name,
        format = format.as_deref().unwrap_or("(unknown)"),
        rounds = rounds.unwrap_or(0),
        "processing tournament"
    );

    if opts.dry_run {
        let standings = api.tournament_standings(external_id).await;
        let pairings = api.tournament_pairings(external_id).await;
        info!(
            external_id,
            standings = standings.len(),
            pairings = pairings.len(),
            "[dry-run] would insert tournament"
        );
        return Ok(Some(TournamentStats {
            results: standings.len(),
            matches: pairings.len() * 2,
            event_date: Some(event_date),
            ..Default::default()
        }));
    }

    let tournament_id: i64 = sqlx::query_scalar(
        "INSERT INTO tournaments
             (store_id, event_date, event_type, format, player_count, rounds, external_id, notes, created_at, updated_at)
         VALUES ($1, $2, 'online', $3, $4, $5, $6, $7, now(), now())
         RETURNING tournament_id",
    )
    .bind(store_id)
    .bind(event_date)
    .bind(&format)
    .bind(tournament.players)
    .bind(rounds)
    .bind(external_id)
    .bind(format!("Imported from Limitless (organizer {organizer_id})"))
    .fetch_one(&db.pool)
    .await
    .context("inserting tournament row")?;
    info!(external_id, tournament_id, "inserted tournament");

    let mut stats = TournamentStats {
        event_date: Some(event_date),
        ..Default::default()
    };

    // Caches are (re)loaded from the store per tournament so a repair or a
    // prior partial pass is always visible.
    let mut resolver = Resolver::preload(db, unknown_archetype_id).await?;

    let standings = api.tournament_standings(external_id).await;
    for standing in &standings {
        if standing.player.is_empty() {
            continue;
        }
        let display_name = standing.name.as_deref().unwrap_or(&standing.player);
        let player_id = resolver
            .resolve_player(db, &standing.player, display_name)
            .await?;

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
            Ok(_) => stats.results += 1,
            Err(e) if is_unique_violation(&e) => {
                warn!(player = %standing.player, "duplicate result, skipping");
            }
            Err(e) => {
                warn!(player = %standing.player, error = %e, "result insert failed, skipping row");
            }
        }
    }
    stats.players_created = resolver.players_created();
    stats.deck_requests = resolver.requests_created();
    info!(
        tournament_id,
        results = stats.results,
        new_players = stats.players_created,
        deck_requests = stats.deck_requests,
        "standings processed"
    );

    let pairings = api.tournament_pairings(external_id).await;
    for pairing in &pairings {
        let Some(round) = pairing.round else {
            warn!(tournament_id, "pairing without round number, skipping");
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
                Ok(_) => stats.matches += 1,
                Err(e) if is_unique_violation(&e) => {
                    // Expected race with a repair pass; half-inserted pairs
                    // are completed there.
                    break;
                }
                Err(e) => {
                    warn!(
                        tournament_id,
                        round,
                        player1 = %pairing.player1,
                        player2 = %pairing.player2,
                        error = %e,
                        "match insert failed, skipping pairing"
                    );
                    break;
                }
            }
        }
    }
    info!(tournament_id, matches = stats.matches, "pairings processed");

    Ok(Some(stats))
}

/// Deck resolution for one standing, including the ingestion-time
/// classification fallback. Decklist text lets us classify immediately
/// instead of waiting for curation; a hit also settles the pending mapping.
pub(crate) async fn resolve_standing_archetype(
    db: &Db,
    resolver: &mut Resolver,
    standing: &crate::limitless::Standing,
) -> Result<(Option<i64>, Option<i64>)> {
    let (mut archetype_id, request_id) = resolver.resolve_deck(db, standing.deck.as_ref()).await?;
    if archetype_id.is_none() {
        if let Some(decklist) = &standing.decklist {
            if let Some(name) = classify::classify(decklist) {
                if let Some(id) = db.archetype_id_by_name(name).await? {
                    archetype_id = Some(id);
                    if let Some(code) = standing.deck.as_ref().and_then(|d| d.id.as_deref()) {
                        classify::assign_deck_archetype(db, code, id).await?;
                        resolver.note_deck_archetype(code, id);
                    }
                }
            }
        }
    }
    Ok((archetype_id, request_id))
}

/// Both per-player perspectives of a pairing, or None for byes and pairings
/// whose players never appeared in standings.
pub fn pairing_perspectives(
    pairing: &Pairing,
    player1_id: Option<i64>,
    player2_id: Option<i64>,
) -> Option<[(i64, i64, i32); 2]> {
    if pairing.player2.is_empty() {
        // Bye: no opponent, no rows.
        return None;
    }
    let (p1, p2) = (player1_id?, player2_id?);
    let (a, b) = match_points(&pairing.winner, &pairing.player1, &pairing.player2);
    Some([(p1, p2, a), (p2, p1, b)])
}

/// Per-perspective match points from the pairing's winner field.
/// "0" is the tie sentinel, "-1" the double-loss sentinel; anything else
/// unrecognized is treated as a tie.
pub fn match_points(winner: &str, player1: &str, player2: &str) -> (i32, i32) {
    if winner == player1 {
        (3, 0)
    } else if winner == player2 {
        (0, 3)
    } else if winner == "0" {
        (1, 1)
    } else if winner == "-1" {
        (0, 0)
    } else {
        (1, 1)
    }
}

/// Result-row note for players who dropped.
pub fn drop_note(drop: Option<&Value>) -> Option<String> {
    let v = drop?;
    match v {
        Value::Number(n) if n.as_i64() != Some(0) => Some(format!("Dropped at round {n}")),
        Value::String(s) if !s.is_empty() => Some(format!("Dropped: {s}")),
        _ => None,
    }
}

/// Total rounds across all phases; a phase may report a count or a list.
pub fn count_total_rounds(details: &TournamentDetails) -> Option<i64> {
    if details.phases.is_empty() {
        return None;
    }
    let total: i64 = details.phases.iter().map(|p| p.rounds.count()).sum();
    (total > 0).then_some(total)
}

static SET_CODE: OnceLock<regex::Regex> = OnceLock::new();

/// Parse a set code token (e.g. "BT19 Weekly" -> "BT19") from a tournament
/// name.
pub fn format_from_name(name: &str) -> Option<String> {
    let re = SET_CODE
        .get_or_init(|| regex::Regex::new(r"(?i)(BT)-?(\d+)|(EX)-?(\d+)").expect("set code regex"));
    let caps = re.captures(name)?;
    if caps.get(1).is_some() {
        Some(format!("BT{}", &caps[2]))
    } else {
        Some(format!("EX{}", &caps[4]))
    }
}

/// Infer a format: set code token in the name first, most recently released
/// format on or before the event date as fallback.
pub async fn infer_format(db: &Db, name: &str, event_date: NaiveDate) -> Option<String> {
    if let Some(f) = format_from_name(name) {
        return Some(f);
    }
    match db.latest_format_on_or_before(event_date).await {
        Ok(format) => format,
        Err(e) => {
            warn!(error = %e, "could not infer format from date");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing(player1: &str, player2: &str, winner: &str) -> Pairing {
        serde_json::from_value(serde_json::json!({
            "round": 1,
            "player1": player1,
            "player2": player2,
            "winner": winner,
        }))
        .unwrap()
    }

    #[test]
    fn match_points_all_winner_cases() {
        assert_eq!(match_points("alice", "alice", "bob"), (3, 0));
        assert_eq!(match_points("bob", "alice", "bob"), (0, 3));
        assert_eq!(match_points("0", "alice", "bob"), (1, 1));
        assert_eq!(match_points("-1", "alice", "bob"), (0, 0));
        assert_eq!(match_points("", "alice", "bob"), (1, 1));
    }

    #[test]
    fn bye_produces_no_match_rows() {
        let p = pairing("alice", "", "alice");
        assert_eq!(pairing_perspectives(&p, Some(1), None), None);
    }

    #[test]
    fn perspectives_are_opponent_symmetric() {
        let p = pairing("alice", "bob", "alice");
        let rows = pairing_perspectives(&p, Some(10), Some(20)).unwrap();
        assert_eq!(rows, [(10, 20, 3), (20, 10, 0)]);
    }

    #[test]
    fn unresolved_player_skips_pairing() {
        let p = pairing("alice", "bob", "bob");
        assert_eq!(pairing_perspectives(&p, Some(10), None), None);
        assert_eq!(pairing_perspectives(&p, None, Some(20)), None);
    }

    #[test]
    fn format_token_from_name() {
        assert_eq!(format_from_name("BT19 Weekly"), Some("BT19".to_string()));
        assert_eq!(format_from_name("bt-20 locals"), Some("BT20".to_string()));
        assert_eq!(format_from_name("EX7 Showdown"), Some("EX7".to_string()));
        assert_eq!(format_from_name("ex-3 throwback"), Some("EX3".to_string()));
        assert_eq!(format_from_name("Friday Night Digimon"), None);
    }

    #[test]
    fn rounds_sum_counts_and_lists() {
        let details: TournamentDetails = serde_json::from_value(serde_json::json!({
            "phases": [{"rounds": 4}, {"rounds": [{}, {}]}]
        }))
        .unwrap();
        assert_eq!(count_total_rounds(&details), Some(6));

        let empty: TournamentDetails = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(count_total_rounds(&empty), None);

        let zeroed: TournamentDetails =
            serde_json::from_value(serde_json::json!({"phases": [{"rounds": 0}]})).unwrap();
        assert_eq!(count_total_rounds(&zeroed), None);
    }

    #[test]
    fn drop_notes() {
        assert_eq!(
            drop_note(Some(&serde_json::json!(3))),
            Some("Dropped at round 3".to_string())
        );
        assert_eq!(
            drop_note(Some(&serde_json::json!("judge call"))),
            Some("Dropped: judge call".to_string())
        );
        assert_eq!(drop_note(Some(&serde_json::json!(0))), None);
        assert_eq!(drop_note(Some(&serde_json::json!(""))), None);
        assert_eq!(drop_note(None), None);
    }
}
