//! Organizer discovery: scan recent platform tournaments, group by
//! organizer, and sample standings to measure deck-submission coverage.
//! Read-only against the API; writes nothing.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::info;

use crate::limitless::LimitlessClient;
use crate::sync::TIER1_ORGANIZERS;

/// Organizers below this sighting count are not worth a coverage probe.
const MIN_TOURNAMENTS: usize = 3;

/// Tournaments sampled per organizer for the coverage probe.
const COVERAGE_SAMPLE: usize = 3;

#[derive(Debug)]
pub struct OrganizerCandidate {
    pub organizer_id: String,
    pub sample_name: String,
    pub tournaments: usize,
    /// Percentage of sampled standings that carried a deck id; None when the
    /// probe found no standings.
    pub deck_coverage: Option<f64>,
}

/// Scan `pages` pages of recent tournaments and rank unseen organizers by
/// activity, probing deck coverage for the active ones.
pub async fn discover(api: &LimitlessClient, pages: u32) -> Vec<OrganizerCandidate> {
    let synced: Vec<String> = TIER1_ORGANIZERS.iter().map(|(id, _)| id.to_string()).collect();

    let mut counts: HashMap<String, (usize, String)> = HashMap::new();
    for page in 1..=pages {
        let tournaments = api.recent_tournaments(page).await;
        if tournaments.is_empty() {
            break;
        }
        info!(page, tournaments = tournaments.len(), "scanned listing page");
        for t in &tournaments {
            let Some(org) = t.organizer_id.as_deref() else {
                continue;
            };
            if synced.iter().any(|s| s == org) {
                continue;
            }
            let entry = counts.entry(org.to_string()).or_insert_with(|| {
                (0, t.name.chars().take(35).collect::<String>())
            });
            entry.0 += 1;
        }
    }

    let ranked: Vec<(String, usize, String)> = counts
        .into_iter()
        .map(|(org, (count, name))| (org, count, name))
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect();

    let mut candidates = Vec::new();
    for (organizer_id, tournaments, sample_name) in ranked {
        let deck_coverage = if tournaments >= MIN_TOURNAMENTS {
            check_deck_coverage(api, &organizer_id).await
        } else {
            None
        };
        candidates.push(OrganizerCandidate {
            organizer_id,
            sample_name,
            tournaments,
            deck_coverage,
        });
    }
    candidates
}

/// Sample a few of an organizer's recent tournaments and measure how many
/// standings carried a deck id.
async fn check_deck_coverage(api: &LimitlessClient, organizer_id: &str) -> Option<f64> {
    let organizer_num: i64 = organizer_id.parse().ok()?;
    let tournaments = api.organizer_recent(organizer_num, 5).await;
    if tournaments.is_empty() {
        return None;
    }

    let mut total_players = 0usize;
    let mut players_with_deck = 0usize;
    for t in tournaments.iter().take(COVERAGE_SAMPLE) {
        let standings = api.tournament_standings(&t.id).await;
        for s in &standings {
            total_players += 1;
            if s.deck.as_ref().and_then(|d| d.id.as_deref()).is_some() {
                players_with_deck += 1;
            }
        }
    }

    if total_players > 0 {
        Some(100.0 * players_with_deck as f64 / total_players as f64)
    } else {
        None
    }
}
