//! Rate-limited client for the Limitless tournament platform API.
//!
//! Every call is a single attempt: 404s, transport failures, non-2xx statuses
//! and malformed bodies are all logged and surfaced as absence, and the caller
//! proceeds as if no data came back. The only backoff behavior is the pause
//! derived from the server's remaining-quota header plus a fixed delay
//! enforced between calls.

use anyhow::Result;
use chrono::NaiveDate;
use reqwest::{header, Client};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::util::env::{env_opt, env_parse};

const DEFAULT_BASE_URL: &str = "https://play.limitlesstcg.com/api";
const DEFAULT_GAME: &str = "DCG";

/// Fixed page size for the tournament listing endpoint. A short or empty page
/// terminates pagination.
pub const PAGE_SIZE: usize = 50;

/// Minimum delay between every API call, regardless of quota.
const REQUEST_DELAY_MS: u64 = 500;

/// Pause decision from the server's remaining-quota hint.
pub fn quota_pause(remaining: u64) -> Option<Duration> {
    if remaining < 5 {
        Some(Duration::from_secs(5))
    } else if remaining < 20 {
        Some(Duration::from_secs(2))
    } else {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TournamentSummary {
    // The API is inconsistent about numeric vs string ids.
    #[serde(deserialize_with = "string_from_any")]
    pub id: String,
    #[serde(default = "unknown_tournament")]
    pub name: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub players: Option<i64>,
    #[serde(
        default,
        rename = "organizerId",
        deserialize_with = "opt_string_from_any"
    )]
    pub organizer_id: Option<String>,
}

fn unknown_tournament() -> String {
    "Unknown Tournament".to_string()
}

impl TournamentSummary {
    pub fn event_date(&self) -> Option<NaiveDate> {
        parse_event_date(&self.date)
    }
}

/// Event dates arrive either bare (`2025-10-01`) or as a full timestamp;
/// only the date part matters.
pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TournamentDetails {
    #[serde(default)]
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub rounds: Rounds,
}

/// A phase reports its rounds either as a count or as a list of round
/// objects; a list counts as its length.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Rounds {
    Count(i64),
    List(Vec<Value>),
}

impl Default for Rounds {
    fn default() -> Self {
        Rounds::Count(0)
    }
}

impl Rounds {
    pub fn count(&self) -> i64 {
        match self {
            Rounds::Count(n) => *n,
            Rounds::List(items) => items.len() as i64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Standing {
    /// Platform username; empty when the player is anonymous.
    #[serde(default)]
    pub player: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub placing: Option<i32>,
    #[serde(default)]
    pub record: RecordLine,
    #[serde(default)]
    pub deck: Option<DeckRef>,
    /// Raw decklist payload (card categories -> [{name, count}]), when the
    /// player submitted one.
    #[serde(default)]
    pub decklist: Option<Value>,
    /// Round number or free-form note when the player dropped.
    #[serde(default, rename = "drop")]
    pub drop_round: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordLine {
    #[serde(default)]
    pub wins: i32,
    #[serde(default)]
    pub losses: i32,
    #[serde(default)]
    pub ties: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeckRef {
    #[serde(default, deserialize_with = "opt_string_from_any")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pairing {
    #[serde(default)]
    pub round: Option<i32>,
    #[serde(default)]
    pub player1: String,
    /// Empty for bye pairings.
    #[serde(default)]
    pub player2: String,
    /// Username of the winner, or a sentinel: "0" = tie, "-1" = double loss.
    #[serde(default, deserialize_with = "string_from_any")]
    pub winner: String,
}

pub struct LimitlessClient {
    http: Client,
    base_url: String,
    game: String,
}

impl LimitlessClient {
    pub fn from_env() -> Result<Self> {
        let base_url = env_opt("LIMITLESS_API_BASE")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let game = env_opt("LIMITLESS_GAME").unwrap_or_else(|| DEFAULT_GAME.to_string());
        let timeout_secs: u64 = env_parse("LIMITLESS_HTTP_TIMEOUT_SECS", 30u64);
        let http = Client::builder()
            .user_agent("MetaLab/1.0 (tournament-sync)")
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url,
            game,
        })
    }

    /// All DCG tournaments for an organizer on or after `since`, paginated.
    ///
    /// The date filter is client-side: pages older than the cutoff are still
    /// fetched in full before the short-page condition ends the loop. That
    /// costs extra calls, never correctness.
    pub async fn list_tournaments(
        &self,
        organizer_id: i64,
        since: NaiveDate,
    ) -> Vec<TournamentSummary> {
        let mut all = Vec::new();
        let mut page: u32 = 1;
        loop {
            let data = self
                .get_json(
                    "/tournaments",
                    &[
                        ("game", self.game.clone()),
                        ("organizerId", organizer_id.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await;
            let Some(Value::Array(items)) = data else {
                break;
            };
            if items.is_empty() {
                break;
            }
            let got = items.len();
            for item in items {
                match serde_json::from_value::<TournamentSummary>(item) {
                    Ok(t) => {
                        if t.event_date().map(|d| d >= since).unwrap_or(false) {
                            all.push(t);
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable tournament summary"),
                }
            }
            if got < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        all
    }

    /// One page of recent tournaments across all organizers. Used by the
    /// organizer discovery scan.
    pub async fn recent_tournaments(&self, page: u32) -> Vec<TournamentSummary> {
        let data = self
            .get_json(
                "/tournaments",
                &[
                    ("game", self.game.clone()),
                    ("limit", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ],
            )
            .await;
        let Some(Value::Array(items)) = data else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()
    }

    /// First `limit` tournaments for an organizer, newest first. Single
    /// call; used for coverage sampling, not for sync.
    pub async fn organizer_recent(&self, organizer_id: i64, limit: usize) -> Vec<TournamentSummary> {
        let data = self
            .get_json(
                "/tournaments",
                &[
                    ("game", self.game.clone()),
                    ("organizerId", organizer_id.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await;
        let Some(Value::Array(items)) = data else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()
    }

    /// Public decklist page for a standing; stored alongside the raw payload.
    pub fn decklist_url(&self, tournament_id: &str, username: &str) -> String {
        let site = self.base_url.trim_end_matches("/api");
        format!("{site}/tournament/{tournament_id}/player/{username}/decklist")
    }

    pub async fn tournament_details(&self, id: &str) -> Option<TournamentDetails> {
        let v = self.get_json(&format!("/tournaments/{id}/details"), &[]).await?;
        match serde_json::from_value(v) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(tournament = %id, error = %e, "undecodable details payload");
                None
            }
        }
    }

    pub async fn tournament_standings(&self, id: &str) -> Vec<Standing> {
        let Some(v) = self.get_json(&format!("/tournaments/{id}/standings"), &[]).await else {
            return Vec::new();
        };
        match serde_json::from_value(v) {
            Ok(s) => s,
            Err(e) => {
                warn!(tournament = %id, error = %e, "undecodable standings payload");
                Vec::new()
            }
        }
    }

    pub async fn tournament_pairings(&self, id: &str) -> Vec<Pairing> {
        let Some(v) = self.get_json(&format!("/tournaments/{id}/pairings"), &[]).await else {
            return Vec::new();
        };
        match serde_json::from_value(v) {
            Ok(p) => p,
            Err(e) => {
                warn!(tournament = %id, error = %e, "undecodable pairings payload");
                Vec::new()
            }
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Option<Value> {
        let out = self.get_json_inner(path, query).await;
        // Fixed minimum delay between every call.
        sleep(Duration::from_millis(REQUEST_DELAY_MS)).await;
        out
    }

    async fn get_json_inner(&self, path: &str, query: &[(&str, String)]) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url).header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(path, "api timeout");
                return None;
            }
            Err(e) => {
                warn!(path, error = %e, "api request failed");
                return None;
            }
        };

        // Quota hint arrives on every response, including error statuses.
        if let Some(remaining) = resp
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            if let Some(pause) = quota_pause(remaining) {
                warn!(remaining, pause_secs = pause.as_secs(), "rate limit low; pausing");
                sleep(pause).await;
            }
        }

        let status = resp.status();
        if status.as_u16() == 404 {
            // Absence, not an error.
            return None;
        }
        if !status.is_success() {
            warn!(path, status = %status, "api error");
            return None;
        }
        match resp.json::<Value>().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path, error = %e, "api returned invalid body");
                None
            }
        }
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_from_any<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(de)?;
    Ok(value_to_string(&v).unwrap_or_default())
}

fn opt_string_from_any<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(de)?;
    Ok(value_to_string(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_pause_thresholds() {
        assert_eq!(quota_pause(0), Some(Duration::from_secs(5)));
        assert_eq!(quota_pause(4), Some(Duration::from_secs(5)));
        assert_eq!(quota_pause(5), Some(Duration::from_secs(2)));
        assert_eq!(quota_pause(19), Some(Duration::from_secs(2)));
        assert_eq!(quota_pause(20), None);
        assert_eq!(quota_pause(1000), None);
    }

    #[test]
    fn rounds_decode_from_count_or_list() {
        let d: TournamentDetails =
            serde_json::from_value(json!({"phases": [{"rounds": 4}, {"rounds": [{}, {}, {}]}]}))
                .unwrap();
        assert_eq!(d.phases[0].rounds.count(), 4);
        assert_eq!(d.phases[1].rounds.count(), 3);
    }

    #[test]
    fn summary_accepts_numeric_ids() {
        let t: TournamentSummary = serde_json::from_value(json!({
            "id": 123456,
            "name": "BT21 Weekly",
            "date": "2026-01-10T18:00:00Z",
            "players": 12,
            "organizerId": 452
        }))
        .unwrap();
        assert_eq!(t.id, "123456");
        assert_eq!(t.organizer_id.as_deref(), Some("452"));
        assert_eq!(t.event_date(), NaiveDate::from_ymd_opt(2026, 1, 10));
    }

    #[test]
    fn pairing_winner_normalizes_sentinels() {
        let p: Pairing =
            serde_json::from_value(json!({"round": 2, "player1": "a", "player2": "b", "winner": 0}))
                .unwrap();
        assert_eq!(p.winner, "0");
        let p: Pairing =
            serde_json::from_value(json!({"round": 2, "player1": "a", "player2": ""})).unwrap();
        assert_eq!(p.winner, "");
        assert!(p.player2.is_empty());
    }

    #[test]
    fn event_date_rejects_garbage() {
        assert_eq!(parse_event_date(""), None);
        assert_eq!(parse_event_date("not-a-date"), None);
        assert_eq!(
            parse_event_date("2025-10-01"),
            NaiveDate::from_ymd_opt(2025, 10, 1)
        );
    }
}
