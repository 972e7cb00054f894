//! Entity resolution: external usernames and deck codes to local rows.

use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;

use crate::db::Db;
use crate::limitless::DeckRef;

/// Deck code the platform uses for its catch-all bucket. Never gets a
/// mapping row or a curation request.
pub const CATCH_ALL_DECK_CODE: &str = "other";

/// Resolves external player/deck identifiers to local surrogate rows.
///
/// Owns the in-memory caches, preloaded from the store at the start of each
/// tournament's processing. Single-owner: concurrent runs against the same
/// store must not be attempted.
pub struct Resolver {
    players: HashMap<String, i64>,
    decks: HashMap<String, Option<i64>>,
    unknown_archetype_id: i64,
    players_created: usize,
    requests_created: usize,
}

impl Resolver {
    pub async fn preload(db: &Db, unknown_archetype_id: i64) -> Result<Self> {
        let mut players = HashMap::new();
        let rows = sqlx::query(
            "SELECT external_username, player_id FROM players WHERE external_username IS NOT NULL",
        )
        .fetch_all(&db.pool)
        .await?;
        for row in rows {
            players.insert(
                row.get::<String, _>("external_username"),
                row.get::<i64, _>("player_id"),
            );
        }

        let mut decks = HashMap::new();
        let rows = sqlx::query("SELECT deck_code, archetype_id FROM deck_map")
            .fetch_all(&db.pool)
            .await?;
        for row in rows {
            decks.insert(
                row.get::<String, _>("deck_code"),
                row.get::<Option<i64>, _>("archetype_id"),
            );
        }

        Ok(Self {
            players,
            decks,
            unknown_archetype_id,
            players_created: 0,
            requests_created: 0,
        })
    }

    /// Cache-only lookup; pairings rely on standings having resolved every
    /// player beforehand.
    pub fn player_id(&self, username: &str) -> Option<i64> {
        self.players.get(username).copied()
    }

    pub fn players_created(&self) -> usize {
        self.players_created
    }

    pub fn requests_created(&self) -> usize {
        self.requests_created
    }

    /// Find or create a player by platform username.
    pub async fn resolve_player(
        &mut self,
        db: &Db,
        username: &str,
        display_name: &str,
    ) -> Result<i64> {
        if let Some(&id) = self.players.get(username) {
            return Ok(id);
        }

        if let Some(row) = sqlx::query("SELECT player_id FROM players WHERE external_username = $1")
            .bind(username)
            .fetch_optional(&db.pool)
            .await?
        {
            let id: i64 = row.get("player_id");
            self.players.insert(username.to_string(), id);
            return Ok(id);
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO players (display_name, external_username, is_active)
             VALUES ($1, $2, TRUE) RETURNING player_id",
        )
        .bind(display_name)
        .bind(username)
        .fetch_one(&db.pool)
        .await?;
        debug!(username, player_id = id, "created player");
        self.players.insert(username.to_string(), id);
        self.players_created += 1;
        Ok(id)
    }

    /// Map an external deck to a local archetype. First sighting of an
    /// unmapped code inserts a null mapping plus a curation request; the
    /// cache and a lookup-before-insert keep that to one row per code per
    /// run. Returns (archetype_id, pending_request_id).
    pub async fn resolve_deck(
        &mut self,
        db: &Db,
        deck: Option<&DeckRef>,
    ) -> Result<(Option<i64>, Option<i64>)> {
        let Some(deck) = deck else {
            return Ok((None, None));
        };
        let Some(code) = deck.id.as_deref().filter(|c| !c.is_empty()) else {
            return Ok((None, None));
        };

        if code == CATCH_ALL_DECK_CODE {
            return Ok((Some(self.unknown_archetype_id), None));
        }

        if let Some(&archetype) = self.decks.get(code) {
            // May be None while curation is pending.
            return Ok((archetype, None));
        }

        if let Some(row) = sqlx::query("SELECT archetype_id FROM deck_map WHERE deck_code = $1")
            .bind(code)
            .fetch_optional(&db.pool)
            .await?
        {
            let archetype: Option<i64> = row.get("archetype_id");
            self.decks.insert(code.to_string(), archetype);
            return Ok((archetype, None));
        }

        let deck_name = deck.name.as_deref().unwrap_or("Unknown");
        sqlx::query(
            "INSERT INTO deck_map (deck_code, deck_name, archetype_id, created_at)
             VALUES ($1, $2, NULL, now())",
        )
        .bind(code)
        .bind(deck_name)
        .execute(&db.pool)
        .await?;

        let request_id: i64 = sqlx::query_scalar(
            "INSERT INTO deck_requests (deck_code, deck_name, primary_color, status, submitted_at)
             VALUES ($1, $2, 'Unknown', 'pending', now()) RETURNING request_id",
        )
        .bind(code)
        .bind(deck_name)
        .fetch_one(&db.pool)
        .await?;
        debug!(deck_code = code, request_id, "created deck mapping + curation request");

        self.decks.insert(code.to_string(), None);
        self.requests_created += 1;
        Ok((None, Some(request_id)))
    }

    /// Record an ingestion-time classification so later standings in the same
    /// run see the mapping without a store round-trip.
    pub fn note_deck_archetype(&mut self, code: &str, archetype_id: i64) {
        self.decks.insert(code.to_string(), Some(archetype_id));
    }
}
