//! Deck archetype classification.
//!
//! A decklist is reduced to a lowercase text blob and run through an ordered
//! rule table. The first rule (in table order) whose signature-card match
//! count reaches its minimum wins; table order is the priority contract, so a
//! narrow archetype's rule must precede the broader one it overlaps with.

use anyhow::Result;
use itertools::Itertools;
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::db::{Db, UNKNOWN_ARCHETYPE};

pub struct Rule {
    pub archetype: &'static str,
    pub signatures: &'static [&'static str],
    pub min_matches: usize,
}

const fn rule(
    archetype: &'static str,
    signatures: &'static [&'static str],
    min_matches: usize,
) -> Rule {
    Rule {
        archetype,
        signatures,
        min_matches,
    }
}

/// Ordered rule table. Order matters: more specific archetypes first, so a
/// deck that satisfies an early rule never falls through to a broader one.
pub const CLASSIFICATION_RULES: &[Rule] = &[
    rule("Blastmon", &["Blastmon", "Sunarizamon", "Landramon", "Proganomon"], 3),
    rule("Millenniummon", &["Millenniummon", "Machinedramon", "Kimeramon"], 3),
    rule("Magnamon Armors", &["Magnamon", "Veemon", "Flamedramon"], 3),
    rule("Magnamon Armors", &["Magnamon", "Veemon", "Shadramon"], 3),
    rule("Myotismon Loop", &["MaloMyotismon", "Myotismon", "Arukenimon", "Mummymon"], 3),
    rule("Medusamon", &["Medusamon", "Lamiamon", "Elizamon"], 3),
    rule("Medusamon", &["Medusamon", "Lamiamon", "Dimetromon"], 3),
    rule("Insectoids", &["TigerVespamon", "CannonBeemon", "FunBeemon"], 3),
    rule("Insectoids", &["TigerVespamon", "Waspmon", "FunBeemon"], 3),
    rule("Gigaseadramon", &["GigaSeadramon", "MegaSeadramon", "Seadramon"], 3),
    rule("Gigaseadramon", &["MetalSeadramon", "MegaSeadramon", "Seadramon"], 3),
    rule("Shakkoumon", &["Shakkoumon", "Angemon", "Patamon"], 2),
    rule("Shakkoumon", &["Shakkoumon", "Ankylomon"], 2),
    rule("Galaxy", &["Vademon", "MetalMamemon", "Vegiemon"], 3),
    rule("Fenriloggamon", &["Fenriloogamon", "Cerberusmon", "Kazuchimon"], 2),
    rule("Fenriloggamon", &["Fenriloogamon: Takemikazuchi"], 1),
    rule("Xros Heart", &["OmniShoutmon", "Shoutmon"], 2),
    rule("Creepymon", &["Creepymon", "SkullSatamon"], 2),
    rule("Beelzemon", &["Beelzemon", "Impmon"], 2),
    rule("Beelzemon", &["Beelzemon: Blast Mode"], 1),
    rule("Gallantmon", &["Gallantmon", "Guilmon", "Growlmon"], 3),
    rule("Eaters", &["Eater", "EDEN's Javelin"], 1),
    rule("Imperialdramon (UG)", &["Imperialdramon", "Paildramon", "ExVeemon"], 3),
    rule("Imperialdramon (PR)", &["Imperialdramon", "Stingmon", "Wormmon"], 3),
    rule("Jesmon", &["Jesmon", "Sistermon", "Huckmon"], 2),
    rule("Mastemon (Tribal)", &["Mastemon", "Angewomon", "LadyDevimon"], 2),
    rule("Blue Flare", &["MetalGreymon", "MailBirdramon", "Greymon"], 3),
    rule("Leviamon", &["Leviamon", "Gesomon", "Syakomon"], 2),
    rule("Lucemon", &["Lucemon", "Lucemon: Chaos Mode", "Lucemon: Shadowlord Mode"], 2),
    rule("CS Alphamon", &["Alphamon", "Dorumon", "DexDorugoramon"], 2),
    rule("UlforceVeedramon", &["UlforceVeedramon", "AeroVeedramon"], 2),
    rule("MagnaGarurumon", &["MagnaGarurumon", "Lobomon", "KendoGarurumon"], 2),
    rule("Wargreymon OTK", &["WarGreymon", "MetalGreymon", "Greymon", "Agumon"], 4),
    rule("Diaboromon", &["Diaboromon", "Infermon", "Keramon"], 2),
    rule("Royal Knights", &["Omnimon", "WarGreymon", "MetalGarurumon"], 3),
    rule("Numemon", &["Numemon", "PlatinumNumemon", "Monzaemon"], 2),
    rule("Rosemon", &["Rosemon", "Lilamon", "Palmon"], 2),
    rule("Miragegaogamon", &["MirageGaogamon", "Gaogamon", "Gaomon"], 2),
    rule("Shinegreymon", &["ShineGreymon", "RizeGreymon", "GeoGreymon"], 2),
    rule("Belphemon", &["Belphemon", "Astamon"], 2),
    rule("Bloomlordmon", &["Bloomlordmon", "Lotosmon", "Rafflesimon"], 2),
    rule("Sakuyamon", &["Sakuyamon", "Taomon", "Renamon"], 2),
    rule("Ravemon", &["Ravemon", "Crowmon", "Falcomon"], 2),
    rule("D-Brigade", &["Darkdramon", "Commandramon", "Sealsdramon"], 2),
    rule("Bagra Army", &["Bagramon", "DarkKnightmon"], 2),
    rule("Hunters", &["Arresterdramon", "Gumdramon"], 2),
    rule("Justimon", &["Justimon", "Cyberdramon"], 2),
    rule("Leopardmon", &["Leopardmon", "LoaderLiomon"], 2),
    rule("LordKnightmon", &["LordKnightmon", "Knightmon"], 2),
    rule("Examon", &["Examon", "Breakdramon", "Slayerdramon"], 2),
    rule("Kentaurosmon", &["Kentaurosmon", "Sleipmon"], 1),
    rule("Hudiemon", &["Hudiemon", "Wormmon"], 2),
    rule("Gammamon", &["Gammamon", "BetelGammamon", "Canoweissmon"], 2),
    rule("Chronicle", &["Chronomon", "Valdurmon"], 1),
    rule("Jellymon", &["Jellymon", "TeslaJellymon"], 2),
    rule("Angoramon", &["Angoramon", "SymbareAngoramon"], 2),
    rule("Phoenixmon", &["Phoenixmon", "Garudamon", "Birdramon", "Biyomon"], 3),
    rule("TyrantKabuterimon", &["TyrantKabuterimon", "MegaKabuterimon", "Kabuterimon", "Tentomon"], 3),
    rule("Machinedramon", &["Machinedramon", "MetalTyrannomon", "Megadramon"], 3),
    rule("Machinedramon", &["Machinedramon", "Andromon", "Megadramon"], 3),
    rule("Gabu Bond", &["Gabumon", "Garurumon", "WereGarurumon", "MetalGarurumon"], 4),
    rule("Agu Bond", &["Agumon - Bond of Bravery", "WarGreymon"], 2),
    rule("GAS (Garuru Alter-S)", &["Alter-S", "CresGarurumon"], 1),
    rule("Silphymon", &["Silphymon", "Aquilamon", "Gatomon"], 2),
    rule("Cherubimon", &["Cherubimon", "Antylamon", "Lopmon"], 2),
    rule("Megidramon", &["Megidramon", "WarGrowlmon", "Guilmon"], 3),
    rule("Olympus XII", &["Jupitermon", "Junomon", "Apollomon"], 2),
    rule("Olympus XII", &["Neptunemon", "Mercurymon"], 2),
    rule("TS Titans", &["Titamon", "Ogremon", "Goblimon"], 3),
    rule("TS Titans", &["Titamon", "SkullBaluchimon"], 2),
    rule("Ghosts", &["DanDevimon", "Phantomon", "Ghostmon"], 2),
    rule("Ghosts", &["NeoDevimon", "Phantomon", "DemiDevimon"], 3),
    rule("Seven Great Demon Lords", &["Daemon", "Barbamon", "Lilithmon", "Leviamon"], 2),
    rule("Lilithmon", &["Lilithmon", "LadyDevimon", "BlackGatomon"], 2),
    rule("Three Musketeers", &["Beelstarmon", "GrandisKuwagamon", "Minervamon"], 2),
    rule("Red Hybrid", &["EmperorGreymon", "Aldamon", "BurningGreymon"], 2),
    rule("Red Hybrid", &["Aldamon", "Agunimon", "Flamemon"], 2),
    rule("Blue Hybrid", &["MagnaGarurumon", "KendoGarurumon", "Lobomon"], 2),
    rule("Deep Savers", &["Plesiomon", "MarineAngemon", "Gomamon"], 2),
    rule("Deep Savers", &["Sangomon", "Shellmon", "MarineBullmon"], 2),
    rule("Nightmare Soldiers", &["Wizardmon", "Candlemon", "Witchmon"], 2),
];

/// Card categories the decklist payload may carry.
const DECK_CATEGORIES: &[&str] = &["digimon", "tamer", "option", "digi-egg", "egg"];

/// Flatten a decklist payload into a lowercase text blob.
///
/// Names are repeated by copy count; the presence test in `classify_text`
/// does not weight repeats.
pub fn card_text(decklist: &Value) -> String {
    let mut names: Vec<&str> = Vec::new();
    for category in DECK_CATEGORIES {
        let Some(cards) = decklist.get(category).and_then(|v| v.as_array()) else {
            continue;
        };
        for card in cards {
            let name = card.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                continue;
            }
            let count = card.get("count").and_then(|v| v.as_i64()).unwrap_or(1).max(1);
            for _ in 0..count {
                names.push(name);
            }
        }
    }
    names.join(" ").to_lowercase()
}

/// Classify a decklist payload. Returns the archetype name, or None when no
/// rule reaches its threshold.
pub fn classify(decklist: &Value) -> Option<&'static str> {
    let text = card_text(decklist);
    if text.is_empty() {
        return None;
    }
    classify_text(&text)
}

pub fn classify_text(text: &str) -> Option<&'static str> {
    for rule in CLASSIFICATION_RULES {
        let matches = rule
            .signatures
            .iter()
            .filter(|sig| text.contains(sig.to_lowercase().as_str()))
            .count();
        if matches >= rule.min_matches {
            return Some(rule.archetype);
        }
    }
    None
}

/// Monotonically assign an archetype to a pending deck mapping and resolve
/// its curation request. A mapping that already carries an archetype is left
/// untouched.
pub async fn assign_deck_archetype(db: &Db, deck_code: &str, archetype_id: i64) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE deck_map SET archetype_id = $1 WHERE deck_code = $2 AND archetype_id IS NULL",
    )
    .bind(archetype_id)
    .bind(deck_code)
    .execute(&db.pool)
    .await?
    .rows_affected();
    if updated > 0 {
        sqlx::query(
            "UPDATE deck_requests SET status = 'resolved' WHERE deck_code = $1 AND status = 'pending'",
        )
        .bind(deck_code)
        .execute(&db.pool)
        .await?;
    }
    Ok(updated > 0)
}

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub examined: usize,
    pub classified: usize,
    pub by_archetype: Vec<(String, usize)>,
}

/// Standalone backfill pass: classify stored results still parked on the
/// UNKNOWN archetype that carry a decklist payload.
pub async fn backfill_unknown(db: &Db, dry_run: bool) -> Result<BackfillSummary> {
    let catalog = db.archetype_catalog().await?;

    let rows = sqlx::query(
        "SELECT r.result_id, r.decklist
         FROM results r
         JOIN archetypes a ON r.archetype_id = a.archetype_id
         WHERE a.archetype_name = $1 AND r.decklist IS NOT NULL",
    )
    .bind(UNKNOWN_ARCHETYPE)
    .fetch_all(&db.pool)
    .await?;

    let examined = rows.len();
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut updates: Vec<(i64, i64)> = Vec::new();

    for row in &rows {
        let result_id: i64 = row.get("result_id");
        let decklist: Value = row.get("decklist");
        let Some(name) = classify(&decklist) else {
            continue;
        };
        let Some(&archetype_id) = catalog.get(name) else {
            warn!(archetype = name, "classified archetype missing from catalog");
            continue;
        };
        *counts.entry(name).or_default() += 1;
        updates.push((archetype_id, result_id));
    }

    if !dry_run {
        for (archetype_id, result_id) in &updates {
            sqlx::query("UPDATE results SET archetype_id = $1, updated_at = now() WHERE result_id = $2")
                .bind(archetype_id)
                .bind(result_id)
                .execute(&db.pool)
                .await?;
        }
    }

    let by_archetype: Vec<(String, usize)> = counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
        .map(|(name, n)| (name.to_string(), n))
        .collect();

    info!(
        examined,
        classified = updates.len(),
        dry_run,
        "classification backfill finished"
    );

    Ok(BackfillSummary {
        examined,
        classified: updates.len(),
        by_archetype,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decklist(cards: &[(&str, i64)]) -> Value {
        json!({
            "digimon": cards
                .iter()
                .map(|(name, count)| json!({"name": name, "count": count}))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn earlier_rule_wins_over_later_superset() {
        // Satisfies Millenniummon (min 3) and the later standalone
        // Machinedramon rule (min 3); table order decides.
        let deck = decklist(&[
            ("Millenniummon", 2),
            ("Machinedramon", 4),
            ("Kimeramon", 4),
            ("MetalTyrannomon", 4),
            ("Megadramon", 4),
        ]);
        assert_eq!(classify(&deck), Some("Millenniummon"));
    }

    #[test]
    fn earlier_four_card_rule_beats_royal_knights() {
        let deck = decklist(&[
            ("WarGreymon", 4),
            ("MetalGreymon", 4),
            ("Greymon", 4),
            ("Agumon", 4),
            ("Omnimon", 2),
            ("MetalGarurumon", 2),
        ]);
        assert_eq!(classify(&deck), Some("Wargreymon OTK"));
    }

    #[test]
    fn below_threshold_does_not_classify() {
        // Two of Blastmon's four signatures; rule needs three.
        let deck = decklist(&[("Blastmon", 4), ("Sunarizamon", 4)]);
        assert_eq!(classify(&deck), None);
    }

    #[test]
    fn copy_count_does_not_change_outcome() {
        let one_of_each = decklist(&[("Jesmon", 1), ("Sistermon Blanc", 1)]);
        let playsets = decklist(&[("Jesmon", 4), ("Sistermon Blanc", 4)]);
        assert_eq!(classify(&one_of_each), Some("Jesmon"));
        assert_eq!(classify(&playsets), Some("Jesmon"));
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        // "kentaurosmon" appears inside a longer printed name.
        let deck = decklist(&[("KENTAUROSMON (X ANTIBODY)", 2)]);
        assert_eq!(classify(&deck), Some("Kentaurosmon"));
    }

    #[test]
    fn egg_category_counts_toward_matches() {
        let deck = json!({
            "digimon": [{"name": "Gammamon", "count": 4}],
            "digi-egg": [{"name": "BetelGammamon", "count": 4}]
        });
        assert_eq!(classify(&deck), Some("Gammamon"));
    }

    #[test]
    fn empty_decklist_is_unclassified() {
        assert_eq!(classify(&json!({})), None);
        assert_eq!(classify(&json!({"digimon": []})), None);
    }
}
