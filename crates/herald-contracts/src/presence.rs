use serde_json::{Map, Value};

pub const UNKNOWN_RULER: &str = "Unknown Ruler";
pub const UNKNOWN_REALM: &str = "Unknown Realm";
pub const UNKNOWN_YEAR: &str = "Unknown Year";
pub const DEFAULT_RANK: &str = "Ruler";

/// Known rank tokens. Matched longest-token-first so that e.g.
/// "High Chieftain" is tested before "Chieftain".
const RANK_CATALOG: [&str; 21] = [
    "Melekh Ha'Melakhim",
    "High Chieftain",
    "Emperor",
    "Basileus",
    "Maharaja",
    "Melekh",
    "Sultan",
    "Sheikh",
    "Despot",
    "Chieftain",
    "Count",
    "Duke",
    "King",
    "Jarl",
    "Shah",
    "Doux",
    "Emir",
    "Raja",
    "Nasi",
    "Rozen",
    "Gaon",
];

pub fn rank_catalog() -> Vec<&'static str> {
    let mut ranks = RANK_CATALOG.to_vec();
    ranks.sort_by_key(|rank| std::cmp::Reverse(rank.len()));
    ranks
}

/// Raw rich-presence fields as reported by the platform.
///
/// The key set is platform- and game-defined and varies between protocol
/// versions, so this stays a permissive mapping with named accessors and
/// defined fallbacks rather than a fixed-schema record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RichPresence {
    fields: Map<String, Value>,
}

impl RichPresence {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn character(&self) -> Option<&str> {
        self.get("character")
    }

    pub fn flavor(&self) -> &str {
        self.get("flavor").unwrap_or_default()
    }

    pub fn activity(&self) -> Option<&str> {
        self.get("activity")
    }

    pub fn year(&self) -> String {
        self.get("Year")
            .or_else(|| self.get("year"))
            .or_else(|| self.get("param_year"))
            .unwrap_or(UNKNOWN_YEAR)
            .to_string()
    }
}

/// Structured status fields derived from one presence payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSnapshot {
    pub rank: String,
    pub actual_name: String,
    pub realm: String,
    pub year: String,
    pub raw_activity: String,
}

/// Parses a raw presence payload into structured fields. Pure and
/// deterministic for identical input.
pub fn translate(presence: &RichPresence) -> PresenceSnapshot {
    let ranks = rank_catalog();
    let (rank, name_segment, raw_activity) = if let Some(character) = presence.character() {
        let (rank, name) = split_rank_anchored(character, &ranks);
        let flavor = presence.flavor();
        let raw = if flavor.is_empty() {
            character.to_string()
        } else {
            format!("{flavor} {character}")
        };
        (rank, name, raw)
    } else if let Some(activity) = presence.activity() {
        let (rank, name) = split_rank_scanning(activity, &ranks);
        (rank, name, activity.to_string())
    } else {
        (
            DEFAULT_RANK.to_string(),
            UNKNOWN_RULER.to_string(),
            UNKNOWN_RULER.to_string(),
        )
    };

    let (actual_name, realm) = match name_segment.split_once(" of ") {
        Some((name, realm)) => (name.to_string(), realm.to_string()),
        None => (name_segment, UNKNOWN_REALM.to_string()),
    };

    PresenceSnapshot {
        rank,
        actual_name,
        realm,
        year: presence.year(),
        raw_activity,
    }
}

/// The character field starts with the rank token, e.g.
/// "Count Mordechai of Tmutarakan".
fn split_rank_anchored(character: &str, ranks: &[&str]) -> (String, String) {
    for rank in ranks {
        if let Some(rest) = character.strip_prefix(&format!("{rank} ")) {
            return (rank.to_string(), rest.to_string());
        }
    }
    (DEFAULT_RANK.to_string(), character.to_string())
}

/// The activity string carries a leading flavor segment, e.g.
/// "Ruling as Count Mordechai of Tmutarakan". The rank immediately
/// follows the flavor segment, so the earliest word-boundary catalog
/// token wins; a tie at one position goes to the longer token (the
/// catalog is sorted longest-first).
fn split_rank_scanning(activity: &str, ranks: &[&str]) -> (String, String) {
    for rank in ranks {
        if let Some(rest) = activity.strip_prefix(&format!("{rank} ")) {
            return (rank.to_string(), rest.to_string());
        }
    }

    let mut earliest: Option<(usize, &str)> = None;
    for rank in ranks {
        let embedded = format!(" {rank} ");
        if let Some(pos) = activity.find(&embedded) {
            if earliest.map_or(true, |(best, _)| pos < best) {
                earliest = Some((pos, rank));
            }
        }
    }
    if let Some((pos, rank)) = earliest {
        let rest = &activity[pos + rank.len() + 2..];
        return (rank.to_string(), rest.to_string());
    }
    (DEFAULT_RANK.to_string(), activity.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn presence(value: Value) -> RichPresence {
        RichPresence::from_map(value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn translates_character_field_with_realm() {
        let snapshot = translate(&presence(json!({
            "character": "Count Mordechai of Tmutarakan",
            "flavor": "Ruling as",
            "Year": "867",
        })));
        assert_eq!(snapshot.rank, "Count");
        assert_eq!(snapshot.actual_name, "Mordechai");
        assert_eq!(snapshot.realm, "Tmutarakan");
        assert_eq!(snapshot.year, "867");
        assert_eq!(snapshot.raw_activity, "Ruling as Count Mordechai of Tmutarakan");
    }

    #[test]
    fn translates_single_activity_field() {
        let snapshot = translate(&presence(json!({
            "activity": "Ruling as Count Mordechai of Tmutarakan",
        })));
        assert_eq!(snapshot.rank, "Count");
        assert_eq!(snapshot.actual_name, "Mordechai");
        assert_eq!(snapshot.realm, "Tmutarakan");
    }

    #[test]
    fn missing_realm_separator_yields_sentinel() {
        let snapshot = translate(&presence(json!({
            "character": "Jarl Toste",
        })));
        assert_eq!(snapshot.rank, "Jarl");
        assert_eq!(snapshot.actual_name, "Toste");
        assert_eq!(snapshot.realm, UNKNOWN_REALM);
        assert_eq!(snapshot.year, UNKNOWN_YEAR);
    }

    #[test]
    fn high_chieftain_does_not_match_bare_chieftain() {
        let snapshot = translate(&presence(json!({
            "activity": "Ruling as High Chieftain Toste of Uppland",
        })));
        assert_eq!(snapshot.rank, "High Chieftain");
        assert_eq!(snapshot.actual_name, "Toste");
        assert_eq!(snapshot.realm, "Uppland");
    }

    #[test]
    fn rank_nearest_the_flavor_segment_wins() {
        // "Chieftain" precedes "King" in the longest-first catalog, but
        // the rank right after the flavor segment is the one to split on.
        let snapshot = translate(&presence(json!({
            "activity": "Ruling as King Bob of Wessex after feasting with Chieftain Olaf",
        })));
        assert_eq!(snapshot.rank, "King");
        assert_eq!(snapshot.actual_name, "Bob");
    }

    #[test]
    fn unknown_rank_falls_back_to_ruler() {
        let snapshot = translate(&presence(json!({
            "character": "Mordechai of Tmutarakan",
        })));
        assert_eq!(snapshot.rank, DEFAULT_RANK);
        assert_eq!(snapshot.actual_name, "Mordechai");
        assert_eq!(snapshot.realm, "Tmutarakan");
    }

    #[test]
    fn year_falls_back_to_param_year() {
        let presence = presence(json!({
            "character": "King Bob of Wessex",
            "param_year": "1066",
        }));
        assert_eq!(presence.year(), "1066");
        assert_eq!(translate(&presence).year, "1066");

        let lowercase = self::presence(json!({ "year": "867" }));
        assert_eq!(lowercase.year(), "867");
    }

    #[test]
    fn empty_payload_uses_all_sentinels() {
        let snapshot = translate(&RichPresence::default());
        assert_eq!(snapshot.rank, DEFAULT_RANK);
        assert_eq!(snapshot.actual_name, UNKNOWN_RULER);
        assert_eq!(snapshot.realm, UNKNOWN_REALM);
        assert_eq!(snapshot.year, UNKNOWN_YEAR);
    }

    #[test]
    fn translation_is_deterministic() {
        let payload = presence(json!({
            "activity": "Ruling as King Bob of Wessex",
            "Year": "1066",
        }));
        assert_eq!(translate(&payload), translate(&payload));
    }
}
