//! Item name normalization.
//!
//! Scraped names carry decorations that change between sightings of the same
//! item (refine level, rarity tags, card suffixes, slot counts). Stripping
//! them gives a stable key for catalog lookups.

use regex::Regex;
use std::sync::OnceLock;

fn get_regex(re: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    re.get_or_init(|| Regex::new(pattern).expect("Invalid regex pattern defined in code"))
}

fn refine_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    get_regex(&RE, r"^\+\d+\s+")
}

fn rarity_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    get_regex(
        &RE,
        r"(?i)\[(RARE|UNIQUE|LEGENDARY|EPIC|COMMON|UNCOMMON)\]\s*",
    )
}

fn trailing_paren() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    get_regex(&RE, r"\s*\([^)]*\)\s*$")
}

fn trailing_slots() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    get_regex(&RE, r"\s*\[\d+\]\s*$")
}

/// Strips volatile decorations from a scraped item name.
///
/// Runs the strip passes until nothing changes, so decorations in any order
/// (`"Sword (Fire) [2]"`, `"Sword [2] (Fire)"`) end up at the same fixpoint and
/// `normalize(normalize(x)) == normalize(x)` holds.
#[must_use]
pub fn normalize(name: &str) -> String {
    let mut current = name.trim().to_string();

    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(name: &str) -> String {
    let name = refine_prefix().replace(name, "");
    let name = rarity_tag().replace_all(&name, "");
    let name = trailing_paren().replace(&name, "");
    let name = trailing_slots().replace(&name, "");
    name.trim().to_string()
}
