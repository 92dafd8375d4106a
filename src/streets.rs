//! Street and name normalization for customer matching.
//!
//! Applied symmetrically to the master list at load time and to request
//! input at query time, so "Hauptstr." and "Hauptstraße" compare equal.

use regex::Regex;
use std::sync::LazyLock;

/// Trailing street-type variants collapsed to "strasse". The bare "st"
/// form is only accepted with its dot; plain "...st" endings are part of
/// the name.
static STREET_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(strasse|strsse|strase|strse|str\.?|st\.|street)\s*$").expect("valid regex")
});

static TRAILING_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)[\s,]+(\d+\s*[a-zA-Z]?(?:\s*[-/,]\s*\d+\s*[a-zA-Z]?)*)\s*$")
        .expect("valid regex")
});

/// Lowercase and fold German letters for comparison (`ä`→`ae`, `ö`→`oe`,
/// `ü`→`ue`, `ß`→`ss`). Storage keeps the original spelling.
pub fn fold_german(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.to_lowercase().chars() {
        match c {
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ü' => out.push_str("ue"),
            'ß' => out.push_str("ss"),
            _ => out.push(c),
        }
    }
    out
}

/// Canonical comparison form of a street name: folded, suffix collapsed
/// to "strasse", punctuation and whitespace stripped.
pub fn normalize_street(street: &str) -> String {
    let folded = fold_german(street.trim());
    let collapsed = STREET_SUFFIX_RE.replace(&folded, "strasse");
    collapsed
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Fuzzy equality over normalized street forms. Levenshtein similarity
/// must reach 0.9; degenerate short forms must match exactly.
pub fn streets_match(a: &str, b: &str) -> bool {
    let a = normalize_street(a);
    let b = normalize_street(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.len() < 3 && b.len() < 3 {
        return a == b;
    }
    let max_len = a.chars().count().max(b.chars().count());
    let dist = strsim::levenshtein(&a, &b);
    (1.0 - dist as f64 / max_len as f64) >= 0.9
}

/// Word tokens of a personal name, folded, tokens shorter than 2 chars
/// dropped (initials carry no signal).
pub fn name_tokens(name: &str) -> Vec<String> {
    fold_german(name)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_string())
        .collect()
}

/// Any shared token counts as a name match ("Anna Müller" vs "Mueller").
pub fn names_match(a: &str, b: &str) -> bool {
    let left = name_tokens(a);
    if left.is_empty() {
        return false;
    }
    name_tokens(b).iter().any(|t| left.contains(t))
}

/// Master-list rows sometimes carry the house number at the end of the
/// street field. Returns `(street, house_number)` with the number moved
/// over when the dedicated field is empty; numeric residue is stripped
/// from the street either way.
pub fn extract_house_number(street: &str, house_number: &str) -> (String, String) {
    let number = house_number.trim();
    if !number.is_empty() {
        let cleaned: String = street
            .chars()
            .filter(|c| !c.is_ascii_digit())
            .collect::<String>()
            .trim()
            .trim_end_matches([',', '.'])
            .to_string();
        return (cleaned, number.to_string());
    }
    if let Some(caps) = TRAILING_NUMBER_RE.captures(street.trim()) {
        let stem = caps[1].trim().trim_end_matches(',').to_string();
        let num = caps[2].split_whitespace().collect::<Vec<_>>().join("");
        if !stem.is_empty() {
            return (stem, num);
        }
    }
    (street.trim().to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_variants_collapse() {
        for v in [
            "Hauptstraße",
            "Hauptstrasse",
            "Hauptstr",
            "Hauptstr.",
            "Hauptstrse",
            "Hauptstrase",
            "Hauptstrsse",
            "Hauptstreet",
            "Hauptst.",
        ] {
            assert_eq!(normalize_street(v), "hauptstrasse", "variant {v}");
        }
    }

    #[test]
    fn bare_st_ending_is_not_a_suffix() {
        // only "st." with dot is a street-type abbreviation
        assert_eq!(normalize_street("Forst"), "forst");
        assert_eq!(normalize_street("Forst."), "forstrasse");
    }

    #[test]
    fn umlauts_fold_for_comparison() {
        assert_eq!(normalize_street("Kölner Straße"), "koelnerstrasse");
        assert!(streets_match("Kölner Straße", "Koelner Str."));
    }

    #[test]
    fn fuzzy_street_tolerates_typo() {
        assert!(streets_match("Schnellweider Straße", "Schnelweider Str."));
        assert!(!streets_match("Hauptstraße", "Bahnhofstraße"));
    }

    #[test]
    fn short_streets_require_exact() {
        assert!(streets_match("Au", "Au"));
        assert!(!streets_match("Au", "Ao"));
    }

    #[test]
    fn name_overlap_across_spellings() {
        assert!(names_match("Anna Müller", "Mueller"));
        assert!(names_match("Familie Weiß", "weiss"));
        assert!(!names_match("Anna Müller", "Schmidt"));
        // single-letter initials carry no signal
        assert!(!names_match("A M", "Anna Müller"));
    }

    #[test]
    fn trailing_number_moves_over() {
        assert_eq!(
            extract_house_number("Hauptstraße 12", ""),
            ("Hauptstraße".to_string(), "12".to_string())
        );
        assert_eq!(
            extract_house_number("Hauptstraße 12a", ""),
            ("Hauptstraße".to_string(), "12a".to_string())
        );
        assert_eq!(
            extract_house_number("Hauptstraße 1-3", ""),
            ("Hauptstraße".to_string(), "1-3".to_string())
        );
    }

    #[test]
    fn residue_stripped_when_number_present() {
        assert_eq!(
            extract_house_number("Hauptstraße 12", "12"),
            ("Hauptstraße".to_string(), "12".to_string())
        );
    }

    #[test]
    fn no_number_anywhere() {
        assert_eq!(
            extract_house_number("Hauptstraße", ""),
            ("Hauptstraße".to_string(), String::new())
        );
    }
}
