//! Historical matching overlay.
//!
//! Joins a fresh nameplate scan against the customer master list and the
//! most recent dataset for the address: confirms existing customers,
//! flags list-vs-history conflicts, carries prospect statuses forward and
//! detects the one-to-one tenant swap.

use crate::models::customer::Customer;
use crate::models::dataset::AddressDataset;
use crate::models::overlay::{MatchKind, NameMatch, OverlayResult};
use crate::models::resident::{Resident, ResidentCategory, ResidentStatus};
use crate::streets::{fold_german, name_tokens, names_match};

/// Historical entry after surname cleaning.
#[derive(Debug, Clone)]
struct HistoricalEntry {
    name: String,
    status: Option<ResidentStatus>,
}

fn surname(name: &str) -> String {
    name_tokens(name)
        .into_iter()
        .next_back()
        .unwrap_or_else(|| fold_german(name.trim()))
}

/// Original-case last word, for collapsed display names.
fn surname_display(name: &str) -> String {
    name.trim()
        .split_whitespace()
        .next_back()
        .unwrap_or(name.trim())
        .to_string()
}

/// Split a dataset's residents into existing/prospect buckets and clean
/// them: a surname present in both buckets is contradictory and dropped
/// entirely; duplicates within one bucket collapse to the bare surname.
fn cleaned_buckets(ds: &AddressDataset) -> (Vec<HistoricalEntry>, Vec<HistoricalEntry>) {
    let mut existing: Vec<&Resident> = Vec::new();
    let mut prospects: Vec<&Resident> = Vec::new();
    for resident in ds.fixed_customers.iter().chain(&ds.editable_residents) {
        match resident.category {
            ResidentCategory::ExistingCustomer => existing.push(resident),
            ResidentCategory::PotentialNewCustomer => prospects.push(resident),
            ResidentCategory::ClarificationNeeded => {}
        }
    }

    let existing_surnames: std::collections::HashSet<String> =
        existing.iter().map(|r| surname(&r.name)).collect();
    let prospect_surnames: std::collections::HashSet<String> =
        prospects.iter().map(|r| surname(&r.name)).collect();

    let clean = |bucket: Vec<&Resident>, other: &std::collections::HashSet<String>| {
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for r in &bucket {
            *seen.entry(surname(&r.name)).or_default() += 1;
        }
        let mut out: Vec<HistoricalEntry> = Vec::new();
        let mut collapsed: std::collections::HashSet<String> = std::collections::HashSet::new();
        for r in bucket {
            let key = surname(&r.name);
            if other.contains(&key) {
                continue; // contradictory surname
            }
            if seen[&key] > 1 {
                if collapsed.insert(key) {
                    out.push(HistoricalEntry {
                        name: surname_display(&r.name),
                        status: None,
                    });
                }
            } else {
                out.push(HistoricalEntry {
                    name: r.name.clone(),
                    status: r.status,
                });
            }
        }
        out
    };

    (
        clean(existing, &prospect_surnames),
        clean(prospects, &existing_surnames),
    )
}

/// Classify each scanned name and run previous-tenant detection.
pub fn compute_overlay(
    scanned: &[String],
    current: &[Customer],
    historical: Option<&AddressDataset>,
) -> OverlayResult {
    let Some(ds) = historical else {
        return OverlayResult {
            matches: scanned
                .iter()
                .map(|name| NameMatch {
                    name: name.clone(),
                    kind: MatchKind::NoHistoricalData,
                    historical_status: None,
                    previous_tenant: None,
                    moved_in_after: None,
                })
                .collect(),
            winback_candidates: Vec::new(),
            historical_dataset_id: None,
        };
    };

    let (existing, prospects) = cleaned_buckets(ds);
    let in_current = |name: &str| current.iter().any(|c| names_match(&c.name, name));

    let mut matches: Vec<NameMatch> = scanned
        .iter()
        .map(|name| {
            let hist_existing = existing.iter().any(|e| names_match(&e.name, name));
            let hist_prospect = prospects.iter().find(|e| names_match(&e.name, name));
            let kind = match (in_current(name), hist_existing, hist_prospect.is_some()) {
                (true, true, _) => MatchKind::ConfirmedExisting,
                (true, false, true) => MatchKind::ListVsDatasetConflict,
                (false, true, _) => MatchKind::DatasetOnlyExisting,
                (false, false, true) => MatchKind::HistoricalProspect,
                _ => MatchKind::NoHistoricalData,
            };
            NameMatch {
                name: name.clone(),
                kind,
                historical_status: match kind {
                    MatchKind::HistoricalProspect => hist_prospect.and_then(|e| e.status),
                    _ => None,
                },
                previous_tenant: None,
                moved_in_after: None,
            }
        })
        .collect();

    // One-to-one tenant swap: exactly one name is new and exactly one
    // historical name is gone.
    let historical_names: Vec<&str> = existing
        .iter()
        .chain(&prospects)
        .map(|e| e.name.as_str())
        .collect();
    let new_only: Vec<usize> = scanned
        .iter()
        .enumerate()
        .filter(|(_, name)| !historical_names.iter().any(|h| names_match(h, name)))
        .map(|(i, _)| i)
        .collect();
    let gone: Vec<&str> = historical_names
        .iter()
        .filter(|h| !scanned.iter().any(|name| names_match(h, name)))
        .copied()
        .collect();
    if let ([idx], [old_name]) = (new_only.as_slice(), gone.as_slice()) {
        matches[*idx].previous_tenant = Some(old_name.to_string());
        matches[*idx].moved_in_after = Some(ds.created_at);
    }

    OverlayResult {
        matches,
        winback_candidates: winback_candidates(ds, current),
        historical_dataset_id: Some(ds.id.clone()),
    }
}

/// Historical existing customers that the current master list no longer
/// carries: prime re-acquisition targets.
pub fn winback_candidates(ds: &AddressDataset, current: &[Customer]) -> Vec<String> {
    let (existing, _) = cleaned_buckets(ds);
    existing
        .into_iter()
        .filter(|e| !current.iter().any(|c| names_match(&c.name, &e.name)))
        .map(|e| e.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::address::NormalizedAddress;

    fn resident(name: &str, category: ResidentCategory, status: Option<ResidentStatus>) -> Resident {
        Resident {
            name: name.to_string(),
            category,
            status,
            notes: None,
            floor: None,
            door: None,
            is_fixed: false,
        }
    }

    fn dataset(residents: Vec<Resident>) -> AddressDataset {
        AddressDataset {
            id: "1700000000000-abc123".to_string(),
            normalized_address: NormalizedAddress::unvalidated("Hauptstraße", "1", "50667", "Köln"),
            street: "Hauptstraße".to_string(),
            house_number: "1".to_string(),
            postal: "50667".to_string(),
            city: "Köln".to_string(),
            created_by: "damian".to_string(),
            created_at: Utc::now() - chrono::Duration::days(90),
            raw_resident_data: serde_json::Value::Null,
            editable_residents: residents,
            fixed_customers: Vec::new(),
        }
    }

    fn customer(name: &str) -> Customer {
        Customer {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            street: "Hauptstraße".to_string(),
            house_number: "1".to_string(),
            postal: "50667".to_string(),
            is_existing: true,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn previous_tenant_detected_one_to_one() {
        let ds = dataset(vec![
            resident("Müller", ResidentCategory::PotentialNewCustomer, None),
            resident("Schmidt", ResidentCategory::PotentialNewCustomer, None),
            resident("Weber", ResidentCategory::PotentialNewCustomer, None),
        ]);
        let result = compute_overlay(&names(&["Müller", "Schmidt", "Kaiser"]), &[], Some(&ds));

        let kaiser = result.matches.iter().find(|m| m.name == "Kaiser").unwrap();
        assert_eq!(kaiser.previous_tenant.as_deref(), Some("Weber"));
        assert_eq!(kaiser.moved_in_after, Some(ds.created_at));
        // the unchanged names carry no tenant tag
        assert!(result.matches[0].previous_tenant.is_none());
    }

    #[test]
    fn no_tenant_tag_when_two_names_changed() {
        let ds = dataset(vec![
            resident("Müller", ResidentCategory::PotentialNewCustomer, None),
            resident("Weber", ResidentCategory::PotentialNewCustomer, None),
        ]);
        let result = compute_overlay(&names(&["Kaiser", "Lehmann"]), &[], Some(&ds));
        assert!(result.matches.iter().all(|m| m.previous_tenant.is_none()));
    }

    #[test]
    fn classification_matrix() {
        let ds = dataset(vec![
            resident("Müller", ResidentCategory::ExistingCustomer, None),
            resident("Schmidt", ResidentCategory::PotentialNewCustomer, Some(ResidentStatus::NotReached)),
            resident("Weber", ResidentCategory::ExistingCustomer, None),
            resident(
                "Lehmann",
                ResidentCategory::PotentialNewCustomer,
                Some(ResidentStatus::Interested),
            ),
        ]);
        let current = vec![customer("Anna Müller"), customer("Jens Schmidt")];
        let result = compute_overlay(
            &names(&["Müller", "Schmidt", "Weber", "Lehmann", "Neuling"]),
            &current,
            Some(&ds),
        );

        let kind_of = |name: &str| {
            result
                .matches
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.kind)
                .unwrap()
        };
        assert_eq!(kind_of("Müller"), MatchKind::ConfirmedExisting);
        assert_eq!(kind_of("Schmidt"), MatchKind::ListVsDatasetConflict);
        assert_eq!(kind_of("Weber"), MatchKind::DatasetOnlyExisting);
        assert_eq!(kind_of("Lehmann"), MatchKind::HistoricalProspect);
        assert_eq!(kind_of("Neuling"), MatchKind::NoHistoricalData);

        let lehmann = result.matches.iter().find(|m| m.name == "Lehmann").unwrap();
        assert_eq!(lehmann.historical_status, Some(ResidentStatus::Interested));
    }

    #[test]
    fn contradictory_surname_is_dropped() {
        let ds = dataset(vec![
            resident("Karl Weber", ResidentCategory::ExistingCustomer, None),
            resident("Eva Weber", ResidentCategory::PotentialNewCustomer, None),
        ]);
        let result = compute_overlay(&names(&["Weber"]), &[], Some(&ds));
        assert_eq!(result.matches[0].kind, MatchKind::NoHistoricalData);
    }

    #[test]
    fn duplicate_surnames_collapse_within_bucket() {
        let ds = dataset(vec![
            resident("Karl Weber", ResidentCategory::ExistingCustomer, None),
            resident("Eva Weber", ResidentCategory::ExistingCustomer, None),
        ]);
        let (existing, _) = cleaned_buckets(&ds);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].name, "Weber");
    }

    #[test]
    fn missing_history_marks_everything() {
        let result = compute_overlay(&names(&["Müller"]), &[], None);
        assert_eq!(result.matches[0].kind, MatchKind::NoHistoricalData);
        assert!(result.historical_dataset_id.is_none());
    }

    #[test]
    fn winback_lists_vanished_existing_customers() {
        let ds = dataset(vec![
            resident("Müller", ResidentCategory::ExistingCustomer, None),
            resident("Weber", ResidentCategory::ExistingCustomer, None),
        ]);
        let current = vec![customer("Anna Müller")];
        assert_eq!(winback_candidates(&ds, &current), vec!["Weber".to_string()]);
    }
}
