//! "Did you mean?" fix hints

use forge_core::FixHint;
use strsim::levenshtein;

/// Maximum edit distance for a name to count as a near-miss.
const MAX_EDIT_DISTANCE: usize = 3;

/// Candidate sets smaller than this are listed in full.
const LIST_ALL_BELOW: usize = 10;

/// Build a fix hint for a failed lookup: the closest defined name when
/// one is within edit distance, plus the full candidate list when the
/// set is small.
pub fn fix_hint(missing: &str, candidates: &[String]) -> Option<FixHint> {
    let did_you_mean = closest(missing, candidates);
    let available = if candidates.len() < LIST_ALL_BELOW {
        candidates.to_vec()
    } else {
        Vec::new()
    };

    if did_you_mean.is_none() && available.is_empty() {
        return None;
    }
    Some(FixHint {
        did_you_mean,
        available,
    })
}

/// The candidate with the smallest edit distance within the threshold.
/// Ties resolve to the lexicographically first candidate so hints are
/// deterministic.
fn closest(missing: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|candidate| (levenshtein(missing, candidate), candidate))
        .filter(|(distance, _)| *distance <= MAX_EDIT_DISTANCE)
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, candidate)| candidate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transposition_within_distance() {
        // The literal scenario: TCIKET_CLOSED is distance 2 from TICKET_CLOSED.
        let candidates = names(&["TICKET_CLOSED", "SUBJECT_REQUIRED"]);
        let hint = fix_hint("TCIKET_CLOSED", &candidates).expect("hint");
        assert_eq!(hint.did_you_mean.as_deref(), Some("TICKET_CLOSED"));
    }

    #[test]
    fn test_distant_names_get_no_suggestion() {
        let candidates = names(&["COMPLETELY_DIFFERENT"]);
        let hint = fix_hint("TICKET_CLOSED", &candidates).expect("hint lists candidates");
        assert!(hint.did_you_mean.is_none());
        assert_eq!(hint.available, candidates);
    }

    #[test]
    fn test_large_sets_are_not_listed() {
        let candidates: Vec<String> = (0..12).map(|i| format!("NAME_{}", i)).collect();
        let hint = fix_hint("NAME_0X", &candidates).expect("hint");
        assert!(hint.available.is_empty());
        assert!(hint.did_you_mean.is_some());
    }

    #[test]
    fn test_no_hint_when_nothing_useful() {
        let candidates: Vec<String> = (0..12).map(|i| format!("LONG_UNRELATED_{}", i)).collect();
        assert!(fix_hint("X", &candidates).is_none());
    }
}
