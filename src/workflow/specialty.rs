//! Specialty-name normalization and matching
//!
//! Specialist entries and route-sheet steps label the same specialty in
//! slightly different ways ("Кардиолог", "врач-кардиолог", " кардиолог ").
//! Both sides are reduced to a comparison key before matching.
//!
//! The same rule runs inside the store's reconciliation `UPDATE` through the
//! registered `route_step_matches` SQL function, so Rust-side filtering and
//! the atomic store update never disagree.

/// Words that only say "this is a doctor", stripped before comparison
const DOCTOR_WORDS: &[&str] = &["врач-", "врач", "doctor-", "doctor"];

/// Minimum length (in chars) of the shorter key for a containment match.
/// Shorter labels only match exactly, so "ухо" cannot match inside an unrelated word.
pub const MIN_PARTIAL_MATCH_CHARS: usize = 4;

/// Reduce a specialty label to its comparison key
pub fn normalize_specialty(label: &str) -> String {
    let mut key = label.trim().to_lowercase();
    for word in DOCTOR_WORDS {
        key = key.replace(word, "");
    }
    key.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '-' || c.is_whitespace())
        .to_string()
}

/// Compare two already-normalized keys
pub fn keys_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }

    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    shorter.chars().count() >= MIN_PARTIAL_MATCH_CHARS && longer.contains(shorter)
}

/// Whether two raw specialty labels refer to the same specialty
pub fn specialties_match(a: &str, b: &str) -> bool {
    keys_match(&normalize_specialty(a), &normalize_specialty(b))
}

/// Whether a route-step specialty matches any of the given raw labels
pub fn matches_any<S: AsRef<str>>(step_specialty: &str, labels: &[S]) -> bool {
    let step_key = normalize_specialty(step_specialty);
    labels
        .iter()
        .any(|label| keys_match(&step_key, &normalize_specialty(label.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_spellings_share_one_key() {
        let forms = ["Кардиолог", "врач-кардиолог", "  Кардиолог ", "кардиолог"];
        for form in forms {
            assert_eq!(normalize_specialty(form), "кардиолог", "form {:?}", form);
        }
        for a in forms {
            for b in forms {
                assert!(specialties_match(a, b), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_doctor_word_anywhere() {
        assert_eq!(normalize_specialty("Врач ЛОР"), "лор");
        assert_eq!(normalize_specialty("ЛОР-врач"), "лор");
        assert_eq!(normalize_specialty("Doctor-Neurologist"), "neurologist");
    }

    #[test]
    fn test_partial_labels_match_in_both_directions() {
        assert!(specialties_match("Офтальмолог", "Врач-офтальмолог (окулист)"));
        assert!(specialties_match("Врач-офтальмолог (окулист)", "офтальмолог"));
    }

    #[test]
    fn test_short_labels_need_exact_match() {
        assert!(specialties_match("ЛОР", "лор"));
        assert!(!specialties_match("ухо", "Слуховой аппарат, заухо"));
        assert!(!keys_match("", "терапевт"));
    }

    #[test]
    fn test_unrelated_specialties_do_not_match() {
        assert!(!specialties_match("Кардиолог", "Невролог"));
        assert!(matches_any("Невролог", &["Кардиолог", "врач-невролог"]));
        assert!(!matches_any("Хирург", &["Кардиолог", "Невролог"]));
    }
}
