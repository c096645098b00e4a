//! Set comparison of two papers' canonical weaknesses. No gateway calls.

use std::collections::HashSet;

use crate::{CanonicalWeakness, WeaknessAnalysis};

/// Comparison key for labels: lowercase with whitespace collapsed.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split two canonical sets into shared, A-only and B-only labels.
pub fn fuse(a: &[CanonicalWeakness], b: &[CanonicalWeakness]) -> WeaknessAnalysis {
    let a_labels: Vec<&str> = a.iter().map(|w| w.label.as_str()).collect();
    let b_labels: Vec<&str> = b.iter().map(|w| w.label.as_str()).collect();
    fuse_labels(&a_labels, &b_labels)
}

/// Label-level fusion.
///
/// Shared labels keep A's spelling and order. Each output list is free of
/// normalized duplicates, and the three lists are pairwise disjoint.
pub fn fuse_labels<S: AsRef<str>>(a: &[S], b: &[S]) -> WeaknessAnalysis {
    let b_keys: HashSet<String> = b.iter().map(|l| normalize_label(l.as_ref())).collect();

    let mut seen = HashSet::new();
    let mut shared = Vec::new();
    let mut paper_a_only = Vec::new();
    for label in a {
        let label = label.as_ref();
        let key = normalize_label(label);
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        if b_keys.contains(&key) {
            shared.push(label.to_string());
        } else {
            paper_a_only.push(label.to_string());
        }
    }

    // `seen` now holds every A key, shared or not.
    let mut paper_b_only = Vec::new();
    for label in b {
        let label = label.as_ref();
        let key = normalize_label(label);
        if !key.is_empty() && seen.insert(key) {
            paper_b_only.push(label.to_string());
        }
    }

    WeaknessAnalysis {
        shared,
        paper_a_only,
        paper_b_only,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(labels: &[String]) -> HashSet<String> {
        labels.iter().map(|l| normalize_label(l)).collect()
    }

    #[test]
    fn normalize_collapses_case_and_space() {
        assert_eq!(normalize_label("  High\tInference   Cost "), "high inference cost");
    }

    #[test]
    fn shared_uses_a_spelling() {
        let analysis = fuse_labels(&["No Theoretical Guarantees"], &["no  theoretical guarantees"]);
        assert_eq!(analysis.shared, vec!["No Theoretical Guarantees"]);
        assert!(analysis.paper_a_only.is_empty());
        assert!(analysis.paper_b_only.is_empty());
    }

    #[test]
    fn duplicates_within_a_side_collapse() {
        let analysis = fuse_labels(&["x", "X", "y"], &["z", "Z "]);
        assert_eq!(analysis.paper_a_only, vec!["x", "y"]);
        assert_eq!(analysis.paper_b_only, vec!["z"]);
    }

    #[test]
    fn empty_inputs() {
        let empty: [&str; 0] = [];
        assert!(fuse_labels(&empty, &empty).is_empty());
        let analysis = fuse_labels(&["a"], &empty);
        assert_eq!(analysis.paper_a_only, vec!["a"]);
    }

    #[test]
    fn partition_properties_hold() {
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec!["a", "b", "c"], vec!["B", "c ", "d"]),
            (vec![], vec!["x"]),
            (vec!["same", "SAME"], vec!["same"]),
            (vec!["p", "q"], vec!["r", "s"]),
        ];
        for (a, b) in cases {
            let ab = fuse_labels(&a, &b);
            let ba = fuse_labels(&b, &a);

            assert_eq!(keys(&ab.shared), keys(&ba.shared));
            assert!(keys(&ab.paper_a_only).is_disjoint(&keys(&ab.shared)));
            assert!(keys(&ab.paper_b_only).is_disjoint(&keys(&ab.shared)));

            let a_keys: HashSet<String> = a.iter().map(|l| normalize_label(l)).collect();
            let union: HashSet<String> = keys(&ab.paper_a_only)
                .union(&keys(&ab.shared))
                .cloned()
                .collect();
            assert_eq!(union, a_keys);

            assert_eq!(fuse_labels(&a, &b), ab);
        }
    }
}
