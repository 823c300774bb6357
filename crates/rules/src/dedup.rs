//! Generic cross-run diff/dedup algorithms.
//!
//! These are the building blocks every rule's exactly-once-per-change
//! behavior rests on. All of them persist their new state unconditionally;
//! whether a subject alerts is decided from the *merged* view, so the
//! decision survives independent stateless process invocations.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use rand::seq::SliceRandom;

use driftwatch_core::StateNamespace;

/// Persisted-state key used by first-seen tracking.
pub const FIRST_SEEN_KEY: &str = "first_seen";

/// Merge the current per-group minimum timestamps with the persisted
/// minimums, taking the smaller of the two for every key, and persist the
/// merged map unconditionally.
///
/// Callers alert for a group only when its merged minimum falls at or
/// after the window's `since` boundary: a group whose earliest member
/// predates the window never alerts, even if newly-seen members appear
/// later.
pub fn merge_first_seen(
    state: &StateNamespace,
    current: &HashMap<String, i64>,
) -> HashMap<String, i64> {
    let mut merged = current.clone();
    for (key, persisted_ts) in state.get_i64_map(FIRST_SEEN_KEY) {
        merged
            .entry(key)
            .and_modify(|ts| *ts = (*ts).min(persisted_ts))
            .or_insert(persisted_ts);
    }
    state.set_i64_map(FIRST_SEEN_KEY, &merged);
    merged
}

/// One subject whose tracked value is new or has changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub subject: String,
    /// `None` when the subject has never been seen before.
    pub previous: Option<String>,
    pub current: String,
}

/// Compare current per-subject values against the persisted previous
/// values under `key`, then persist the current map unconditionally.
///
/// Last-write-wins, no history: a value that changes and changes back
/// between two runs alerts twice, not zero times.
pub fn diff_values(
    state: &StateNamespace,
    key: &str,
    current: &BTreeMap<String, String>,
) -> Vec<ValueChange> {
    let previous = state.get_str_map(key);
    let changes = current
        .iter()
        .filter(|(subject, value)| previous.get(*subject) != Some(value))
        .map(|(subject, value)| ValueChange {
            subject: subject.clone(),
            previous: previous.get(subject).cloned(),
            current: value.clone(),
        })
        .collect();
    state.set_str_map(key, current);
    changes
}

/// Sample `k = clamp(1, budget - depth, ceil(N * p))` elements uniformly
/// without replacement, capped at the population size.
///
/// The budget shrinks as traversal nests deeper, bounding total API calls
/// over unbounded hierarchical namespaces. Coverage is probabilistic by
/// design. An empty population always yields an empty sample.
pub fn sample_population<T: Clone, R: Rng + ?Sized>(
    rng: &mut R,
    population: &[T],
    probability: f64,
    budget: usize,
    depth: usize,
) -> Vec<T> {
    let n = population.len();
    if n == 0 {
        return Vec::new();
    }
    let by_budget = budget.saturating_sub(depth).max(1);
    let by_probability = ((n as f64) * probability).ceil().max(1.0) as usize;
    let k = by_budget.min(by_probability).min(n);
    population.choose_multiple(rng, k).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    // -- first-seen --

    #[test]
    fn merge_takes_the_smaller_timestamp() {
        let state = StateNamespace::default();
        state.set(
            FIRST_SEEN_KEY,
            serde_json::json!({"ami-1": 1000, "ami-2": 400}),
        );

        let current = HashMap::from([("ami-1".to_owned(), 500), ("ami-3".to_owned(), 2000)]);
        let merged = merge_first_seen(&state, &current);

        assert_eq!(merged.get("ami-1"), Some(&500)); // current earlier
        assert_eq!(merged.get("ami-2"), Some(&400)); // persisted only
        assert_eq!(merged.get("ami-3"), Some(&2000)); // current only

        // Persisted unconditionally.
        let persisted = state.get_i64_map(FIRST_SEEN_KEY);
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted.get("ami-1"), Some(&500));
    }

    #[test]
    fn merge_keeps_persisted_minimum_when_earlier() {
        let state = StateNamespace::default();
        state.set(FIRST_SEEN_KEY, serde_json::json!({"grp": 100}));
        let merged = merge_first_seen(&state, &HashMap::from([("grp".to_owned(), 900)]));
        // A group first seen before the window stays anchored there; with
        // since > 100 it can never alert again.
        assert_eq!(merged.get("grp"), Some(&100));
    }

    // -- value diff --

    #[test]
    fn value_diff_detects_change_and_persists() {
        let state = StateNamespace::default();
        state.set("hashes", serde_json::json!({"https://a": "H1"}));

        let current = BTreeMap::from([("https://a".to_owned(), "H2".to_owned())]);
        let changes = diff_values(&state, "hashes", &current);

        assert_eq!(
            changes,
            vec![ValueChange {
                subject: "https://a".to_owned(),
                previous: Some("H1".to_owned()),
                current: "H2".to_owned(),
            }]
        );
        assert_eq!(
            state.get_str_map("hashes"),
            BTreeMap::from([("https://a".to_owned(), "H2".to_owned())])
        );
    }

    #[test]
    fn value_diff_alerts_on_unseen_subject() {
        let state = StateNamespace::default();
        let current = BTreeMap::from([("https://b".to_owned(), "H9".to_owned())]);
        let changes = diff_values(&state, "hashes", &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, None);
    }

    #[test]
    fn value_diff_is_silent_when_unchanged() {
        let state = StateNamespace::default();
        let current = BTreeMap::from([("https://a".to_owned(), "H1".to_owned())]);
        diff_values(&state, "hashes", &current);
        assert!(diff_values(&state, "hashes", &current).is_empty());
    }

    #[test]
    fn value_diff_oscillation_realerts_each_time() {
        let state = StateNamespace::default();
        let a = BTreeMap::from([("s".to_owned(), "A".to_owned())]);
        let b = BTreeMap::from([("s".to_owned(), "B".to_owned())]);
        diff_values(&state, "v", &a);
        assert_eq!(diff_values(&state, "v", &b).len(), 1);
        // Back to the original value: still one change, not zero.
        assert_eq!(diff_values(&state, "v", &a).len(), 1);
    }

    // -- sampling --

    #[test]
    fn sampling_empty_population_is_empty() {
        let mut rng = StdRng::seed_from_u64(7);
        let out = sample_population::<u32, _>(&mut rng, &[], 0.5, 5, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn sampling_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let population: Vec<u32> = (0..100).collect();
        for depth in 0..10 {
            for budget in 0..8 {
                let out = sample_population(&mut rng, &population, 0.1, budget, depth);
                let cap = population.len().min(budget.max(1));
                assert!(
                    !out.is_empty() && out.len() <= cap.max(1),
                    "budget={budget} depth={depth} len={}",
                    out.len()
                );
            }
        }
    }

    #[test]
    fn sampling_is_without_replacement() {
        let mut rng = StdRng::seed_from_u64(42);
        let population: Vec<u32> = (0..10).collect();
        let mut out = sample_population(&mut rng, &population, 1.0, 100, 0);
        out.sort_unstable();
        out.dedup();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn sampling_budget_shrinks_with_depth() {
        let mut rng = StdRng::seed_from_u64(1);
        let population: Vec<u32> = (0..50).collect();
        // budget 5 at depth 3 leaves room for 2.
        let out = sample_population(&mut rng, &population, 1.0, 5, 3);
        assert_eq!(out.len(), 2);
        // Exhausted budget still probes a single element.
        let out = sample_population(&mut rng, &population, 1.0, 5, 9);
        assert_eq!(out.len(), 1);
    }
}
