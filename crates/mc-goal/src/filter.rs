// filter.rs — Delegate filters over a shared item snapshot.
//
// A FilterGroup node (e.g. "the craft's parts must include a docking port and
// at least two antennas") owns an ordered list of filter children. Once per
// evaluation the group fetches one item snapshot from the world and runs the
// children over it in order. A `Match` filter with the `filter` policy
// narrows the set for every filter after it; the validating policies and
// count filters only judge what reaches them.
//
// Filters are derived from the group's `FilterSpec` list. They are never
// loaded from a save on their own: on load the group rebuilds them from its
// specs, so a changed definition cannot leave stale or duplicate filters.

use serde::{Deserialize, Serialize};

use crate::error::PredicateError;
use crate::state::{NodeId, NodeState};
use crate::world::{ItemId, PredicateRef, World};

/// How a filter turns per-item verdicts into a node state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Keep the items that pass; Complete if any survive, Failed if none do.
    #[default]
    #[serde(rename = "filter")]
    FilterAndRequireNonEmpty,
    /// Every item must pass; otherwise Incomplete. Nothing is filtered.
    #[serde(rename = "validate")]
    ValidateAll,
    /// Every item must pass; otherwise Failed. Nothing is filtered.
    #[serde(rename = "validate_strict")]
    ValidateAllStrict,
    /// No item may pass; otherwise Failed. Nothing is filtered.
    #[serde(rename = "none")]
    NegatedRequireNone,
}

/// Result of running one filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub surviving: Vec<ItemId>,
    pub verdict: NodeState,
    pub error: Option<PredicateError>,
}

/// A predicate-backed filter leaf.
#[derive(Debug, Clone)]
pub struct DelegateFilter {
    pub predicate: PredicateRef<ItemId>,
    pub policy: MatchPolicy,
    /// Left out of summaries; no effect on evaluation.
    pub trivial: bool,
}

impl DelegateFilter {
    pub fn new(predicate: PredicateRef<ItemId>, policy: MatchPolicy) -> Self {
        Self {
            predicate,
            policy,
            trivial: false,
        }
    }

    /// Judge `items`. Pure: committing the verdict is the caller's job, so
    /// the same call serves check-only probes.
    ///
    /// An empty collection carries no information and is always Incomplete.
    /// A predicate error makes the verdict Incomplete and filters nothing.
    pub fn apply(&self, world: &dyn World, items: &[ItemId]) -> FilterOutcome {
        if items.is_empty() {
            return FilterOutcome {
                surviving: Vec::new(),
                verdict: NodeState::Incomplete,
                error: None,
            };
        }

        let mut passing = Vec::with_capacity(items.len());
        for item in items {
            match self.predicate.test(world, item) {
                Ok(true) => passing.push(item.clone()),
                Ok(false) => {}
                Err(error) => {
                    return FilterOutcome {
                        surviving: items.to_vec(),
                        verdict: NodeState::Incomplete,
                        error: Some(error),
                    }
                }
            }
        }

        let all_pass = passing.len() == items.len();
        let (surviving, verdict) = match self.policy {
            MatchPolicy::FilterAndRequireNonEmpty => {
                let verdict = if passing.is_empty() {
                    NodeState::Failed
                } else {
                    NodeState::Complete
                };
                (passing, verdict)
            }
            MatchPolicy::ValidateAll => (
                items.to_vec(),
                if all_pass {
                    NodeState::Complete
                } else {
                    NodeState::Incomplete
                },
            ),
            MatchPolicy::ValidateAllStrict => (
                items.to_vec(),
                if all_pass {
                    NodeState::Complete
                } else {
                    NodeState::Failed
                },
            ),
            MatchPolicy::NegatedRequireNone => (
                items.to_vec(),
                if passing.is_empty() {
                    NodeState::Complete
                } else {
                    NodeState::Failed
                },
            ),
        };
        FilterOutcome {
            surviving,
            verdict,
            error: None,
        }
    }
}

/// Count constraint: `min <= |items| <= max`.
///
/// The shared building block behind crew counts, part counts and the like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountFilter {
    pub min: usize,
    pub max: usize,
}

impl CountFilter {
    /// Build a count filter, clamping `min` down to `max` when inverted.
    pub fn new(min: usize, max: usize) -> Self {
        if min > max {
            tracing::warn!(min, max, "count filter has min > max, clamping min to max");
            return Self { min: max, max };
        }
        Self { min, max }
    }

    pub fn apply(&self, items: &[ItemId]) -> FilterOutcome {
        let n = items.len();
        let verdict = if n >= self.min && n <= self.max {
            NodeState::Complete
        } else {
            NodeState::Incomplete
        };
        FilterOutcome {
            surviving: items.to_vec(),
            verdict,
            error: None,
        }
    }
}

/// Declarative form of one filter child, persisted with its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    Match {
        predicate: String,
        #[serde(default)]
        policy: MatchPolicy,
        #[serde(default)]
        trivial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Count {
        #[serde(default)]
        min: usize,
        #[serde(default = "unbounded")]
        max: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

fn unbounded() -> usize {
    usize::MAX
}

impl FilterSpec {
    pub fn title(&self) -> Option<&str> {
        match self {
            FilterSpec::Match { title, .. } | FilterSpec::Count { title, .. } => title.as_deref(),
        }
    }
}

/// A filter child as seen by its group during a run.
#[derive(Debug, Clone, Copy)]
pub enum FilterChild<'a> {
    Match(&'a DelegateFilter),
    Count(&'a CountFilter),
}

/// Result of running every filter child of a group over one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRun {
    /// True when every filter child came out Complete.
    pub satisfied: bool,
    pub verdicts: Vec<(NodeId, NodeState)>,
    pub errors: Vec<(NodeId, PredicateError)>,
}

/// Run `children` in order over one shared snapshot.
///
/// `snapshot` is `None` (or empty) when the world has nothing to report yet;
/// every child is then Incomplete and the group is not satisfied. Otherwise
/// each child sees the survivors of the children before it.
pub fn run_filters(
    world: &dyn World,
    snapshot: Option<&[ItemId]>,
    children: &[(NodeId, FilterChild<'_>)],
) -> FilterRun {
    let items = match snapshot {
        Some(items) if !items.is_empty() => items,
        _ => {
            return FilterRun {
                satisfied: false,
                verdicts: children
                    .iter()
                    .map(|(id, _)| (*id, NodeState::Incomplete))
                    .collect(),
                errors: Vec::new(),
            }
        }
    };

    let mut values: Vec<ItemId> = items.to_vec();
    let mut run = FilterRun {
        satisfied: true,
        ..FilterRun::default()
    };
    for (id, child) in children {
        let outcome = match child {
            FilterChild::Match(filter) => filter.apply(world, &values),
            FilterChild::Count(count) => count.apply(&values),
        };
        if let Some(error) = outcome.error {
            run.errors.push((*id, error));
        }
        run.satisfied &= outcome.verdict == NodeState::Complete;
        run.verdicts.push((*id, outcome.verdict));
        values = outcome.surviving;
    }
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{MemoryWorld, PredicateRegistry};

    fn world_with_parts() -> MemoryWorld {
        let mut world = MemoryWorld::new();
        for (part, mass) in [("dock", 1.0), ("antenna-1", 0.1), ("antenna-2", 0.1), ("tank", 4.0)] {
            world.set_attribute(part, "mass", mass);
        }
        world
    }

    fn parts() -> Vec<ItemId> {
        ["dock", "antenna-1", "antenna-2", "tank"]
            .into_iter()
            .map(ItemId::new)
            .collect()
    }

    fn filter(key: &str, policy: MatchPolicy) -> DelegateFilter {
        DelegateFilter::new(PredicateRegistry::new().resolve_item(key).unwrap(), policy)
    }

    #[test]
    fn empty_collection_is_neutral_for_every_policy() {
        let world = world_with_parts();
        for policy in [
            MatchPolicy::FilterAndRequireNonEmpty,
            MatchPolicy::ValidateAll,
            MatchPolicy::ValidateAllStrict,
            MatchPolicy::NegatedRequireNone,
        ] {
            let outcome = filter("attr:mass>0", policy).apply(&world, &[]);
            assert_eq!(outcome.verdict, NodeState::Incomplete, "{:?}", policy);
            assert!(outcome.surviving.is_empty());
        }
    }

    #[test]
    fn filter_policy_narrows_and_requires_survivors() {
        let world = world_with_parts();
        let light = filter("attr:mass<0.5", MatchPolicy::FilterAndRequireNonEmpty).apply(&world, &parts());
        assert_eq!(light.verdict, NodeState::Complete);
        assert_eq!(light.surviving.len(), 2);

        let huge = filter("attr:mass>100", MatchPolicy::FilterAndRequireNonEmpty).apply(&world, &parts());
        assert_eq!(huge.verdict, NodeState::Failed);
        assert!(huge.surviving.is_empty());
    }

    #[test]
    fn validate_policies_do_not_filter() {
        let world = world_with_parts();
        let soft = filter("attr:mass<2", MatchPolicy::ValidateAll).apply(&world, &parts());
        assert_eq!(soft.verdict, NodeState::Incomplete);
        assert_eq!(soft.surviving.len(), 4);

        let strict = filter("attr:mass<2", MatchPolicy::ValidateAllStrict).apply(&world, &parts());
        assert_eq!(strict.verdict, NodeState::Failed);
        assert_eq!(strict.surviving.len(), 4);

        let ok = filter("attr:mass>0", MatchPolicy::ValidateAllStrict).apply(&world, &parts());
        assert_eq!(ok.verdict, NodeState::Complete);
    }

    #[test]
    fn negated_policy_requires_no_match() {
        let world = world_with_parts();
        let none_heavy = filter("attr:mass>10", MatchPolicy::NegatedRequireNone).apply(&world, &parts());
        assert_eq!(none_heavy.verdict, NodeState::Complete);
        let some_heavy = filter("attr:mass>2", MatchPolicy::NegatedRequireNone).apply(&world, &parts());
        assert_eq!(some_heavy.verdict, NodeState::Failed);
    }

    #[test]
    fn predicate_error_is_incomplete_and_filters_nothing() {
        let mut registry = PredicateRegistry::new();
        registry.item_fn("flaky", |_, item| {
            if item.as_str() == "tank" {
                Err(PredicateError::new("flaky", "sensor offline"))
            } else {
                Ok(true)
            }
        });
        let f = DelegateFilter::new(registry.resolve_item("flaky").unwrap(), MatchPolicy::FilterAndRequireNonEmpty);
        let outcome = f.apply(&world_with_parts(), &parts());
        assert_eq!(outcome.verdict, NodeState::Incomplete);
        assert_eq!(outcome.surviving.len(), 4);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn count_filter_clamps_inverted_bounds() {
        let count = CountFilter::new(5, 2);
        assert_eq!((count.min, count.max), (2, 2));
        assert_eq!(count.apply(&parts()[..2]).verdict, NodeState::Complete);
        assert_eq!(count.apply(&parts()).verdict, NodeState::Incomplete);
    }

    #[test]
    fn run_filters_chains_survivors() {
        let world = world_with_parts();
        let light = filter("attr:mass<0.5", MatchPolicy::FilterAndRequireNonEmpty);
        let two_or_more = CountFilter::new(2, usize::MAX);
        let three_or_more = CountFilter::new(3, usize::MAX);

        let run = run_filters(
            &world,
            Some(&parts()),
            &[
                (NodeId(1), FilterChild::Match(&light)),
                (NodeId(2), FilterChild::Count(&two_or_more)),
            ],
        );
        assert!(run.satisfied);

        // Only two light parts survive the first filter.
        let run = run_filters(
            &world,
            Some(&parts()),
            &[
                (NodeId(1), FilterChild::Match(&light)),
                (NodeId(2), FilterChild::Count(&three_or_more)),
            ],
        );
        assert!(!run.satisfied);
        assert_eq!(run.verdicts[0], (NodeId(1), NodeState::Complete));
        assert_eq!(run.verdicts[1], (NodeId(2), NodeState::Incomplete));
    }

    #[test]
    fn run_filters_without_snapshot_is_incomplete() {
        let world = world_with_parts();
        let light = filter("attr:mass<0.5", MatchPolicy::FilterAndRequireNonEmpty);
        let zero = CountFilter::new(0, 0);
        for snapshot in [None, Some(&[][..])] {
            let run = run_filters(
                &world,
                snapshot,
                &[
                    (NodeId(1), FilterChild::Match(&light)),
                    (NodeId(2), FilterChild::Count(&zero)),
                ],
            );
            assert!(!run.satisfied);
            assert!(run.verdicts.iter().all(|(_, v)| *v == NodeState::Incomplete));
        }
    }

    #[test]
    fn filter_spec_defaults() {
        let spec: FilterSpec = serde_json::from_str(r#"{"kind":"count","min":1}"#).unwrap();
        assert_eq!(
            spec,
            FilterSpec::Count {
                min: 1,
                max: usize::MAX,
                title: None
            }
        );
        let spec: FilterSpec =
            serde_json::from_str(r#"{"kind":"match","predicate":"attr:mass>1","policy":"validate_strict"}"#)
                .unwrap();
        assert!(matches!(
            spec,
            FilterSpec::Match {
                policy: MatchPolicy::ValidateAllStrict,
                ..
            }
        ));
    }
}
