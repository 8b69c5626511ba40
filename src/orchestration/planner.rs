//! Batch planner: partitions a working set of beads into ordered batches
//! under a token budget.
//!
//! The planner is pure: it consumes beads, relations, and resolved
//! estimates, and produces a plan without touching storage. Beads are
//! assigned in dependency-depth order (token-descending within a depth) so
//! every dependency is already placed when its dependent is considered,
//! then bin-packed first-fit-decreasing with a tightest-fit tiebreak.

use crate::core::bead::{Bead, Relation};
use crate::core::graph::DependencyGraph;
use crate::error::{Error, Result};
use crate::orchestration::estimate::Estimate;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// One planned batch before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    /// Member beads in assignment order (dependencies first).
    pub bead_ids: Vec<String>,
    /// Summed complexity score.
    pub score: u32,
    /// Summed token estimate.
    pub tokens: u32,
    /// Single bead whose estimate alone exceeds the budget.
    pub oversized: bool,
}

/// The planner's output: batches in execution order plus the cross-batch
/// dependency edges between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub batches: Vec<PlannedBatch>,
    /// (dependent batch index, dependency batch index) pairs. Dependencies
    /// inside a single batch produce no edge.
    pub deps: Vec<(usize, usize)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Partition `beads` into batches whose summed token estimates respect
/// `budget`.
///
/// Every bead must have a non-pending entry in `estimates`.
///
/// # Errors
/// - [`Error::Cycle`] when the relations contain a dependency cycle.
/// - [`Error::EstimationPending`] when any bead lacks a resolved estimate.
pub fn plan(
    beads: &[Bead],
    relations: &[Relation],
    estimates: &HashMap<String, Estimate>,
    budget: u32,
) -> Result<Plan> {
    let ids: Vec<String> = beads.iter().map(|b| b.id.clone()).collect();
    let graph = DependencyGraph::build(&ids, relations);
    let topo = graph.topo_sort()?;
    let depths = graph.depths(&topo);

    let mut resolved: HashMap<&str, Estimate> = HashMap::with_capacity(beads.len());
    for bead in beads {
        match estimates.get(&bead.id) {
            Some(estimate) if !estimate.is_pending() => {
                resolved.insert(bead.id.as_str(), *estimate);
            }
            _ => {
                return Err(Error::EstimationPending {
                    bead: bead.id.clone(),
                })
            }
        }
    }

    // Depth ascending, then tokens descending; stable over input order.
    let mut order: Vec<&Bead> = beads.iter().collect();
    order.sort_by(|a, b| {
        depths[&a.id]
            .cmp(&depths[&b.id])
            .then(resolved[b.id.as_str()].tokens.cmp(&resolved[a.id.as_str()].tokens))
    });

    let mut batches: Vec<PlannedBatch> = Vec::new();
    let mut assigned: HashMap<&str, usize> = HashMap::with_capacity(beads.len());

    for bead in order {
        let estimate = resolved[bead.id.as_str()];

        if estimate.tokens > budget {
            // Unsatisfiable alone; isolate it in its own batch.
            batches.push(PlannedBatch {
                bead_ids: vec![bead.id.clone()],
                score: estimate.score as u32,
                tokens: estimate.tokens,
                oversized: true,
            });
            assigned.insert(bead.id.as_str(), batches.len() - 1);
            continue;
        }

        // A bead may not land in a batch earlier than any of its
        // dependencies; sharing a batch with one is fine.
        let floor = graph
            .depends_on(&bead.id)
            .iter()
            .filter_map(|dep| assigned.get(*dep).copied())
            .max()
            .unwrap_or(0);

        let mut best: Option<(usize, u32)> = None;
        for (i, batch) in batches.iter().enumerate().skip(floor) {
            if batch.tokens + estimate.tokens <= budget {
                let remaining = budget - batch.tokens - estimate.tokens;
                let tighter = match best {
                    Some((_, r)) => remaining < r,
                    None => true,
                };
                if tighter {
                    best = Some((i, remaining));
                }
            }
        }

        let index = match best {
            Some((i, _)) => {
                let batch = &mut batches[i];
                batch.bead_ids.push(bead.id.clone());
                batch.score += estimate.score as u32;
                batch.tokens += estimate.tokens;
                i
            }
            None => {
                batches.push(PlannedBatch {
                    bead_ids: vec![bead.id.clone()],
                    score: estimate.score as u32,
                    tokens: estimate.tokens,
                    oversized: false,
                });
                batches.len() - 1
            }
        };
        assigned.insert(bead.id.as_str(), index);
    }

    let mut deps: BTreeSet<(usize, usize)> = BTreeSet::new();
    for bead in beads {
        let dependent_batch = assigned[bead.id.as_str()];
        for dep in graph.depends_on(&bead.id) {
            let dependency_batch = assigned[dep];
            if dependency_batch != dependent_batch {
                deps.insert((dependent_batch, dependency_batch));
            }
        }
    }

    debug!(
        beads = beads.len(),
        batches = batches.len(),
        budget,
        "planned batches"
    );
    Ok(Plan {
        batches,
        deps: deps.into_iter().collect(),
    })
}
