//! Contraction planning.
//!
//! Deciding a good contraction order is a separate optimization problem; the
//! evaluator only needs some valid [`ContractionTree`]. [`ContractionPlanner`]
//! is the seam for plugging in any provider. [`EliminationPlanner`] turns a
//! variable elimination order into a tree: eliminating a label contracts all
//! tensors that carry it, pairwise, and sums the label away once no other
//! tensor needs it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::contraction::ContractionTree;
use crate::einsum::{EinCode, SizeDict};
use crate::error::{InferenceError, Result};

/// Provider of contraction plans.
pub trait ContractionPlanner: Send + Sync {
    /// Build a tree that contracts the tensors labelled by `code.ixs` into
    /// `code.iy`.
    fn plan(&self, code: &EinCode, size_dict: &SizeDict) -> Result<ContractionTree>;
}

/// Heuristic for choosing the next label to eliminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EliminationStrategy {
    /// Choose the label whose elimination adds the fewest fill edges
    #[default]
    MinFill,
    /// Choose the label with the fewest neighbours
    MinDegree,
    /// Min-fill weighted by the size of the created clique
    WeightedMinFill,
}

/// Plans a contraction from a variable elimination order.
#[derive(Debug, Clone, Default)]
pub struct EliminationPlanner {
    strategy: EliminationStrategy,
    order: Option<Vec<usize>>,
}

struct Item {
    tree: ContractionTree,
    labels: Vec<usize>,
}

impl EliminationPlanner {
    pub fn new(strategy: EliminationStrategy) -> Self {
        Self {
            strategy,
            order: None,
        }
    }

    /// Use a fixed elimination order, e.g. one derived from a tree
    /// decomposition. Labels missing from `order` are eliminated afterwards
    /// in ascending order.
    pub fn with_order(mut self, order: Vec<usize>) -> Self {
        self.order = Some(order);
        self
    }

    pub fn strategy(&self) -> EliminationStrategy {
        self.strategy
    }

    /// Order in which the summed labels of `code` are eliminated.
    pub fn elimination_order(&self, code: &EinCode, size_dict: &SizeDict) -> Vec<usize> {
        let eliminable: BTreeSet<usize> = code.inner_labels().into_iter().collect();
        match &self.order {
            Some(order) => {
                let mut out: Vec<usize> = Vec::with_capacity(eliminable.len());
                for &l in order {
                    if eliminable.contains(&l) && !out.contains(&l) {
                        out.push(l);
                    }
                }
                for &l in &eliminable {
                    if !out.contains(&l) {
                        out.push(l);
                    }
                }
                out
            }
            None => self.heuristic_order(code, eliminable, size_dict),
        }
    }

    fn heuristic_order(
        &self,
        code: &EinCode,
        mut remaining: BTreeSet<usize>,
        size_dict: &SizeDict,
    ) -> Vec<usize> {
        let mut adjacency = build_adjacency_graph(&code.ixs);
        let mut order = Vec::with_capacity(remaining.len());

        loop {
            let next = remaining
                .iter()
                .copied()
                .min_by_key(|v| (self.score(&adjacency, *v, size_dict), *v));
            let Some(next) = next else {
                break;
            };
            order.push(next);
            remaining.remove(&next);
            update_adjacency_after_elimination(&mut adjacency, next);
        }
        order
    }

    fn score(
        &self,
        adjacency: &BTreeMap<usize, BTreeSet<usize>>,
        var: usize,
        size_dict: &SizeDict,
    ) -> u128 {
        match self.strategy {
            EliminationStrategy::MinDegree => {
                adjacency.get(&var).map(|s| s.len()).unwrap_or(0) as u128
            }
            EliminationStrategy::MinFill => compute_fill(adjacency, var) as u128,
            EliminationStrategy::WeightedMinFill => {
                let weight = adjacency
                    .get(&var)
                    .into_iter()
                    .flatten()
                    .chain(std::iter::once(&var))
                    .map(|l| size_dict.get(l).copied().unwrap_or(1) as u128)
                    .fold(1u128, |acc, d| acc.saturating_mul(d));
                (compute_fill(adjacency, var) as u128).saturating_mul(weight)
            }
        }
    }
}

impl ContractionPlanner for EliminationPlanner {
    fn plan(&self, code: &EinCode, size_dict: &SizeDict) -> Result<ContractionTree> {
        if code.ixs.is_empty() {
            return Err(InferenceError::InvalidPlan(
                "cannot plan a network without tensors".to_string(),
            ));
        }
        let order = self.elimination_order(code, size_dict);
        debug!(strategy = ?self.strategy, order = ?order, "elimination order");

        let mut items: Vec<Item> = code
            .ixs
            .iter()
            .enumerate()
            .map(|(i, ix)| Item {
                tree: ContractionTree::leaf(i),
                labels: ix.clone(),
            })
            .collect();

        for label in order {
            let (bucket, rest): (Vec<Item>, Vec<Item>) =
                items.into_iter().partition(|it| it.labels.contains(&label));
            items = rest;
            if bucket.is_empty() {
                continue;
            }
            let merged = contract_bucket(bucket, &items, &code.iy);
            items.push(merged);
        }

        let merged = contract_bucket(items, &[], &code.iy);
        if merged.labels == code.iy {
            Ok(merged.tree)
        } else {
            Ok(ContractionTree::node(
                vec![merged.tree],
                EinCode::new(vec![merged.labels], code.iy.clone()),
            ))
        }
    }
}

/// Contract a bucket of tensors left to right. A label survives a step only
/// if a tensor outside the step or the final output still carries it.
fn contract_bucket(bucket: Vec<Item>, rest: &[Item], iy: &[usize]) -> Item {
    let mut pending: VecDeque<Item> = bucket.into();
    let Some(mut acc) = pending.pop_front() else {
        return Item {
            tree: ContractionTree::node(Vec::new(), EinCode::new(Vec::new(), Vec::new())),
            labels: Vec::new(),
        };
    };

    let needed = |label: usize, pending: &VecDeque<Item>| {
        iy.contains(&label)
            || rest.iter().any(|it| it.labels.contains(&label))
            || pending.iter().any(|it| it.labels.contains(&label))
    };

    if pending.is_empty() {
        let labels = dedup(acc.labels.iter().copied().filter(|&l| needed(l, &pending)));
        if labels == acc.labels {
            return acc;
        }
        return Item {
            tree: ContractionTree::node(
                vec![acc.tree],
                EinCode::new(vec![acc.labels], labels.clone()),
            ),
            labels,
        };
    }

    while let Some(next) = pending.pop_front() {
        let labels = dedup(
            acc.labels
                .iter()
                .chain(&next.labels)
                .copied()
                .filter(|&l| needed(l, &pending)),
        );
        acc = Item {
            tree: ContractionTree::node(
                vec![acc.tree, next.tree],
                EinCode::new(vec![acc.labels, next.labels], labels.clone()),
            ),
            labels,
        };
    }
    acc
}

fn dedup<I: IntoIterator<Item = usize>>(labels: I) -> Vec<usize> {
    let mut out = Vec::new();
    for l in labels {
        if !out.contains(&l) {
            out.push(l);
        }
    }
    out
}

/// Interaction graph: labels sharing a tensor are neighbours.
fn build_adjacency_graph(ixs: &[Vec<usize>]) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut adjacency: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for ix in ixs {
        for (i, &v1) in ix.iter().enumerate() {
            adjacency.entry(v1).or_default();
            for &v2 in &ix[i + 1..] {
                if v1 != v2 {
                    adjacency.entry(v1).or_default().insert(v2);
                    adjacency.entry(v2).or_default().insert(v1);
                }
            }
        }
    }
    adjacency
}

/// Number of edges eliminating `var` would add.
fn compute_fill(adjacency: &BTreeMap<usize, BTreeSet<usize>>, var: usize) -> usize {
    let Some(neighbors) = adjacency.get(&var) else {
        return 0;
    };
    let neighbors: Vec<usize> = neighbors.iter().copied().collect();
    let mut fill = 0;
    for i in 0..neighbors.len() {
        for j in (i + 1)..neighbors.len() {
            let connected = adjacency
                .get(&neighbors[i])
                .map(|adj| adj.contains(&neighbors[j]))
                .unwrap_or(false);
            if !connected {
                fill += 1;
            }
        }
    }
    fill
}

fn update_adjacency_after_elimination(adjacency: &mut BTreeMap<usize, BTreeSet<usize>>, var: usize) {
    let Some(neighbors) = adjacency.remove(&var) else {
        return;
    };
    for n in &neighbors {
        if let Some(adj) = adjacency.get_mut(n) {
            adj.remove(&var);
            adj.extend(neighbors.iter().copied().filter(|m| m != n));
        }
    }
}
