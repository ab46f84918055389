//! Powers DAG
//!
//! The receiver only submits ciphertexts for a sparse set of powers of its
//! query; the sender must expand them to every power in
//! `[1, max_items_per_bin]` before evaluating bin polynomials. The plan for
//! that expansion is a DAG with one node per power: sources are the
//! submitted powers (depth 0), and every other node has exactly two parents
//! whose powers sum to its own. Each non-source node costs one ciphertext
//! multiplication, so the DAG's depth bounds the multiplicative depth of
//! the whole query.
//!
//! Construction is deterministic given `(sources, targets)` — parent pairs
//! minimize `max(depth[a], depth[b])` with lexicographic tie-breaking — so
//! the receiver and the sender independently derive the same plan from the
//! negotiated parameters.
//!
//! [`PowersDag::parallel_apply`] mirrors the two-level concurrency
//! discipline of the query engine: it runs on its own scoped worker
//! threads (never the orchestrator's pool), with each worker scanning a
//! tri-state node array and backing off when a node's parents are not yet
//! done.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};

/// Errors surfaced by DAG configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PowersDagError {
    #[error("power {power} cannot be reached from the source powers")]
    Unreachable { power: u32 },
    #[error("source power set must not be empty")]
    EmptySources,
    #[error("power 0 is not a valid node")]
    ZeroPower,
}

/// One node of the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowersNode {
    /// The power this node computes.
    pub power: u32,
    /// Longest path from any source.
    pub depth: u32,
    /// `None` for sources; otherwise the two parent powers, `a + b == power`.
    pub parents: Option<(u32, u32)>,
}

impl PowersNode {
    #[inline]
    pub fn is_source(&self) -> bool {
        self.parents.is_none()
    }
}

/// A configured powers DAG. Nodes cover `sources ∪ targets`.
#[derive(Debug, Clone)]
pub struct PowersDag {
    nodes: BTreeMap<u32, PowersNode>,
    depth: u32,
    source_count: usize,
}

impl PowersDag {
    /// Build the deterministic plan for computing `targets` from `sources`.
    ///
    /// Targets are processed in ascending order and become available to
    /// later pairings as soon as they are assigned, which keeps chains like
    /// `2 = 1+1, 4 = 2+2, 8 = 4+4` at logarithmic depth.
    pub fn configure(
        sources: &BTreeSet<u32>,
        targets: &BTreeSet<u32>,
    ) -> Result<Self, PowersDagError> {
        if sources.is_empty() {
            return Err(PowersDagError::EmptySources);
        }
        if sources.contains(&0) || targets.contains(&0) {
            return Err(PowersDagError::ZeroPower);
        }

        let mut nodes: BTreeMap<u32, PowersNode> = BTreeMap::new();
        let mut depths: BTreeMap<u32, u32> = BTreeMap::new();
        for &s in sources {
            nodes.insert(s, PowersNode { power: s, depth: 0, parents: None });
            depths.insert(s, 0);
        }

        for &t in targets {
            if depths.contains_key(&t) {
                continue;
            }
            // Best pair (a, b), a ≤ b, a + b = t: minimize max depth, break
            // ties by lexicographic order on (a, b) — ascending `a` visits
            // candidates in exactly that order.
            let mut best: Option<(u32, u32, u32)> = None;
            for (&a, &da) in depths.range(..=t / 2) {
                let b = t - a;
                if let Some(&db) = depths.get(&b) {
                    let cand = da.max(db);
                    if best.map_or(true, |(_, _, d)| cand < d) {
                        best = Some((a, b, cand));
                    }
                }
            }
            let (a, b, parent_depth) =
                best.ok_or(PowersDagError::Unreachable { power: t })?;
            let depth = parent_depth + 1;
            nodes.insert(t, PowersNode { power: t, depth, parents: Some((a, b)) });
            depths.insert(t, depth);
        }

        let depth = targets.iter().map(|t| depths[t]).max().unwrap_or(0);
        Ok(Self { nodes, depth, source_count: sources.len() })
    }

    /// Longest source→target path length.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of source nodes.
    #[inline]
    pub fn source_count(&self) -> usize {
        self.source_count
    }

    /// Look up one node by power.
    pub fn node(&self, power: u32) -> Option<&PowersNode> {
        self.nodes.get(&power)
    }

    /// All nodes, ascending by power.
    pub fn nodes(&self) -> impl Iterator<Item = &PowersNode> {
        self.nodes.values()
    }

    /// Call `f` on every node in a topological order. Parents sum to their
    /// child, so ascending power order is always topological.
    pub fn apply(&self, mut f: impl FnMut(&PowersNode)) {
        for node in self.nodes.values() {
            f(node);
        }
    }

    /// GraphViz rendering of the DAG, for diagnostics.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph powers {\n");
        for node in self.nodes.values() {
            match node.parents {
                None => out.push_str(&format!("    {} [shape=box];\n", node.power)),
                Some((a, b)) => {
                    out.push_str(&format!("    {} -> {};\n", a, node.power));
                    out.push_str(&format!("    {} -> {};\n", b, node.power));
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Call `f` on every node from `worker_count` scoped threads.
    ///
    /// Each node's state moves `Uncomputed → Computing → Done`; a worker
    /// that claims a node whose parents are not both `Done` reverts it to
    /// `Uncomputed` and moves on. Sources are evaluated inline and seeded
    /// as `Done` before any worker starts. Returns when every node is
    /// `Done`.
    ///
    /// `f` must be safe to call concurrently on distinct nodes; each node
    /// is evaluated exactly once.
    pub fn parallel_apply<F>(&self, worker_count: usize, f: F)
    where
        F: Fn(&PowersNode) + Sync,
    {
        const UNCOMPUTED: u8 = 0;
        const COMPUTING: u8 = 1;
        const DONE: u8 = 2;

        let order: Vec<&PowersNode> = self.nodes.values().collect();
        let index_of: HashMap<u32, usize> =
            order.iter().enumerate().map(|(i, n)| (n.power, i)).collect();

        let states: Vec<AtomicU8> = order
            .iter()
            .map(|node| {
                if node.is_source() {
                    f(node);
                    AtomicU8::new(DONE)
                } else {
                    AtomicU8::new(UNCOMPUTED)
                }
            })
            .collect();

        let workers = worker_count.max(1).min(order.len().max(1));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let mut idx = 0usize;
                    loop {
                        if states.iter().all(|s| s.load(Ordering::Acquire) == DONE) {
                            return;
                        }
                        if states[idx]
                            .compare_exchange(
                                UNCOMPUTED,
                                COMPUTING,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            let node = order[idx];
                            let (a, b) = node.parents.expect("non-source node");
                            let parents_done = [a, b].iter().all(|p| {
                                states[index_of[p]].load(Ordering::Acquire) == DONE
                            });
                            if parents_done {
                                f(node);
                                states[idx].store(DONE, Ordering::Release);
                            } else {
                                states[idx].store(UNCOMPUTED, Ordering::Release);
                            }
                        }
                        idx = (idx + 1) % states.len();
                    }
                });
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn set(values: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        values.into_iter().collect()
    }

    #[test]
    fn minimal_configuration_matches_expected_pairs() {
        let dag = PowersDag::configure(&set([1, 2, 5]), &set(1..=7)).unwrap();
        assert_eq!(dag.depth(), 1);
        assert_eq!(dag.source_count(), 3);
        assert_eq!(dag.node(3).unwrap().parents, Some((1, 2)));
        assert_eq!(dag.node(4).unwrap().parents, Some((2, 2)));
        assert_eq!(dag.node(6).unwrap().parents, Some((1, 5)));
        assert_eq!(dag.node(7).unwrap().parents, Some((2, 5)));
    }

    #[test]
    fn every_node_is_well_formed() {
        let sources = set([1, 3, 5]);
        let targets = set(1..=16);
        let dag = PowersDag::configure(&sources, &targets).unwrap();
        let known: BTreeSet<u32> = dag.nodes().map(|n| n.power).collect();
        for node in dag.nodes() {
            match node.parents {
                None => assert!(sources.contains(&node.power)),
                Some((a, b)) => {
                    assert_eq!(a + b, node.power);
                    assert!(known.contains(&a) && known.contains(&b));
                    let da = dag.node(a).unwrap().depth;
                    let db = dag.node(b).unwrap().depth;
                    assert_eq!(node.depth, da.max(db) + 1);
                }
            }
        }
        // Depth is at least the information-theoretic doubling bound.
        let max_target = 16f64;
        let max_source = 5f64;
        let bound = (max_target / max_source).log2().ceil() as u32;
        assert!(dag.depth() >= bound);
    }

    #[test]
    fn unreachable_target_is_reported() {
        // From {2} alone, odd powers are unreachable.
        assert_eq!(
            PowersDag::configure(&set([2]), &set([2, 3])).unwrap_err(),
            PowersDagError::Unreachable { power: 3 }
        );
        assert_eq!(
            PowersDag::configure(&BTreeSet::new(), &set([1])).unwrap_err(),
            PowersDagError::EmptySources
        );
        assert_eq!(
            PowersDag::configure(&set([0, 1]), &set([1])).unwrap_err(),
            PowersDagError::ZeroPower
        );
    }

    #[test]
    fn dot_output_lists_sources_and_edges() {
        let dag = PowersDag::configure(&set([1, 2]), &set(1..=4)).unwrap();
        let dot = dag.to_dot();
        assert!(dot.starts_with("digraph powers {"));
        assert!(dot.contains("1 [shape=box];"));
        assert!(dot.contains("2 [shape=box];"));
        assert!(dot.contains("1 -> 3;"));
        assert!(dot.contains("2 -> 4;"));
    }

    #[test]
    fn configuration_is_deterministic() {
        let a = PowersDag::configure(&set([1, 4, 9]), &set(1..=20)).unwrap();
        let b = PowersDag::configure(&set([1, 4, 9]), &set(1..=20)).unwrap();
        let pa: Vec<_> = a.nodes().map(|n| (n.power, n.parents)).collect();
        let pb: Vec<_> = b.nodes().map(|n| (n.power, n.parents)).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn parallel_apply_visits_every_node_once_and_in_dependency_order() {
        let dag = PowersDag::configure(&set([1, 2, 5]), &set(1..=32)).unwrap();
        let seen = Mutex::new(Vec::<u32>::new());
        dag.parallel_apply(4, |node| {
            let mut guard = seen.lock().unwrap();
            if let Some((a, b)) = node.parents {
                assert!(guard.contains(&a), "parent {a} before {}", node.power);
                assert!(guard.contains(&b), "parent {b} before {}", node.power);
            }
            guard.push(node.power);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        let expected: Vec<u32> = dag.nodes().map(|n| n.power).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn parallel_apply_computes_the_same_values_as_apply() {
        // Compute integer powers of 3 mod a prime through the DAG wiring.
        let dag = PowersDag::configure(&set([1, 2]), &set(1..=24)).unwrap();
        let modulus = 1_000_003u64;

        let mut sequential: BTreeMap<u32, u64> = BTreeMap::new();
        dag.apply(|node| {
            let value = match node.parents {
                None => {
                    let mut v = 1u64;
                    for _ in 0..node.power {
                        v = v * 3 % modulus;
                    }
                    v
                }
                Some((a, b)) => sequential[&a] * sequential[&b] % modulus,
            };
            sequential.insert(node.power, value);
        });

        let slots: Vec<Mutex<u64>> = (0..24).map(|_| Mutex::new(0)).collect();
        dag.parallel_apply(4, |node| {
            let value = match node.parents {
                None => {
                    let mut v = 1u64;
                    for _ in 0..node.power {
                        v = v * 3 % modulus;
                    }
                    v
                }
                Some((a, b)) => {
                    let va = *slots[a as usize - 1].lock().unwrap();
                    let vb = *slots[b as usize - 1].lock().unwrap();
                    va * vb % modulus
                }
            };
            *slots[node.power as usize - 1].lock().unwrap() = value;
        });

        for (power, value) in &sequential {
            assert_eq!(*slots[*power as usize - 1].lock().unwrap(), *value);
        }
    }
}
