//! HDBSCAN core: mutual-reachability MST plus stability-based extraction.
//!
//! Steps: core distances (k-th neighbour), mutual reachability
//! `max(core_i, core_j, d(i,j))`, Prim MST over that graph, a condensed
//! cluster tree built by replaying MST edges in ascending order, and
//! bottom-up selection of the most stable clusters. Points outside every
//! selected cluster are noise (-1). O(n^2) time and space.

use crate::structs::{Error, Result};
use ndarray::ArrayView2;

pub const NOISE: i64 = -1;

struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Root of `x` without path compression.
    fn peek(&self, mut x: usize) -> usize {
        while self.parent[x] != x {
            x = self.parent[x];
        }
        x
    }

    fn union_roots(&mut self, a: usize, b: usize) -> usize {
        let (big, small) = if self.size[a] >= self.size[b] {
            (a, b)
        } else {
            (b, a)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        big
    }
}

/// Either a point leaving a cluster (`child < n`, size 1) or a cluster
/// splitting off a child cluster (`child >= n`).
struct TreeEdge {
    parent: usize,
    child: usize,
    /// 1 / merge distance.
    lambda: f64,
    child_size: usize,
}

/// Run HDBSCAN over row vectors, returning labels with -1 for noise.
///
/// # Errors
/// Returns `Error::Validation` for empty input or out-of-range parameters.
pub fn run(
    data: ArrayView2<'_, f64>,
    min_cluster_size: usize,
    min_samples: Option<usize>,
) -> Result<Vec<i64>> {
    let n = data.nrows();
    if n == 0 {
        return Err(Error::Validation("HDBSCAN requires a non-empty input".into()));
    }
    if min_cluster_size < 2 {
        return Err(Error::Validation(
            "min_cluster_size must be at least 2".into(),
        ));
    }
    let min_samples = min_samples.unwrap_or(min_cluster_size).max(1);
    if n == 1 {
        return Ok(vec![NOISE]);
    }

    let dists = pairwise(data);
    let core = core_distances(&dists, n, min_samples);

    let mut mst = prim_mst(n, |i, j| {
        dists[i * n + j].max(core[i]).max(core[j])
    });
    mst.sort_by(|a, b| a.2.total_cmp(&b.2));

    Ok(condense_and_label(&mst, n, min_cluster_size))
}

fn pairwise(data: ArrayView2<'_, f64>) -> Vec<f64> {
    let n = data.nrows();
    let mut dists = vec![0.0f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            dists[i * n + j] = d;
            dists[j * n + i] = d;
        }
    }
    dists
}

fn core_distances(dists: &[f64], n: usize, min_samples: usize) -> Vec<f64> {
    let k = min_samples.min(n - 1).max(1);
    (0..n)
        .map(|i| {
            let mut row: Vec<f64> = (0..n).filter(|&j| j != i).map(|j| dists[i * n + j]).collect();
            row.sort_by(f64::total_cmp);
            row[k - 1]
        })
        .collect()
}

/// Dense-graph Prim MST; `weight(i, j)` must be symmetric.
fn prim_mst(n: usize, weight: impl Fn(usize, usize) -> f64) -> Vec<(usize, usize, f64)> {
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut best_from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    in_tree[0] = true;
    for j in 1..n {
        best[j] = weight(0, j);
    }

    for _ in 1..n {
        let next = (0..n)
            .filter(|&j| !in_tree[j])
            .min_by(|&a, &b| best[a].total_cmp(&best[b]));
        let Some(next) = next else { break };

        edges.push((best_from[next], next, best[next]));
        in_tree[next] = true;

        for j in 0..n {
            if !in_tree[j] {
                let w = weight(next, j);
                if w < best[j] {
                    best[j] = w;
                    best_from[j] = next;
                }
            }
        }
    }
    edges
}

/// Replay MST edges ascending, building the condensed tree, then pick the
/// most stable non-overlapping clusters and label their points.
#[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
fn condense_and_label(mst: &[(usize, usize, f64)], n: usize, min_cluster_size: usize) -> Vec<i64> {
    // Cluster ids start at n; 0..n are point ids.
    let mut next_id = n;
    let mut uf = UnionFind::new(n);
    let mut component_cluster: Vec<Option<usize>> = vec![None; n];
    let mut tree: Vec<TreeEdge> = Vec::new();

    let fallout = |tree: &mut Vec<TreeEdge>, uf: &UnionFind, root: usize, parent: usize, lambda: f64| {
        for p in 0..n {
            if uf.peek(p) == root {
                tree.push(TreeEdge {
                    parent,
                    child: p,
                    lambda,
                    child_size: 1,
                });
            }
        }
    };

    for &(u, v, dist) in mst {
        let ru = uf.find(u);
        let rv = uf.find(v);
        if ru == rv {
            continue;
        }

        let lambda = if dist > 0.0 { 1.0 / dist } else { f64::INFINITY };
        let size_u = uf.size[ru];
        let size_v = uf.size[rv];
        let u_big = size_u >= min_cluster_size;
        let v_big = size_v >= min_cluster_size;

        if u_big && v_big {
            // True split: a new parent cluster with two cluster children.
            let parent = next_id;
            next_id += 1;

            let child_of = |root: usize, size: usize,
                                tree: &mut Vec<TreeEdge>,
                                component_cluster: &mut Vec<Option<usize>>,
                                next_id: &mut usize,
                                uf: &UnionFind| {
                let child = component_cluster[root].unwrap_or_else(|| {
                    let id = *next_id;
                    *next_id += 1;
                    id
                });
                tree.push(TreeEdge {
                    parent,
                    child,
                    lambda,
                    child_size: size,
                });
                if component_cluster[root].is_none() {
                    for p in 0..n {
                        if uf.peek(p) == root {
                            tree.push(TreeEdge {
                                parent: child,
                                child: p,
                                lambda,
                                child_size: 1,
                            });
                        }
                    }
                }
                child
            };
            let _ = child_of(ru, size_u, &mut tree, &mut component_cluster, &mut next_id, &uf);
            let _ = child_of(rv, size_v, &mut tree, &mut component_cluster, &mut next_id, &uf);

            let root = uf.union_roots(ru, rv);
            component_cluster[root] = Some(parent);
        } else if u_big || v_big {
            let (big, small) = if u_big { (ru, rv) } else { (rv, ru) };

            let cluster = if let Some(c) = component_cluster[big] {
                c
            } else {
                let id = next_id;
                next_id += 1;
                fallout(&mut tree, &uf, big, id, lambda);
                id
            };
            fallout(&mut tree, &uf, small, cluster, lambda);

            let root = uf.union_roots(big, small);
            component_cluster[root] = Some(cluster);
        } else {
            // Both below min size; merge without a cluster event.
            let existing = component_cluster[ru].or(component_cluster[rv]);
            let root = uf.union_roots(ru, rv);
            component_cluster[root] = existing;
        }
    }

    let n_clusters = next_id - n;
    if n_clusters == 0 {
        return vec![NOISE; n];
    }

    // Birth lambda: the split that created the cluster (root stays 0).
    let mut birth = vec![0.0f64; n_clusters];
    for edge in &tree {
        if edge.child >= n && edge.child_size > 1 {
            birth[edge.child - n] = edge.lambda;
        }
    }

    // stability(c) = sum over edges out of c of child_size * (lambda - birth).
    let mut stability = vec![0.0f64; n_clusters];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n_clusters];
    for edge in &tree {
        if edge.parent < n {
            continue;
        }
        let c = edge.parent - n;
        let term = edge.child_size as f64 * (edge.lambda - birth[c]);
        if term.is_finite() {
            stability[c] += term;
        }
        if edge.child >= n && edge.child_size > 1 {
            children[c].push(edge.child - n);
        }
    }

    // Bottom-up selection: ids grow upward, so reverse order walks leaves first.
    let mut selected = vec![false; n_clusters];
    let mut subtree_stability = stability.clone();
    for c in (0..n_clusters).rev() {
        if children[c].is_empty() {
            selected[c] = true;
        } else {
            let child_sum: f64 = children[c].iter().map(|&k| subtree_stability[k]).sum();
            if stability[c] > child_sum {
                selected[c] = true;
                deselect_below(&children, c, &mut selected);
                subtree_stability[c] = stability[c];
            } else {
                subtree_stability[c] = child_sum;
            }
        }
    }

    // Compact labels for selected clusters, in id order.
    let mut labels = vec![NOISE; n];
    let mut next_label = 0i64;
    for c in 0..n_clusters {
        if selected[c] {
            label_points(&tree, &selected, n, c, next_label, &mut labels);
            next_label += 1;
        }
    }
    labels
}

fn deselect_below(children: &[Vec<usize>], node: usize, selected: &mut [bool]) {
    for &child in &children[node] {
        selected[child] = false;
        deselect_below(children, child, selected);
    }
}

/// Label direct point fallouts plus all non-selected descendant subtrees.
fn label_points(
    tree: &[TreeEdge],
    selected: &[bool],
    n: usize,
    cluster: usize,
    label: i64,
    labels: &mut [i64],
) {
    let id = cluster + n;
    for edge in tree {
        if edge.parent != id {
            continue;
        }
        if edge.child < n {
            labels[edge.child] = label;
        } else if !selected[edge.child - n] {
            label_points(tree, selected, n, edge.child - n, label, labels);
        }
    }
}
