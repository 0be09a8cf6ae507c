//! `TreeBuilder`: assembles the flat candidate tree fed to the target
//! verification forward from `DraftLoop`'s per-step `(score, token, parent)`
//! lists (spec §4.4). Nodes are addressed by tree-order index with `-1`
//! sentinels for missing links, never heap-allocated node objects (spec §9
//! "Tree as arrays, not pointers").
//!
//! This crate's `DraftLoop` (see `crate::draft_loop`) keeps exactly `topk`
//! active paths per step rather than exploring the full
//! `1 + K + K^2 + ... + K^S` candidate space (a literal reading of spec
//! §4.3: "keep K active paths per batch"), so the raw candidate pool this
//! builder selects from has exactly `1 + topk * speculative_num_steps`
//! nodes — matching the default `speculative_num_draft_tokens` exactly and
//! spec invariant 3's "total size per request = 1 + topk * num_steps"
//! literally. `speculative_num_draft_tokens` configured above that count is
//! therefore an invariant violation for this crate's draft loop, not merely
//! a theoretical ceiling; see `DESIGN.md`.

pub mod mask;

use std::cmp::Ordering;
use std::collections::HashMap;

use rayon::prelude::*;

use mask::TreeMask;

use crate::error::{Result, WorkerError};

/// The three per-step lists `DraftLoop` accumulates across its `S` steps,
/// one entry per `(step, request, k)` (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct DraftStepLists {
    /// `scores[step][b][k]`: cumulative path probability.
    pub scores: Vec<Vec<Vec<f32>>>,
    /// `tokens[step][b][k]`: the candidate token id (already hot-token
    /// remapped, spec invariant 5).
    pub tokens: Vec<Vec<Vec<i64>>>,
    /// `parents[step][b][k]`: local index (`0..topk`) into step `step-1`'s
    /// `k` array, or `-1` at step 0 (parent is the request's verified
    /// root).
    pub parents: Vec<Vec<Vec<i64>>>,
}

/// One request's slice of a `VerifyInput` (spec §3), in request-local node
/// indexing (node 0 is always the verified root).
#[derive(Debug, Clone)]
pub struct RequestTree {
    pub draft_tokens: Vec<i64>,
    pub positions: Vec<i64>,
    pub tree_mask: TreeMask,
    /// Local-index children, grouped for `retrive_next_token`/`_sibling`
    /// construction once node indices are made global across the batch.
    children_of: HashMap<usize, Vec<usize>>,
}

/// The full batch's flattened tree (spec §3 "VerifyInput").
pub struct BatchTree {
    pub draft_tokens: Vec<i64>,
    pub positions: Vec<i64>,
    pub retrive_index: Vec<i64>,
    pub retrive_next_token: Vec<i64>,
    pub retrive_next_sibling: Vec<i64>,
    pub tree_mask: TreeMask,
    pub seq_lens_sum: i64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    step: usize,
    k: usize,
    score: f32,
    parent_local: i64,
}

/// Selects which `(step, k)` candidates survive when
/// `draft_token_num < 1 + topk * steps`, tie-breaking by descending
/// cumulative score, then lower path index, then lower depth (spec §4.4).
/// Maintains prefix-closure (a node is only kept once its parent is kept)
/// across repeated passes, since a node's ancestors always sort no lower
/// than the node itself when scores are built by multiplying in a fresh
/// probability at each step.
fn select_kept_nodes(
    scores: &[Vec<f32>],
    parents: &[Vec<i64>],
    topk: usize,
    steps: usize,
    budget: usize,
) -> Result<Vec<Vec<bool>>> {
    let mut kept = vec![vec![false; topk]; steps];
    if budget >= steps * topk {
        for row in &mut kept {
            row.iter_mut().for_each(|k| *k = true);
        }
        return Ok(kept);
    }

    let mut candidates = Vec::with_capacity(steps * topk);
    for step in 0..steps {
        for k in 0..topk {
            candidates.push(Candidate {
                step,
                k,
                score: scores[step][k],
                parent_local: parents[step][k],
            });
        }
    }
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.k.cmp(&b.k))
            .then(a.step.cmp(&b.step))
    });

    let mut remaining = budget;
    let mut progress = true;
    while progress && remaining > 0 {
        progress = false;
        for c in &candidates {
            if remaining == 0 {
                break;
            }
            if kept[c.step][c.k] {
                continue;
            }
            let parent_kept = c.step == 0 || kept[c.step - 1][c.parent_local as usize];
            if parent_kept {
                kept[c.step][c.k] = true;
                remaining -= 1;
                progress = true;
            }
        }
    }

    if remaining > 0 {
        return Err(WorkerError::Invariant(format!(
            "tree builder could not fill the requested {budget} draft tokens from the \
             available candidate tree ({remaining} short); speculative_num_draft_tokens may \
             exceed 1 + topk * speculative_num_steps"
        )));
    }
    Ok(kept)
}

/// Builds one request's tree (spec §4.4). `seq_len` is the request's
/// current committed sequence length (node 0's position).
pub fn build_request_tree(
    verified_id: i64,
    seq_len: i64,
    lists: &DraftStepLists,
    b: usize,
    topk: usize,
    steps: usize,
    draft_token_num: usize,
) -> Result<RequestTree> {
    let scores: Vec<Vec<f32>> = (0..steps).map(|s| lists.scores[s][b].clone()).collect();
    let tokens: Vec<Vec<i64>> = (0..steps).map(|s| lists.tokens[s][b].clone()).collect();
    let parents: Vec<Vec<i64>> = (0..steps).map(|s| lists.parents[s][b].clone()).collect();

    let budget = draft_token_num
        .checked_sub(1)
        .ok_or_else(|| WorkerError::Invariant("speculative_num_draft_tokens must be >= 1".into()))?;
    let kept = select_kept_nodes(&scores, &parents, topk, steps, budget)?;

    // Assign flat indices in BFS (depth-major) order so every root-to-node
    // path has strictly increasing indices, which both keeps
    // `retrive_next_token`/`_sibling` constructible bottom-up and is what
    // makes `accepted_indices` strictly increasing per request (spec §8
    // testable property 3).
    let mut flat_of: HashMap<(usize, usize), usize> = HashMap::new();
    let mut next_flat = 1usize;
    for step in 0..steps {
        for k in 0..topk {
            if kept[step][k] {
                flat_of.insert((step, k), next_flat);
                next_flat += 1;
            }
        }
    }
    let total_nodes = next_flat;
    debug_assert_eq!(total_nodes, draft_token_num);

    let mut draft_tokens = vec![0i64; total_nodes];
    let mut positions = vec![0i64; total_nodes];
    let mut tree_mask = TreeMask::new(total_nodes, total_nodes);
    let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();

    draft_tokens[0] = verified_id;
    positions[0] = seq_len;
    tree_mask.inherit_from_parent(0, None, 0);

    for step in 0..steps {
        for k in 0..topk {
            let Some(&flat) = flat_of.get(&(step, k)) else {
                continue;
            };
            draft_tokens[flat] = tokens[step][k];
            positions[flat] = seq_len + step as i64 + 1;
            let parent_local = parents[step][k];
            let parent_flat = if step == 0 {
                0
            } else {
                *flat_of.get(&(step - 1, parent_local as usize)).ok_or_else(|| {
                    WorkerError::Invariant(format!(
                        "request {b}: kept node (step {step}, k {k}) has a pruned parent; \
                         tree selection must keep every ancestor of a kept node"
                    ))
                })?
            };
            tree_mask.inherit_from_parent(flat, Some(parent_flat), flat);
            children_of.entry(parent_flat).or_default().push(flat);
        }
    }

    Ok(RequestTree {
        draft_tokens,
        positions,
        tree_mask,
        children_of,
    })
}

/// Assembles the per-request trees into one batch-flat `VerifyInput` (spec
/// §3). `verified_ids`/`seq_lens` must be parallel to each other and to
/// `lists`'s per-request slices.
pub fn build_batch_tree(
    verified_ids: &[i64],
    seq_lens: &[i64],
    lists: &DraftStepLists,
    topk: usize,
    steps: usize,
    draft_token_num: usize,
) -> Result<BatchTree> {
    assert_eq!(verified_ids.len(), seq_lens.len());
    let batch_size = verified_ids.len();

    let mut draft_tokens = Vec::with_capacity(batch_size * draft_token_num);
    let mut positions = Vec::with_capacity(batch_size * draft_token_num);
    let mut retrive_next_token = Vec::with_capacity(batch_size * draft_token_num);
    let mut retrive_next_sibling = Vec::with_capacity(batch_size * draft_token_num);
    let mut tree_mask = TreeMask::new(batch_size * draft_token_num, draft_token_num);

    // Each request's tree only reads its own slice of `lists` and is built
    // independently of every other request's, so this fans out across
    // rayon's pool the same way the teacher's sampler distributes per-sequence
    // sampling work over `par_iter`.
    let request_trees: Vec<RequestTree> = verified_ids
        .par_iter()
        .zip(seq_lens)
        .enumerate()
        .map(|(b, (&verified_id, &seq_len))| {
            build_request_tree(verified_id, seq_len, lists, b, topk, steps, draft_token_num)
        })
        .collect::<Result<Vec<_>>>()?;

    for (b, request_tree) in request_trees.into_iter().enumerate() {
        let offset = b * draft_token_num;

        draft_tokens.extend(request_tree.draft_tokens.iter());
        positions.extend(request_tree.positions.iter());

        let mut next_token = vec![-1i64; draft_token_num];
        let mut next_sibling = vec![-1i64; draft_token_num];
        for (parent, mut kids) in request_tree.children_of {
            kids.sort_unstable();
            next_token[parent] = kids[0] as i64 + offset as i64;
            for pair in kids.windows(2) {
                next_sibling[pair[0]] = pair[1] as i64 + offset as i64;
            }
        }
        retrive_next_token.extend(next_token);
        retrive_next_sibling.extend(next_sibling);

        for local_node in 0..draft_token_num {
            for local_ancestor in request_tree.tree_mask.ancestors(local_node) {
                tree_mask.set(offset + local_node, local_ancestor);
            }
        }
    }

    let retrive_index: Vec<i64> = (0..(batch_size * draft_token_num) as i64).collect();
    let seq_lens_sum = seq_lens.iter().sum::<i64>() + (batch_size * draft_token_num) as i64;

    Ok(BatchTree {
        draft_tokens,
        positions,
        retrive_index,
        retrive_next_token,
        retrive_next_sibling,
        tree_mask,
        seq_lens_sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// K=1, S=2 comb-shaped tree: exactly one branch per request, depth 2.
    fn single_branch_lists() -> DraftStepLists {
        DraftStepLists {
            scores: vec![vec![vec![0.9]], vec![vec![0.8]]],
            tokens: vec![vec![vec![11]], vec![vec![22]]],
            parents: vec![vec![vec![-1]], vec![vec![0]]],
        }
    }

    #[test]
    fn single_branch_tree_is_a_chain() {
        let lists = single_branch_lists();
        let tree = build_request_tree(7, 10, &lists, 0, 1, 2, 3).unwrap();
        assert_eq!(tree.draft_tokens, vec![7, 11, 22]);
        assert_eq!(tree.positions, vec![10, 11, 12]);
        assert_eq!(*tree.children_of.get(&0).unwrap(), vec![1]);
        assert_eq!(*tree.children_of.get(&1).unwrap(), vec![2]);
        assert!(tree.tree_mask.get(2, 0));
        assert!(tree.tree_mask.get(2, 1));
        assert!(tree.tree_mask.get(2, 2));
        assert!(!tree.tree_mask.get(1, 2));
    }

    #[test]
    fn full_k2_s2_tree_has_five_nodes_and_valid_forest() {
        // K=2, S=2: step0 has 2 candidates (parents = root), step1 has 2
        // candidates each choosing one of the 2 step-0 parents.
        let lists = DraftStepLists {
            scores: vec![vec![vec![0.6, 0.4]], vec![vec![0.5, 0.3]]],
            tokens: vec![vec![vec![1, 2]], vec![vec![3, 4]]],
            parents: vec![vec![vec![-1, -1]], vec![vec![0, 1]]],
        };
        let tree = build_request_tree(0, 0, &lists, 0, 2, 2, 5).unwrap();
        assert_eq!(tree.draft_tokens.len(), 5);
        // node 1 (token 1) is the parent of node 3 (token 3, parent_local=0)
        assert_eq!(*tree.children_of.get(&1).unwrap(), vec![3]);
        // node 2 (token 2) is the parent of node 4 (token 4, parent_local=1)
        assert_eq!(*tree.children_of.get(&2).unwrap(), vec![4]);
    }

    #[test]
    fn pruned_tree_respects_budget_and_prefix_closure() {
        // K=2, S=2, but draft_token_num=3 forces pruning to 2 of the 4
        // non-root candidates: highest-scoring path must survive whole.
        let lists = DraftStepLists {
            scores: vec![vec![vec![0.9, 0.1]], vec![vec![0.81, 0.02]]],
            tokens: vec![vec![vec![1, 2]], vec![vec![3, 4]]],
            parents: vec![vec![vec![-1, -1]], vec![vec![0, 1]]],
        };
        let tree = build_request_tree(0, 0, &lists, 0, 2, 2, 3).unwrap();
        assert_eq!(tree.draft_tokens.len(), 3);
        // The kept chain must be root -> token 1 -> token 3 (the two
        // highest-scoring, parent-linked candidates).
        assert_eq!(tree.draft_tokens, vec![0, 1, 3]);
    }

    #[test]
    fn errors_when_budget_exceeds_available_candidates() {
        let lists = single_branch_lists();
        let err = build_request_tree(0, 0, &lists, 0, 1, 2, 10).unwrap_err();
        assert!(matches!(err, WorkerError::Invariant(_)));
    }

    #[test]
    fn batch_tree_offsets_links_across_requests() {
        let lists = single_branch_lists_batch();
        let batch = build_batch_tree(&[7, 8], &[10, 20], &lists, 1, 2, 3).unwrap();
        assert_eq!(batch.draft_tokens.len(), 6);
        // Request 1's root is global node 3; its child (local 1) is global 4.
        assert_eq!(batch.retrive_next_token[3], 4);
        assert_eq!(batch.retrive_next_token[4], 5);
        assert_eq!(batch.retrive_next_token[0], 1);
    }

    fn single_branch_lists_batch() -> DraftStepLists {
        DraftStepLists {
            scores: vec![vec![vec![0.9], vec![0.9]], vec![vec![0.8], vec![0.8]]],
            tokens: vec![vec![vec![11], vec![111]], vec![vec![22], vec![222]]],
            parents: vec![vec![vec![-1], vec![-1]], vec![vec![0], vec![0]]],
        }
    }
}
