//! The packed ancestor bitset consumed by the target attention kernel to
//! restrict attention to valid lineages (spec §3 "VerifyInput", glossary
//! "Tree mask"). Represented as flat words per node rather than a
//! `Vec<bool>` matrix so it ships to device kernels the same shape a real
//! attention backend expects (spec §9 "Tree as arrays, not pointers").

const WORD_BITS: usize = 64;

/// `tree_mask[n]` is the bitset of every ancestor of node `n`, including
/// itself, restricted to `n`'s own request's `nodes_per_request` tree slots
/// (cross-request attention never happens, so the mask need not span the
/// whole batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMask {
    nodes_per_request: usize,
    words_per_row: usize,
    rows: Vec<Vec<u64>>,
}

impl TreeMask {
    pub fn new(num_nodes: usize, nodes_per_request: usize) -> Self {
        let words_per_row = ceil_div(nodes_per_request, WORD_BITS);
        Self {
            nodes_per_request,
            words_per_row,
            rows: vec![vec![0u64; words_per_row]; num_nodes],
        }
    }

    pub fn nodes_per_request(&self) -> usize {
        self.nodes_per_request
    }

    pub fn num_nodes(&self) -> usize {
        self.rows.len()
    }

    /// Marks `local_ancestor` (an index in `[0, nodes_per_request)`) as an
    /// ancestor of flat node `node`.
    pub fn set(&mut self, node: usize, local_ancestor: usize) {
        let (word, bit) = (local_ancestor / WORD_BITS, local_ancestor % WORD_BITS);
        self.rows[node][word] |= 1u64 << bit;
    }

    pub fn get(&self, node: usize, local_ancestor: usize) -> bool {
        let (word, bit) = (local_ancestor / WORD_BITS, local_ancestor % WORD_BITS);
        (self.rows[node][word] >> bit) & 1 == 1
    }

    /// All local ancestor indices set for `node`, ascending.
    pub fn ancestors(&self, node: usize) -> Vec<usize> {
        (0..self.nodes_per_request)
            .filter(|&j| self.get(node, j))
            .collect()
    }

    /// Builds `node`'s row as the union of its parent's row with `node`'s
    /// own local index, i.e. "ancestors of my parent, plus myself" — the
    /// recurrence that makes the mask reflexive and transitive by
    /// construction (spec §8 testable property 5).
    pub fn inherit_from_parent(&mut self, node: usize, parent_node: Option<usize>, local_index: usize) {
        if let Some(parent) = parent_node {
            let parent_row = self.rows[parent].clone();
            self.rows[node] = parent_row;
        }
        self.set(node, local_index);
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}
