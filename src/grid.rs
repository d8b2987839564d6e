use std::ops::Range;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::problem::{Node, Problem};

/// Block decomposition of a problem: after [`partition`], block `b` owns the
/// contiguous node range `ptrs[b]..ptrs[b + 1]`.
pub struct Grid {
    pub nr_bins: usize,
    pub ptrs: Vec<usize>,
}

impl Grid {
    pub fn nr_blocks(&self) -> usize {
        self.nr_bins * self.nr_bins
    }

    pub fn block_range(&self, block: usize) -> Range<usize> {
        self.ptrs[block]..self.ptrs[block + 1]
    }
}

/// Reorder the node array so each of the B x B blocks is contiguous, then
/// sort each block along the longer matrix axis for sequential row reuse.
///
/// Runs in O(nnz) time (the sort ranges are disjoint) with O(B^2) extra
/// space. Observations outside the matrix are rejected outright.
pub fn partition(prob: &mut Problem, nr_bins: usize) -> Result<Grid> {
    let nb = nr_bins;
    let (m, n) = (prob.m as usize, prob.n as usize);
    for nd in &prob.nodes {
        if nd.u as usize >= m || nd.v as usize >= n {
            return Err(Error::IndexOutOfRange {
                u: nd.u,
                v: nd.v,
                m: prob.m,
                n: prob.n,
            });
        }
    }

    let seg_p = m.div_ceil(nb).max(1);
    let seg_q = n.div_ceil(nb).max(1);
    let block_of = |nd: &Node| (nd.u as usize / seg_p) * nb + nd.v as usize / seg_q;

    let mut counts = vec![0usize; nb * nb];
    for nd in &prob.nodes {
        counts[block_of(nd)] += 1;
    }
    let mut ptrs = vec![0usize; nb * nb + 1];
    for b in 0..nb * nb {
        ptrs[b + 1] = ptrs[b] + counts[b];
    }

    // In-place block grouping: walk each block's range with a write pivot,
    // swapping strays to the front of their own block's unfilled region.
    let mut pivots: Vec<usize> = ptrs[..nb * nb].to_vec();
    for b in 0..nb * nb {
        while pivots[b] < ptrs[b + 1] {
            let cur = block_of(&prob.nodes[pivots[b]]);
            if cur == b {
                pivots[b] += 1;
                continue;
            }
            let dst = pivots[cur];
            prob.nodes.swap(pivots[b], dst);
            pivots[cur] += 1;
        }
    }

    let by_user = m > n;
    let mut blocks: Vec<&mut [Node]> = Vec::with_capacity(nb * nb);
    let mut rest: &mut [Node] = &mut prob.nodes;
    for b in 0..nb * nb {
        let (head, tail) = rest.split_at_mut(ptrs[b + 1] - ptrs[b]);
        blocks.push(head);
        rest = tail;
    }
    blocks.into_par_iter().for_each(|block| {
        if by_user {
            block.sort_unstable_by_key(|nd| (nd.u, nd.v));
        } else {
            block.sort_unstable_by_key(|nd| (nd.v, nd.u));
        }
    });

    Ok(Grid { nr_bins: nb, ptrs })
}
