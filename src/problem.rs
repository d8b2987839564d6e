use rayon::prelude::*;

use crate::error::{Error, Result};

/// One observed rating: user `u` gave item `v` the value `r`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Node {
    pub u: u32,
    pub v: u32,
    pub r: f32,
}

/// A sparse rating matrix in coordinate form.
///
/// The node array is reordered in place by the grid partitioner and its
/// ratings are rescaled during training; it remains a permutation of the
/// original observations throughout.
#[derive(Clone, Debug, Default)]
pub struct Problem {
    pub m: u32,
    pub n: u32,
    pub nodes: Vec<Node>,
}

impl Problem {
    pub fn new(m: u32, n: u32, nodes: Vec<Node>) -> Self {
        Self { m, n, nodes }
    }

    /// Build a problem from parallel COO arrays, rejecting out-of-range ids.
    pub fn from_coo(m: u32, n: u32, users: &[i32], items: &[i32], ratings: &[f32]) -> Result<Self> {
        if users.len() != items.len() || users.len() != ratings.len() {
            return Err(Error::InvalidParameter(
                "users, items and ratings must have equal length".into(),
            ));
        }
        let mut nodes = Vec::with_capacity(users.len());
        for ((&u, &v), &r) in users.iter().zip(items).zip(ratings) {
            if u < 0 || u as u32 >= m || v < 0 || v as u32 >= n {
                return Err(Error::IndexOutOfRange {
                    u: u as u32,
                    v: v as u32,
                    m,
                    n,
                });
            }
            nodes.push(Node {
                u: u as u32,
                v: v as u32,
                r,
            });
        }
        Ok(Self { m, n, nodes })
    }

    pub fn nnz(&self) -> usize {
        self.nodes.len()
    }

    /// Population standard deviation of the ratings; 0 for an empty problem.
    pub fn std_dev(&self) -> f32 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let nnz = self.nodes.len() as f64;
        let avg = self.nodes.par_iter().map(|nd| nd.r as f64).sum::<f64>() / nnz;
        let var = self
            .nodes
            .par_iter()
            .map(|nd| {
                let d = nd.r as f64 - avg;
                d * d
            })
            .sum::<f64>()
            / nnz;
        var.sqrt() as f32
    }

    /// Multiply every rating by `factor` in place.
    pub fn scale(&mut self, factor: f32) {
        self.nodes.par_iter_mut().for_each(|nd| nd.r *= factor);
    }

    /// Rewrite user/item ids through the given maps. Ids beyond a map's
    /// range are kept as-is, which lets validation sets reference users or
    /// items the training set never saw.
    pub fn shuffle(&mut self, p_map: &[u32], q_map: &[u32]) {
        self.nodes.par_iter_mut().for_each(|nd| {
            if (nd.u as usize) < p_map.len() {
                nd.u = p_map[nd.u as usize];
            }
            if (nd.v as usize) < q_map.len() {
                nd.v = q_map[nd.v as usize];
            }
        });
    }
}
