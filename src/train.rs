use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rayon::prelude::*;

use crate::aligned::LANES;
use crate::error::{Error, Result};
use crate::grid;
use crate::model::Model;
use crate::problem::{Node, Problem};
use crate::rng::{self, XorShift64};
use crate::sched::Scheduler;
use crate::sgd::{sg_worker, SgdConf};

/// Training options. The defaults mirror the classic trainer's.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Target factor count (>= 1); rows are padded up to a multiple of 8.
    pub k: usize,
    /// Worker thread count (>= 1).
    pub nr_threads: usize,
    /// Minimum grid side; raised to 2 * nr_threads when smaller.
    pub nr_bins: usize,
    /// Number of epochs.
    pub nr_iters: usize,
    /// L2 regularization weight.
    pub lambda: f32,
    /// Base learning rate.
    pub eta: f32,
    /// Implicit-feedback confidence slope.
    pub alpha: f32,
    /// Clamp factors at zero after every update.
    pub do_nmf: bool,
    /// Weighted implicit-feedback loss instead of squared error.
    pub do_implicit: bool,
    /// Suppress per-epoch reporting.
    pub quiet: bool,
    /// Train on a copy so the caller's observation array is left untouched.
    pub copy_data: bool,
    pub seed: u64,
}

impl Default for Parameter {
    fn default() -> Self {
        Parameter {
            k: 8,
            nr_threads: 1,
            nr_bins: 20,
            nr_iters: 20,
            lambda: 0.1,
            eta: 0.1,
            alpha: 40.0,
            do_nmf: false,
            do_implicit: false,
            quiet: false,
            copy_data: true,
            seed: 0,
        }
    }
}

impl Parameter {
    fn validate(&self) -> Result<()> {
        if self.k < 1 {
            return Err(Error::InvalidParameter("k must be at least 1".into()));
        }
        if self.nr_threads < 1 {
            return Err(Error::InvalidParameter(
                "nr_threads must be at least 1".into(),
            ));
        }
        if self.nr_bins < 1 {
            return Err(Error::InvalidParameter("nr_bins must be at least 1".into()));
        }
        Ok(())
    }
}

fn calc_loss(nodes: &[Node], model: &Model) -> f64 {
    nodes
        .par_iter()
        .map(|nd| {
            let e = (nd.r - model.predict(nd.u, nd.v)) as f64;
            e * e
        })
        .sum()
}

/// Root mean squared error of the model on a problem; 0 when empty.
pub fn rmse(prob: &Problem, model: &Model) -> f64 {
    if prob.nodes.is_empty() {
        return 0.0;
    }
    (calc_loss(&prob.nodes, model) / prob.nnz() as f64).sqrt()
}

// Frobenius term of the objective, weighted by per-row occurrence counts.
fn calc_reg(model: &Model, omega_p: &[u32], omega_q: &[u32]) -> f64 {
    let half = |buf: &[f32], k: usize, omega: &[u32]| -> f64 {
        omega
            .par_iter()
            .enumerate()
            .map(|(i, &w)| {
                let row = &buf[i * k..(i + 1) * k];
                let sq: f32 = row.iter().map(|x| x * x).sum();
                w as f64 * sq as f64
            })
            .sum()
    };
    half(&model.p, model.k, omega_p) + half(&model.q, model.k, omega_q)
}

/// The block-parallel trainer: scale, permute, partition, run T workers in
/// lock-step epochs, then undo the transforms.
///
/// `held_out` blocks are excluded from scheduling; when `cv_out` is given,
/// their accumulated squared error and observation count are written to it.
fn train_blocked(
    tr_in: &mut Problem,
    va_in: Option<&mut Problem>,
    param_in: &Parameter,
    held_out: &[usize],
    cv_out: Option<&mut (f64, u64)>,
) -> Result<Model> {
    param_in.validate()?;
    let mut param = param_in.clone();
    param.nr_bins = param.nr_bins.max(2 * param.nr_threads);

    let mut tr_clone;
    let mut va_clone;
    let (tr, mut va): (&mut Problem, Option<&mut Problem>) = if param.copy_data {
        tr_clone = tr_in.clone();
        va_clone = va_in.as_deref().cloned();
        (&mut tr_clone, va_clone.as_mut())
    } else {
        (tr_in, va_in)
    };

    let mut master_rng = XorShift64::new(param.seed);
    let p_map = rng::random_map(tr.m, &mut master_rng);
    let q_map = rng::random_map(tr.n, &mut master_rng);
    tr.shuffle(&p_map, &q_map);
    if let Some(va) = va.as_deref_mut() {
        va.shuffle(&p_map, &q_map);
    }

    let grid = grid::partition(tr, param.nr_bins)?;

    let k_pad = param.k.div_ceil(LANES) * LANES;
    let mut model = Model::init(tr.m, tr.n, param.k, k_pad, &mut master_rng)?;

    let std_dev = {
        let sigma = tr.std_dev();
        // constant ratings (e.g. all-ones implicit data) degrade to scale 1
        if sigma > f32::EPSILON {
            sigma
        } else {
            1.0
        }
    };
    tr.scale(1.0 / std_dev);
    if let Some(va) = va.as_deref_mut() {
        va.scale(1.0 / std_dev);
    }
    param.lambda /= std_dev;

    let sched = Scheduler::new(param.nr_bins, param.nr_threads, held_out, master_rng.next());

    let mut omega_p = vec![0u32; tr.m as usize];
    let mut omega_q = vec![0u32; tr.n as usize];
    for nd in &tr.nodes {
        omega_p[nd.u as usize] += 1;
        omega_q[nd.v as usize] += 1;
    }

    let mut pg = vec![1.0f32; 2 * tr.m as usize];
    let mut qg = vec![1.0f32; 2 * tr.n as usize];
    let slow_only = AtomicBool::new(true);

    let conf = SgdConf {
        k_pad,
        eta: param.eta,
        lambda: param.lambda,
        alpha: param.alpha,
        do_nmf: param.do_nmf,
        do_implicit: param.do_implicit,
    };

    let p_raw = model.p.raw() as usize;
    let q_raw = model.q.raw() as usize;
    let pg_raw = pg.as_mut_ptr() as usize;
    let qg_raw = qg.as_mut_ptr() as usize;

    let sigma2 = (std_dev as f64) * (std_dev as f64);
    let va_ref: Option<&Problem> = va.as_deref();

    thread::scope(|s| {
        for _ in 0..param.nr_threads {
            let nodes = &tr.nodes;
            let ptrs = &grid.ptrs;
            let conf = &conf;
            let slow_only = &slow_only;
            let sched = &sched;
            s.spawn(move || {
                sg_worker(
                    nodes, ptrs, p_raw, q_raw, pg_raw, qg_raw, conf, slow_only, sched,
                )
            });
        }

        if !param.quiet {
            if va_ref.map_or(false, |va| va.nnz() > 0) {
                println!("{:>4}{:>10}{:>10}{:>13}", "iter", "tr_rmse", "va_rmse", "obj");
            } else {
                println!("{:>4}{:>10}{:>13}", "iter", "tr_rmse", "obj");
            }
        }

        for iter in 0..param.nr_iters {
            sched.wait_for_jobs_done();

            if !param.quiet {
                let tr_loss = sched.get_loss() * sigma2;
                let tr_rmse = (tr_loss / tr.nnz() as f64).sqrt();
                let reg = calc_reg(&model, &omega_p, &omega_q) * param.lambda as f64 * sigma2;
                match va_ref {
                    Some(va) if va.nnz() > 0 => {
                        let va_rmse = rmse(va, &model) * std_dev as f64;
                        println!(
                            "{:>4}{:>10.4}{:>10.4}{:>13.4e}",
                            iter,
                            tr_rmse,
                            va_rmse,
                            reg + tr_loss
                        );
                    }
                    _ => println!("{:>4}{:>10.4}{:>13.4e}", iter, tr_rmse, reg + tr_loss),
                }
            }

            if iter == 0 {
                slow_only.store(false, Ordering::Release);
            }
            sched.resume();
        }
        sched.terminate();
    });

    if !param.quiet {
        let loss = calc_loss(&tr.nodes, &model) * sigma2;
        println!("real tr_rmse = {:.4}", (loss / tr.nnz() as f64).sqrt());
    }

    // held-out loss is taken while model and problem are still in
    // scaled/permuted space
    if let Some(cv) = cv_out {
        let mut loss = 0.0f64;
        let mut count = 0u64;
        for &block in held_out {
            let range = grid.block_range(block);
            count += range.len() as u64;
            loss += calc_loss(&tr.nodes[range], &model);
        }
        *cv = (loss * sigma2, count);
    }

    let mut inv_p = rng::invert_map(&p_map);
    let mut inv_q = rng::invert_map(&q_map);

    if !param.copy_data {
        tr.scale(std_dev);
        tr.shuffle(&inv_p, &inv_q);
        if let Some(va) = va.as_deref_mut() {
            va.scale(std_dev);
            va.shuffle(&inv_p, &inv_q);
        }
    }

    model.scale_factors(std_dev.sqrt());
    model.shrink(param.k);
    model.unshuffle(&mut inv_p, &mut inv_q);

    Ok(model)
}

/// Train a model on `prob`.
pub fn train(prob: &mut Problem, param: &Parameter) -> Result<Model> {
    train_blocked(prob, None, param, &[], None)
}

/// Train on `tr`, additionally reporting RMSE on `va` every epoch.
pub fn train_with_validation(
    tr: &mut Problem,
    va: &mut Problem,
    param: &Parameter,
) -> Result<Model> {
    train_blocked(tr, Some(va), param, &[], None)
}

// Shuffle the block ids and split them into `nr_folds` contiguous fold
// lists; the last fold absorbs the remainder so every block is held out
// exactly once.
fn fold_blocks(nr_blocks: usize, nr_folds: usize, rng: &mut XorShift64) -> Vec<Vec<usize>> {
    let mut blocks: Vec<usize> = (0..nr_blocks).collect();
    rng.shuffle(&mut blocks);
    let per_fold = nr_blocks / nr_folds;
    (0..nr_folds)
        .map(|fold| {
            let begin = fold * per_fold;
            let end = if fold == nr_folds - 1 {
                nr_blocks
            } else {
                begin + per_fold
            };
            blocks[begin..end].to_vec()
        })
        .collect()
}

/// K-fold cross-validation over grid blocks; returns the overall held-out
/// RMSE.
pub fn cross_validate(prob: &mut Problem, nr_folds: usize, param: &Parameter) -> Result<f32> {
    if nr_folds < 2 {
        return Err(Error::InvalidParameter(
            "nr_folds must be at least 2".into(),
        ));
    }
    param.validate()?;

    let quiet = param.quiet;
    let mut param = param.clone();
    param.quiet = true;
    // fold block ids must refer to the same grid the trainer will build
    param.nr_bins = param.nr_bins.max(2 * param.nr_threads);

    let mut rng = XorShift64::new(param.seed);
    let folds = fold_blocks(param.nr_bins * param.nr_bins, nr_folds, &mut rng);

    if !quiet {
        println!("{:>4}{:>10}", "fold", "rmse");
    }

    let mut loss = 0.0f64;
    let mut count = 0u64;
    for (fold, blocks) in folds.iter().enumerate() {
        let mut cv = (0.0f64, 0u64);
        train_blocked(prob, None, &param, blocks, Some(&mut cv))?;
        let fold_rmse = if cv.1 > 0 {
            (cv.0 / cv.1 as f64).sqrt()
        } else {
            0.0
        };
        if !quiet {
            println!("{:>4}{:>10.4}", fold, fold_rmse);
        }
        loss += cv.0;
        count += cv.1;
    }

    let overall = if count > 0 {
        (loss / count as f64).sqrt()
    } else {
        0.0
    };
    if !quiet {
        println!("==============");
        println!("{:>4}{:>10.4}", "avg", overall);
    }
    Ok(overall as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn folds_cover_every_block_exactly_once() {
        let mut rng = XorShift64::new(5);
        let folds = fold_blocks(100, 5, &mut rng);
        assert_eq!(folds.len(), 5);
        assert!(folds.iter().all(|f| f.len() == 20));
        let all: HashSet<usize> = folds.iter().flatten().copied().collect();
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn last_fold_takes_the_remainder() {
        let mut rng = XorShift64::new(5);
        let folds = fold_blocks(103, 4, &mut rng);
        assert_eq!(folds[0].len(), 25);
        assert_eq!(folds[3].len(), 28);
        let all: HashSet<usize> = folds.iter().flatten().copied().collect();
        assert_eq!(all.len(), 103);
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let mut prob = Problem::new(2, 2, vec![Node { u: 0, v: 0, r: 1.0 }]);
        for bad in [
            Parameter {
                k: 0,
                ..Parameter::default()
            },
            Parameter {
                nr_threads: 0,
                ..Parameter::default()
            },
            Parameter {
                nr_bins: 0,
                ..Parameter::default()
            },
        ] {
            assert!(matches!(
                train(&mut prob, &bad),
                Err(Error::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn out_of_range_observation_aborts_training() {
        let mut prob = Problem::new(2, 2, vec![Node { u: 5, v: 0, r: 1.0 }]);
        let param = Parameter {
            quiet: true,
            ..Parameter::default()
        };
        assert!(matches!(
            train(&mut prob, &param),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn copy_data_leaves_the_problem_untouched() {
        let nodes = vec![
            Node { u: 0, v: 0, r: 5.0 },
            Node { u: 1, v: 1, r: 3.0 },
            Node { u: 2, v: 2, r: 1.0 },
        ];
        let mut prob = Problem::new(3, 3, nodes.clone());
        let param = Parameter {
            k: 2,
            nr_iters: 3,
            quiet: true,
            ..Parameter::default()
        };
        train(&mut prob, &param).unwrap();
        assert_eq!(prob.nodes, nodes);
    }

    #[test]
    fn in_place_training_restores_ratings_and_ids() {
        let nodes = vec![
            Node { u: 0, v: 1, r: 5.0 },
            Node { u: 1, v: 0, r: 3.0 },
            Node { u: 2, v: 2, r: 1.0 },
            Node { u: 0, v: 2, r: 4.0 },
        ];
        let mut prob = Problem::new(3, 3, nodes.clone());
        let param = Parameter {
            k: 2,
            nr_iters: 3,
            quiet: true,
            copy_data: false,
            ..Parameter::default()
        };
        train(&mut prob, &param).unwrap();
        // the array order may differ but the observations must round-trip
        let canon = |xs: &[Node]| {
            let mut v: Vec<(u32, u32, i64)> = xs
                .iter()
                .map(|nd| (nd.u, nd.v, (nd.r * 1e4).round() as i64))
                .collect();
            v.sort_unstable();
            v
        };
        assert_eq!(canon(&prob.nodes), canon(&nodes));
    }
}
