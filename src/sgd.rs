use std::sync::atomic::{AtomicBool, Ordering};

use crate::aligned::LANES;
use crate::problem::Node;
use crate::sched::Scheduler;

/// Fast inverse square root. Precision matches the SIMD `rsqrt` class of
/// instructions (relative error well under 1e-3 after one Newton step).
#[inline(always)]
pub(crate) fn qrsqrt(x: f32) -> f32 {
    let half = 0.5 * x;
    let y = f32::from_bits(0x5f37_5a86 - (x.to_bits() >> 1));
    y * (1.5 - half * y * y)
}

// ── 8-wide unrolled dot product over padded rows ──────────────────────────
// Rows are k_pad long with k_pad a multiple of 8, so there is no tail loop.
#[inline(always)]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len() % LANES, 0);
    let (mut s0, mut s1, mut s2, mut s3) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let (mut s4, mut s5, mut s6, mut s7) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let mut idx = 0;
    while idx < a.len() {
        unsafe {
            s0 += *a.get_unchecked(idx) * *b.get_unchecked(idx);
            s1 += *a.get_unchecked(idx + 1) * *b.get_unchecked(idx + 1);
            s2 += *a.get_unchecked(idx + 2) * *b.get_unchecked(idx + 2);
            s3 += *a.get_unchecked(idx + 3) * *b.get_unchecked(idx + 3);
            s4 += *a.get_unchecked(idx + 4) * *b.get_unchecked(idx + 4);
            s5 += *a.get_unchecked(idx + 5) * *b.get_unchecked(idx + 5);
            s6 += *a.get_unchecked(idx + 6) * *b.get_unchecked(idx + 6);
            s7 += *a.get_unchecked(idx + 7) * *b.get_unchecked(idx + 7);
        }
        idx += LANES;
    }
    (s0 + s1 + s2 + s3) + (s4 + s5 + s6 + s7)
}

/// AdaGrad step over one sub-vector of a (p-row, q-row) pair.
///
/// `pg`/`qg` are the sub-vector's shared squared-gradient accumulators; the
/// per-coordinate sums are averaged into them with the `rk` factor.
#[inline(always)]
pub(crate) fn sg_update(
    p: &mut [f32],
    q: &mut [f32],
    pg: &mut f32,
    qg: &mut f32,
    eta: f32,
    lambda: f32,
    e: f32,
    rk: f32,
    do_nmf: bool,
) {
    let eta_p = eta * qrsqrt(*pg);
    let eta_q = eta * qrsqrt(*qg);

    let mut pg1 = 0.0f32;
    let mut qg1 = 0.0f32;

    for (pd, qd) in p.iter_mut().zip(q.iter_mut()) {
        let gp = lambda * *pd - e * *qd;
        let gq = lambda * *qd - e * *pd;

        pg1 += gp * gp;
        qg1 += gq * gq;

        *pd -= eta_p * gp;
        *qd -= eta_q * gq;

        if do_nmf {
            *pd = pd.max(0.0);
            *qd = qd.max(0.0);
        }
    }

    *pg += pg1 * rk;
    *qg += qg1 * rk;
}

/// Per-run constants for the worker kernel, already in 1/sigma space.
pub(crate) struct SgdConf {
    pub k_pad: usize,
    pub eta: f32,
    pub lambda: f32,
    pub alpha: f32,
    pub do_nmf: bool,
    pub do_implicit: bool,
}

/// One worker's training loop: pull conflict-free blocks until termination.
///
/// `p_raw`/`q_raw` point at the padded factor matrices and `pg_raw`/`qg_raw`
/// at the 2-per-row adaptive-rate slots. The scheduler guarantees no two
/// live assignments share a row or column strip, so the raw row writes
/// below never race.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sg_worker(
    nodes: &[Node],
    ptrs: &[usize],
    p_raw: usize,
    q_raw: usize,
    pg_raw: usize,
    qg_raw: usize,
    conf: &SgdConf,
    slow_only: &AtomicBool,
    sched: &Scheduler,
) {
    let p_base = p_raw as *mut f32;
    let q_base = q_raw as *mut f32;
    let pg_base = pg_raw as *mut f32;
    let qg_base = qg_raw as *mut f32;

    let rk_slow = 1.0 / LANES as f32;
    let rk_fast = if conf.k_pad > LANES {
        1.0 / (conf.k_pad - LANES) as f32
    } else {
        0.0
    };

    loop {
        let block = sched.get_job();
        let fast = !slow_only.load(Ordering::Acquire) && conf.k_pad > LANES;
        let mut loss = 0.0f64;

        for nd in &nodes[ptrs[block]..ptrs[block + 1]] {
            let u = nd.u as usize;
            let v = nd.v as usize;
            // SAFETY: u and v were bounds-checked at partition time; the
            // scheduler keeps this block's row and column strips exclusive
            // to this worker, so no other thread touches these rows or
            // adaptive-rate slots.
            let (p, q, pg0, pg1, qg0, qg1) = unsafe {
                (
                    std::slice::from_raw_parts_mut(p_base.add(u * conf.k_pad), conf.k_pad),
                    std::slice::from_raw_parts_mut(q_base.add(v * conf.k_pad), conf.k_pad),
                    &mut *pg_base.add(2 * u),
                    &mut *pg_base.add(2 * u + 1),
                    &mut *qg_base.add(2 * v),
                    &mut *qg_base.add(2 * v + 1),
                )
            };

            let yhat = dot(p, q);
            let e = if conf.do_implicit {
                let pref = if nd.r > 0.0 { 1.0f32 } else { 0.0 };
                let c = 1.0 + conf.alpha * nd.r;
                let e = pref - yhat;
                loss += (c * e * e) as f64;
                c * e
            } else {
                let e = nd.r - yhat;
                loss += (e * e) as f64;
                e
            };

            let (p_slow, p_fast) = p.split_at_mut(LANES);
            let (q_slow, q_fast) = q.split_at_mut(LANES);

            sg_update(
                p_slow, q_slow, pg0, qg0, conf.eta, conf.lambda, e, rk_slow, conf.do_nmf,
            );

            if fast {
                sg_update(
                    p_fast, q_fast, pg1, qg1, conf.eta, conf.lambda, e, rk_fast, conf.do_nmf,
                );
            }
        }

        sched.put_job(block, loss);
        if sched.is_terminated() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn qrsqrt_tracks_exact_rsqrt() {
        for &x in &[1e-4f32, 0.5, 1.0, 2.0, 100.0, 1e6] {
            assert_relative_eq!(qrsqrt(x), 1.0 / x.sqrt(), max_relative = 1e-3);
        }
    }

    #[test]
    fn dot_matches_scalar_sum() {
        let a: Vec<f32> = (0..24).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..24).map(|i| 1.0 - i as f32 * 0.1).collect();
        let expect: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert_relative_eq!(dot(&a, &b), expect, max_relative = 1e-5);
    }

    #[test]
    fn update_leaves_zero_lanes_at_zero() {
        // lanes where both factors are zero have zero gradient under any
        // error, which is what keeps k..k_pad padding inert
        let mut p = vec![0.5, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut q = vec![0.1, -0.3, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let (mut pg, mut qg) = (1.0f32, 1.0f32);
        sg_update(&mut p, &mut q, &mut pg, &mut qg, 0.1, 0.05, 0.7, 0.125, false);
        for d in 2..8 {
            assert_eq!(p[d], 0.0);
            assert_eq!(q[d], 0.0);
        }
        assert!(pg > 1.0 && qg > 1.0);
    }

    #[test]
    fn update_accumulates_mean_squared_gradient() {
        let mut p = vec![1.0f32; 8];
        let mut q = vec![1.0f32; 8];
        let (mut pg, mut qg) = (1.0f32, 1.0f32);
        let (lambda, e) = (0.0f32, 2.0f32);
        // gradient is -e per lane, so the mean squared gradient is e^2
        sg_update(&mut p, &mut q, &mut pg, &mut qg, 0.0, lambda, e, 1.0 / 8.0, false);
        assert_relative_eq!(pg, 1.0 + e * e, max_relative = 1e-5);
        assert_relative_eq!(qg, 1.0 + e * e, max_relative = 1e-5);
    }

    #[test]
    fn nmf_clamps_negative_factors() {
        let mut p = vec![0.01f32; 8];
        let mut q = vec![0.9f32; 8];
        let (mut pg, mut qg) = (1.0f32, 1.0f32);
        // large negative error pushes factors down hard
        sg_update(&mut p, &mut q, &mut pg, &mut qg, 1.0, 0.0, -5.0, 0.125, true);
        assert!(p.iter().all(|&x| x >= 0.0));
        assert!(q.iter().all(|&x| x >= 0.0));
    }
}
