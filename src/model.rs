use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rayon::prelude::*;

use crate::aligned::AlignedVec;
use crate::error::{Error, Result};
use crate::rng::XorShift64;

/// A trained factorization: `predict(u, v)` is the inner product of user
/// row `u` of P and item row `v` of Q over `k` dimensions.
///
/// During training `k` is the padded row stride; the driver shrinks it back
/// to the requested factor count before handing the model to the caller.
pub struct Model {
    pub m: u32,
    pub n: u32,
    pub k: usize,
    pub(crate) p: AlignedVec,
    pub(crate) q: AlignedVec,
}

impl Model {
    /// Fresh model with entries uniform in [0, sqrt(1/k)) and the padding
    /// lanes `k_real..k_pad` of every row zeroed.
    pub(crate) fn init(
        m: u32,
        n: u32,
        k_real: usize,
        k_pad: usize,
        rng: &mut XorShift64,
    ) -> Result<Self> {
        let mut p = AlignedVec::zeroed(m as usize * k_pad)?;
        let mut q = AlignedVec::zeroed(n as usize * k_pad)?;
        let scale = (1.0 / k_real as f32).sqrt();
        for row in p.chunks_mut(k_pad) {
            for x in &mut row[..k_real] {
                *x = rng.next_float() * scale;
            }
        }
        for row in q.chunks_mut(k_pad) {
            for x in &mut row[..k_real] {
                *x = rng.next_float() * scale;
            }
        }
        Ok(Model {
            m,
            n,
            k: k_pad,
            p,
            q,
        })
    }

    pub fn p_row(&self, u: u32) -> &[f32] {
        let at = u as usize * self.k;
        &self.p[at..at + self.k]
    }

    pub fn q_row(&self, v: u32) -> &[f32] {
        let at = v as usize * self.k;
        &self.q[at..at + self.k]
    }

    /// Predicted rating, or 0 when `u` or `v` lies outside the matrix.
    pub fn predict(&self, u: u32, v: u32) -> f32 {
        if u >= self.m || v >= self.n {
            return 0.0;
        }
        self.p_row(u)
            .iter()
            .zip(self.q_row(v))
            .map(|(x, y)| x * y)
            .sum()
    }

    /// Compact copies of P and Q (`m * k` and `n * k`).
    pub fn to_factors(&self) -> (Vec<f32>, Vec<f32>) {
        let mut p = Vec::with_capacity(self.m as usize * self.k);
        for u in 0..self.m {
            p.extend_from_slice(self.p_row(u));
        }
        let mut q = Vec::with_capacity(self.n as usize * self.k);
        for v in 0..self.n {
            q.extend_from_slice(self.q_row(v));
        }
        (p, q)
    }

    pub(crate) fn scale_factors(&mut self, factor: f32) {
        let k = self.k;
        self.p.par_chunks_mut(k).for_each(|row| {
            for x in row {
                *x *= factor;
            }
        });
        self.q.par_chunks_mut(k).for_each(|row| {
            for x in row {
                *x *= factor;
            }
        });
    }

    /// Drop the padding lanes: compact every row from stride `k` down to
    /// `k_new` in place (the buffer keeps its length; only the logical view
    /// narrows).
    pub(crate) fn shrink(&mut self, k_new: usize) {
        let k_old = self.k;
        if k_new == k_old {
            return;
        }
        for i in 1..self.m as usize {
            self.p.copy_within(i * k_old..i * k_old + k_new, i * k_new);
        }
        for i in 1..self.n as usize {
            self.q.copy_within(i * k_old..i * k_old + k_new, i * k_new);
        }
        self.k = k_new;
    }

    /// Move row `i` to position `map[i]`, for both factor matrices, in
    /// place by cycle chasing. Consumes the maps.
    pub(crate) fn unshuffle(&mut self, p_map: &mut [u32], q_map: &mut [u32]) {
        let k = self.k;
        let permute = |buf: &mut AlignedVec, map: &mut [u32]| {
            for pivot in 0..map.len() {
                while map[pivot] as usize != pivot {
                    let next = map[pivot] as usize;
                    for d in 0..k {
                        buf.swap(pivot * k + d, next * k + d);
                    }
                    map[pivot] = map[next];
                    map[next] = next as u32;
                }
            }
        };
        permute(&mut self.p, p_map);
        permute(&mut self.q, q_map);
    }

    /// Write the model as text: `m`/`n`/`k` header lines, then one line per
    /// P row and one per Q row.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "m {}", self.m)?;
        writeln!(w, "n {}", self.n)?;
        writeln!(w, "k {}", self.k)?;
        for u in 0..self.m {
            write!(w, "p{}", u)?;
            for x in self.p_row(u) {
                write!(w, " {}", x)?;
            }
            writeln!(w)?;
        }
        for v in 0..self.n {
            write!(w, "q{}", v)?;
            for x in self.q_row(v) {
                write!(w, " {}", x)?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut lines = BufReader::new(File::open(path)?).lines();
        let mut header = |name: &str| -> Result<u64> {
            let line = lines
                .next()
                .ok_or_else(|| Error::ModelParse(format!("missing {} header", name)))??;
            match line.split_once(' ') {
                Some((label, value)) if label == name => value
                    .parse()
                    .map_err(|_| Error::ModelParse(format!("bad {} value: {}", name, value))),
                _ => Err(Error::ModelParse(format!("expected {} header", name))),
            }
        };
        let m = header("m")? as u32;
        let n = header("n")? as u32;
        let k = header("k")? as usize;

        let mut p = AlignedVec::zeroed(m as usize * k)?;
        let mut q = AlignedVec::zeroed(n as usize * k)?;
        let mut read_rows = |buf: &mut AlignedVec, count: u32| -> Result<()> {
            for i in 0..count as usize {
                let line = lines
                    .next()
                    .ok_or_else(|| Error::ModelParse(format!("missing row {}", i)))??;
                let mut fields = line.split_whitespace();
                fields.next(); // row label
                for d in 0..k {
                    let field = fields
                        .next()
                        .ok_or_else(|| Error::ModelParse(format!("row {} too short", i)))?;
                    buf[i * k + d] = field
                        .parse()
                        .map_err(|_| Error::ModelParse(format!("bad float: {}", field)))?;
                }
            }
            Ok(())
        };
        read_rows(&mut p, m)?;
        read_rows(&mut q, n)?;

        Ok(Model { m, n, k, p, q })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(m: u32, n: u32, k_real: usize, k_pad: usize, seed: u64) -> Model {
        let mut rng = XorShift64::new(seed);
        Model::init(m, n, k_real, k_pad, &mut rng).unwrap()
    }

    #[test]
    fn init_zeroes_padding_lanes() {
        let model = sample(5, 4, 3, 8, 2);
        for u in 0..5 {
            let row = model.p_row(u);
            assert!(row[..3].iter().all(|&x| (0.0..(1.0f32 / 3.0).sqrt()).contains(&x)));
            assert!(row[3..].iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn predict_is_zero_out_of_range() {
        let model = sample(3, 3, 2, 8, 4);
        assert_eq!(model.predict(3, 0), 0.0);
        assert_eq!(model.predict(0, 3), 0.0);
        assert!(model.predict(0, 0) != 0.0);
    }

    #[test]
    fn shrink_compacts_rows_in_place() {
        let mut model = sample(4, 3, 2, 8, 6);
        let expect: Vec<Vec<f32>> = (0..4).map(|u| model.p_row(u)[..2].to_vec()).collect();
        model.shrink(2);
        assert_eq!(model.k, 2);
        for u in 0..4 {
            assert_eq!(model.p_row(u), &expect[u as usize][..]);
        }
    }

    #[test]
    fn unshuffle_moves_rows_to_mapped_positions() {
        let mut model = sample(3, 3, 2, 2, 8);
        let rows: Vec<Vec<f32>> = (0..3).map(|u| model.p_row(u).to_vec()).collect();
        let mut p_map = vec![1u32, 2, 0];
        let mut q_map = vec![0u32, 1, 2];
        model.unshuffle(&mut p_map, &mut q_map);
        assert_eq!(model.p_row(1), &rows[0][..]);
        assert_eq!(model.p_row(2), &rows[1][..]);
        assert_eq!(model.p_row(0), &rows[2][..]);
    }

    #[test]
    fn save_load_round_trip() {
        let mut model = sample(4, 5, 3, 8, 10);
        model.shrink(3);
        let path = std::env::temp_dir().join("sgdmf_model_roundtrip.txt");
        model.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((loaded.m, loaded.n, loaded.k), (4, 5, 3));
        for u in 0..4 {
            for (a, b) in model.p_row(u).iter().zip(loaded.p_row(u)) {
                assert_relative_eq!(*a, *b, max_relative = 1e-5);
            }
        }
        for v in 0..5 {
            for (a, b) in model.q_row(v).iter().zip(loaded.q_row(v)) {
                assert_relative_eq!(*a, *b, max_relative = 1e-5);
            }
        }
    }
}
