use numpy::{IntoPyArray, PyArray2, PyArrayMethods, PyReadonlyArray1};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::error::Error;
use crate::problem::Problem;
use crate::train::{self, Parameter};

impl From<Error> for PyErr {
    fn from(err: Error) -> PyErr {
        match err {
            Error::Io(_) | Error::ModelParse(_) => PyIOError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_param(
    k: usize,
    nr_threads: usize,
    nr_bins: usize,
    nr_iters: usize,
    lambda: f32,
    eta: f32,
    alpha: f32,
    do_nmf: bool,
    do_implicit: bool,
    quiet: bool,
    seed: u64,
) -> Parameter {
    Parameter {
        k,
        nr_threads,
        nr_bins,
        nr_iters,
        lambda,
        eta,
        alpha,
        do_nmf,
        do_implicit,
        quiet,
        // the COO arrays were already copied out of numpy
        copy_data: false,
        seed,
    }
}

fn factors<'py>(
    py: Python<'py>,
    model: crate::model::Model,
) -> PyResult<(Bound<'py, PyArray2<f32>>, Bound<'py, PyArray2<f32>>)> {
    let (p, q) = model.to_factors();
    let p = p.into_pyarray(py).reshape([model.m as usize, model.k])?;
    let q = q.into_pyarray(py).reshape([model.n as usize, model.k])?;
    Ok((p, q))
}

/// Train a factorization on COO rating arrays; returns (P, Q).
#[pyfunction]
#[pyo3(signature = (
    users, items, ratings, m, n,
    k=8, nr_threads=1, nr_bins=20, nr_iters=20,
    lambda_=0.1, eta=0.1, alpha=40.0,
    do_nmf=false, do_implicit=false, quiet=false, seed=0
))]
#[allow(clippy::too_many_arguments)]
pub fn fit<'py>(
    py: Python<'py>,
    users: PyReadonlyArray1<'py, i32>,
    items: PyReadonlyArray1<'py, i32>,
    ratings: PyReadonlyArray1<'py, f32>,
    m: u32,
    n: u32,
    k: usize,
    nr_threads: usize,
    nr_bins: usize,
    nr_iters: usize,
    lambda_: f32,
    eta: f32,
    alpha: f32,
    do_nmf: bool,
    do_implicit: bool,
    quiet: bool,
    seed: u64,
) -> PyResult<(Bound<'py, PyArray2<f32>>, Bound<'py, PyArray2<f32>>)> {
    let mut prob = Problem::from_coo(
        m,
        n,
        users.as_slice()?,
        items.as_slice()?,
        ratings.as_slice()?,
    )?;
    let param = build_param(
        k, nr_threads, nr_bins, nr_iters, lambda_, eta, alpha, do_nmf, do_implicit, quiet, seed,
    );
    let model = py.detach(|| train::train(&mut prob, &param))?;
    factors(py, model)
}

/// Like `fit`, but also reports RMSE on a validation set every epoch.
#[pyfunction]
#[pyo3(signature = (
    users, items, ratings, va_users, va_items, va_ratings, m, n,
    k=8, nr_threads=1, nr_bins=20, nr_iters=20,
    lambda_=0.1, eta=0.1, alpha=40.0,
    do_nmf=false, do_implicit=false, quiet=false, seed=0
))]
#[allow(clippy::too_many_arguments)]
pub fn fit_with_validation<'py>(
    py: Python<'py>,
    users: PyReadonlyArray1<'py, i32>,
    items: PyReadonlyArray1<'py, i32>,
    ratings: PyReadonlyArray1<'py, f32>,
    va_users: PyReadonlyArray1<'py, i32>,
    va_items: PyReadonlyArray1<'py, i32>,
    va_ratings: PyReadonlyArray1<'py, f32>,
    m: u32,
    n: u32,
    k: usize,
    nr_threads: usize,
    nr_bins: usize,
    nr_iters: usize,
    lambda_: f32,
    eta: f32,
    alpha: f32,
    do_nmf: bool,
    do_implicit: bool,
    quiet: bool,
    seed: u64,
) -> PyResult<(Bound<'py, PyArray2<f32>>, Bound<'py, PyArray2<f32>>)> {
    let mut tr = Problem::from_coo(
        m,
        n,
        users.as_slice()?,
        items.as_slice()?,
        ratings.as_slice()?,
    )?;
    let mut va = Problem::from_coo(
        m,
        n,
        va_users.as_slice()?,
        va_items.as_slice()?,
        va_ratings.as_slice()?,
    )?;
    let param = build_param(
        k, nr_threads, nr_bins, nr_iters, lambda_, eta, alpha, do_nmf, do_implicit, quiet, seed,
    );
    let model = py.detach(|| train::train_with_validation(&mut tr, &mut va, &param))?;
    factors(py, model)
}

/// K-fold cross-validation over grid blocks; returns the held-out RMSE.
#[pyfunction]
#[pyo3(signature = (
    users, items, ratings, m, n, nr_folds=5,
    k=8, nr_threads=1, nr_bins=20, nr_iters=20,
    lambda_=0.1, eta=0.1, alpha=40.0,
    do_nmf=false, do_implicit=false, quiet=false, seed=0
))]
#[allow(clippy::too_many_arguments)]
pub fn cross_validate<'py>(
    py: Python<'py>,
    users: PyReadonlyArray1<'py, i32>,
    items: PyReadonlyArray1<'py, i32>,
    ratings: PyReadonlyArray1<'py, f32>,
    m: u32,
    n: u32,
    nr_folds: usize,
    k: usize,
    nr_threads: usize,
    nr_bins: usize,
    nr_iters: usize,
    lambda_: f32,
    eta: f32,
    alpha: f32,
    do_nmf: bool,
    do_implicit: bool,
    quiet: bool,
    seed: u64,
) -> PyResult<f32> {
    let mut prob = Problem::from_coo(
        m,
        n,
        users.as_slice()?,
        items.as_slice()?,
        ratings.as_slice()?,
    )?;
    let param = build_param(
        k, nr_threads, nr_bins, nr_iters, lambda_, eta, alpha, do_nmf, do_implicit, quiet, seed,
    );
    let rmse = py.detach(|| train::cross_validate(&mut prob, nr_folds, &param))?;
    Ok(rmse)
}
