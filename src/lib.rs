use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod aligned;
mod error;
mod grid;
mod model;
mod problem;
mod rng;
mod sched;
mod sgd;
mod train;

#[cfg(feature = "python")]
mod py;

pub use error::{Error, Result};
pub use model::Model;
pub use problem::{Node, Problem};
pub use train::{cross_validate, rmse, train, train_with_validation, Parameter};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn _sgdmf(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(py::fit, m)?)?;
    m.add_function(wrap_pyfunction!(py::fit_with_validation, m)?)?;
    m.add_function(wrap_pyfunction!(py::cross_validate, m)?)?;
    Ok(())
}
