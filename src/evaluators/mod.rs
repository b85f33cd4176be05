//! Evaluators shared by all problems: moving data between global vectors and fields, and
//! boundary conditions.
//!
//! Physics kernels are not part of this crate; they sit between [`GatherSolution`] and
//! [`ScatterResidual`] and follow the same [`Evaluator`](crate::evaluator::Evaluator) contract.
mod dirichlet;
mod gather;
mod mass;
mod neumann;
mod scatter;

pub use dirichlet::*;
pub use gather::*;
pub use mass::*;
pub use neumann::*;
pub use scatter::*;

use crate::error::SetupError;
use crate::evaluator::FieldBinder;
use crate::field::{FieldHandle, FieldTag};

pub const SOLUTION: &str = "Solution";
pub const SOLUTION_DOT: &str = "Solution Dot";
pub const SOLUTION_DOTDOT: &str = "Solution DotDot";
pub const RESIDUAL: &str = "Residual";

/// Handle of a field bound in `post_registration_setup`.
///
/// Evaluating before setup is a programming error of the graph, which finalizes every
/// evaluator before it runs any of them.
fn bound<T>(handle: Option<T>, evaluator: &str) -> eyre::Result<T> {
    handle.ok_or_else(|| eyre::eyre!("Evaluator \"{}\" was evaluated before it was set up", evaluator))
}

fn bind_all(binder: &FieldBinder<'_>, tags: &[FieldTag]) -> Result<Vec<FieldHandle>, SetupError> {
    tags.iter().map(|tag| binder.bind(tag)).collect()
}

/// Measure of the simplex spanned by `points`: one for a point, length, area, volume.
///
/// Uses the Gram determinant, so the simplex may be embedded in a higher-dimensional space.
pub fn simplex_measure(points: &[&[f64]]) -> f64 {
    use nalgebra::DMatrix;
    if points.len() <= 1 {
        return 1.0;
    }
    let k = points.len() - 1;
    let dim = points[0].len();
    let edges = DMatrix::from_fn(dim, k, |i, j| points[j + 1][i] - points[0][i]);
    let gram = edges.transpose() * &edges;
    let factorial: f64 = (1..=k).map(|i| i as f64).product();
    gram.determinant().abs().sqrt() / factorial
}
