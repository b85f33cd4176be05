//! Residual and Jacobian assembly for nonlinear finite element solvers, driven by evaluator graphs.
//!
//! A problem is described by [`FieldManager`](field_manager::FieldManager)s: graphs of
//! [`Evaluator`](evaluator::Evaluator)s that compute fields on batches of cells. The same graph
//! runs for several fill types ([`Residual`](fill::Residual), [`Jacobian`](fill::Jacobian),
//! [`Tangent`](fill::Tangent) and [`DistParamDeriv`](fill::DistParamDeriv)), which differ only
//! in the scalar type carried through the graph. The [`Application`](application::Application)
//! runs the graphs over the workset partitions of a
//! [`Discretization`](discretization::Discretization) and assembles the results in the owned
//! distribution, applying Dirichlet conditions and scaling.
pub mod application;
pub mod config;
pub mod derivative_check;
pub mod discretization;
pub mod error;
pub mod evaluator;
pub mod evaluators;
pub mod field;
pub mod field_manager;
pub mod fill;
pub mod params;
pub mod procedural;
pub mod scaling;
pub mod sdbc;
pub mod solution;
pub mod workset;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
pub extern crate num_dual;

pub use fefill_traits::{FillScalar, Real};

pub mod sparse {
    pub use fefill_sparse::*;
}
