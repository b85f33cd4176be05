//! Distributed-layout vectors and sparse matrix helpers.
//!
//! Global degrees of freedom are laid out in two distributions: an *owned* distribution in
//! which every global DOF appears exactly once, and an *overlapping* distribution in which
//! DOFs shared between element partitions are replicated. [`Importer`] moves data from the
//! owned to the overlapping layout, [`Exporter`] reduces overlapping contributions back into
//! the owned layout.

mod csr;
mod map;

pub use csr::*;
pub use map::*;

pub use nalgebra_sparse;
