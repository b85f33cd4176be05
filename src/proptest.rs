//! Strategies for property-based tests of assembly.
use crate::discretization::MeshDiscretization;
use crate::procedural::{create_unit_interval_discretization, create_unit_square_tri_discretization};
use ::proptest::prelude::*;

/// A unit interval discretization with `1..=max_cells` cells split into worksets of arbitrary size.
pub fn unit_interval_discretization(max_cells: usize, num_eqs: usize) -> impl Strategy<Value = MeshDiscretization> {
    (1..=max_cells.max(1))
        .prop_flat_map(|cells| (Just(cells), 1..=cells))
        .prop_map(move |(cells, workset_size)| {
            create_unit_interval_discretization(cells, num_eqs)
                .with_workset_size(workset_size)
                .build()
                .expect("Procedural discretizations are always consistent")
        })
}

/// A unit square triangle discretization with `1..=max_cells_per_dim` cells per dimension split
/// into worksets of arbitrary size.
pub fn unit_square_discretization(
    max_cells_per_dim: usize,
    num_eqs: usize,
) -> impl Strategy<Value = MeshDiscretization> {
    (1..=max_cells_per_dim.max(1))
        .prop_flat_map(|n| (Just(n), 1..=2 * n * n))
        .prop_map(move |(n, workset_size)| {
            create_unit_square_tri_discretization(n, num_eqs)
                .with_workset_size(workset_size)
                .build()
                .expect("Procedural discretizations are always consistent")
        })
}

/// A vector of the given length with entries in `[-range, range]`.
pub fn vector(len: usize, range: f64) -> impl Strategy<Value = nalgebra::DVector<f64>> {
    ::proptest::collection::vec(-range..=range, len).prop_map(nalgebra::DVector::from_vec)
}
