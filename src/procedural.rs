//! Basic procedural discretizations.
//!
//! Each routine returns a [`MeshDiscretizationBuilder`], so the workset size or additional
//! node sets can be configured before building.
use crate::discretization::MeshDiscretizationBuilder;

/// Uniform discretization of `[0, 1]` into `cells` two-node segments.
///
/// Node `i` sits at `i / cells`. The node sets and side sets `"left"` and `"right"` hold the
/// end points.
pub fn create_unit_interval_discretization(cells: usize, num_eqs: usize) -> MeshDiscretizationBuilder {
    let cells = cells.max(1);
    let coords = (0..=cells).map(|i| vec![i as f64 / cells as f64]).collect();
    let connectivity = (0..cells).map(|i| vec![i, i + 1]).collect();
    MeshDiscretizationBuilder::new(coords, num_eqs)
        .with_element_block("interval", 0, connectivity)
        .with_side("left", 0, vec![0])
        .with_side("right", cells - 1, vec![1])
        .with_node_set("left", vec![0])
        .with_node_set("right", vec![cells])
}

/// Uniform discretization of the unit square into `2 * cells_per_dim^2` triangles.
///
/// Node `(i, j)` has index `j * (cells_per_dim + 1) + i` and sits at
/// `(i / cells_per_dim, j / cells_per_dim)`. Node sets `"left"`, `"right"`, `"bottom"` and
/// `"top"` hold the boundary nodes of each edge, and the side sets `"left"` and `"right"` hold
/// the boundary edges at `x = 0` and `x = 1`.
pub fn create_unit_square_tri_discretization(cells_per_dim: usize, num_eqs: usize) -> MeshDiscretizationBuilder {
    let n = cells_per_dim.max(1);
    let h = 1.0 / n as f64;
    let node = |i: usize, j: usize| j * (n + 1) + i;

    let mut coords = Vec::with_capacity((n + 1) * (n + 1));
    for j in 0..=n {
        for i in 0..=n {
            coords.push(vec![i as f64 * h, j as f64 * h]);
        }
    }

    let mut connectivity = Vec::with_capacity(2 * n * n);
    let mut left_sides = Vec::new();
    let mut right_sides = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let (v00, v10, v11, v01) = (node(i, j), node(i + 1, j), node(i + 1, j + 1), node(i, j + 1));
            if i + 1 == n {
                right_sides.push(connectivity.len());
            }
            connectivity.push(vec![v00, v10, v11]);
            if i == 0 {
                left_sides.push(connectivity.len());
            }
            connectivity.push(vec![v00, v11, v01]);
        }
    }

    let mut builder = MeshDiscretizationBuilder::new(coords, num_eqs).with_element_block("square", 0, connectivity);
    for cell in right_sides {
        builder = builder.with_side("right", cell, vec![1, 2]);
    }
    for cell in left_sides {
        builder = builder.with_side("left", cell, vec![0, 2]);
    }
    builder
        .with_node_set("left", (0..=n).map(|j| node(0, j)).collect())
        .with_node_set("right", (0..=n).map(|j| node(n, j)).collect())
        .with_node_set("bottom", (0..=n).map(|i| node(i, 0)).collect())
        .with_node_set("top", (0..=n).map(|i| node(i, n)).collect())
}
