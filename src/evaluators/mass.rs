use super::{bind_all, bound, simplex_measure, SOLUTION_DOT};
use crate::discretization::WorksetPartition;
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{DataLayout, FieldHandle, FieldStore, FieldTag};
use crate::fill::FillType;
use crate::workset::Workset;
use fefill_traits::FillScalar;
use log::warn;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MassMatrixType {
    #[default]
    Full,
    Lumped,
}

impl MassMatrixType {
    /// Parses "Full" or "Lumped". Anything else falls back to a full mass matrix.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Full" => MassMatrixType::Full,
            "Lumped" => MassMatrixType::Lumped,
            other => {
                warn!("Mass matrix type \"{}\" is invalid; using Full", other);
                MassMatrixType::Full
            }
        }
    }

    pub fn create(&self) -> Box<dyn MassMatrix> {
        match self {
            MassMatrixType::Full => Box::new(FullMassMatrix::default()),
            MassMatrixType::Lumped => Box::new(LumpedMassMatrix::default()),
        }
    }
}

/// A run-time selected scheme computing the element mass matrices of a workset.
pub trait MassMatrix: Send {
    /// Computes the mass matrix of every cell of the workset.
    fn fill(&mut self, workset: &Workset<'_>) -> eyre::Result<()>;

    /// Mass matrix of a cell, as computed by the last call to [`fill`](Self::fill).
    fn cell_matrix(&self, cell: usize) -> &DMatrix<f64>;
}

/// Consistent mass matrix of linear simplex cells.
#[derive(Debug, Clone, Default)]
pub struct FullMassMatrix {
    matrices: Vec<DMatrix<f64>>,
}

/// Row-sum lumped mass matrix of linear simplex cells.
#[derive(Debug, Clone, Default)]
pub struct LumpedMassMatrix {
    matrices: Vec<DMatrix<f64>>,
}

fn cell_volume(partition: &WorksetPartition, cell: usize) -> f64 {
    let points: Vec<&[f64]> = (0..partition.nodes_per_cell)
        .map(|node| partition.node_coords(cell, node))
        .collect();
    simplex_measure(&points)
}

fn full_simplex_mass(volume: f64, n: usize) -> DMatrix<f64> {
    // For a d-simplex with n = d + 1 nodes: M_ij = |K| (1 + delta_ij) / ((d + 1)(d + 2))
    let denom = (n * (n + 1)) as f64;
    DMatrix::from_fn(n, n, |i, j| if i == j { 2.0 * volume / denom } else { volume / denom })
}

fn resize(matrices: &mut Vec<DMatrix<f64>>, num_cells: usize, n: usize) {
    matrices.resize(num_cells, DMatrix::zeros(n, n));
}

impl MassMatrix for FullMassMatrix {
    fn fill(&mut self, workset: &Workset<'_>) -> eyre::Result<()> {
        let partition = workset.partition()?;
        let n = partition.nodes_per_cell;
        resize(&mut self.matrices, workset.num_cells, n);
        for (cell, m) in self.matrices.iter_mut().enumerate() {
            *m = full_simplex_mass(cell_volume(partition, cell), n);
        }
        Ok(())
    }

    fn cell_matrix(&self, cell: usize) -> &DMatrix<f64> {
        &self.matrices[cell]
    }
}

impl MassMatrix for LumpedMassMatrix {
    fn fill(&mut self, workset: &Workset<'_>) -> eyre::Result<()> {
        let partition = workset.partition()?;
        let n = partition.nodes_per_cell;
        resize(&mut self.matrices, workset.num_cells, n);
        for (cell, m) in self.matrices.iter_mut().enumerate() {
            let full = full_simplex_mass(cell_volume(partition, cell), n);
            *m = DMatrix::from_diagonal(&full.column_sum());
        }
        Ok(())
    }

    fn cell_matrix(&self, cell: usize) -> &DMatrix<f64> {
        &self.matrices[cell]
    }
}

/// Inertia term `M xdot` of linear simplex cells, with a selectable mass matrix.
///
/// Evaluates the node-vector field `"Mass Residual"`.
pub struct TransientMass<E> {
    mass: Box<dyn MassMatrix>,
    solution_dot: FieldTag,
    residual: FieldTag,
    handles: Option<Vec<FieldHandle>>,
    marker: PhantomData<fn() -> E>,
}

pub const MASS_RESIDUAL: &str = "Mass Residual";

impl<E: FillType> TransientMass<E> {
    pub fn new(mass_type: MassMatrixType, nodes_per_cell: usize, num_eqs: usize) -> Self {
        let layout = DataLayout::node_vector(nodes_per_cell, num_eqs);
        Self {
            mass: mass_type.create(),
            solution_dot: FieldTag::new(SOLUTION_DOT, layout.clone()),
            residual: FieldTag::new(MASS_RESIDUAL, layout),
            handles: None,
            marker: PhantomData,
        }
    }
}

impl<E: FillType> Evaluator<E> for TransientMass<E> {
    fn name(&self) -> &str {
        "Transient Mass"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        vec![self.residual.clone()]
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        vec![self.solution_dot.clone()]
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, binder: &FieldBinder<'_>) -> eyre::Result<()> {
        let tags = [self.solution_dot.clone(), self.residual.clone()];
        self.handles = Some(bind_all(binder, &tags)?);
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let handles = bound(self.handles.clone(), "Transient Mass")?;
        let (solution_dot, residual) = (handles[0], handles[1]);
        self.mass.fill(workset)?;
        let neq = workset.num_eqs;
        let mass = &self.mass;
        fields.with_field_mut(residual, |res, fields| {
            let udot_field = fields.get(solution_dot);
            for cell in 0..workset.num_cells {
                let m = mass.cell_matrix(cell);
                let n = m.nrows();
                let udot = udot_field.cell(cell);
                let res = res.cell_mut(cell);
                for i in 0..n {
                    for eq in 0..neq {
                        let mut sum = E::ScalarT::constant(0.0);
                        for j in 0..n {
                            sum += udot[j * neq + eq].clone() * m[(i, j)];
                        }
                        res[i * neq + eq] = sum;
                    }
                }
            }
        });
        Ok(())
    }
}
