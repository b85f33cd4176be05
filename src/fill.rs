//! Fill types: the scalar representations an evaluator graph is instantiated for.
//!
//! The same graph of evaluators runs once per fill type. Each fill type fixes the scalar the
//! fields hold, how solution values are seeded when gathered and how element residuals are
//! scattered into the accumulators of a workset.
use crate::error::AssemblyError;
use crate::params::ScalarParameter;
use crate::workset::Workset;
use fefill_sparse::{add_to_csr_row, replace_row_with_diagonal, CombineMode};
use fefill_traits::FillScalar;
use num_dual::DualDVec64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvaluationType {
    Residual,
    Jacobian,
    Tangent,
    DistParamDeriv,
}

impl EvaluationType {
    pub fn name(&self) -> &'static str {
        match self {
            EvaluationType::Residual => "Residual",
            EvaluationType::Jacobian => "Jacobian",
            EvaluationType::Tangent => "Tangent",
            EvaluationType::DistParamDeriv => "Distributed Parameter Derivative",
        }
    }
}

impl Display for EvaluationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which solution vector a gathered value comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SolutionKind {
    X,
    XDot,
    XDotDot,
}

fn solution_value(workset: &Workset<'_>, kind: SolutionKind, dof: usize) -> Result<f64, AssemblyError> {
    let vector = match kind {
        SolutionKind::X => Some(workset.x.as_ref()),
        SolutionKind::XDot => workset.xdot,
        SolutionKind::XDotDot => workset.xdotdot,
    };
    vector
        .map(|v| v[dof])
        .ok_or_else(|| AssemblyError::WorksetMismatch {
            evaluation: workset.evaluation,
            reason: format!("no solution vector for {:?}", kind),
        })
}

fn coefficient(workset: &Workset<'_>, kind: SolutionKind) -> f64 {
    match kind {
        SolutionKind::X => workset.j_coeff,
        SolutionKind::XDot => workset.m_coeff,
        SolutionKind::XDotDot => workset.n_coeff,
    }
}

fn mismatch(workset: &Workset<'_>, reason: impl Into<String>) -> AssemblyError {
    AssemblyError::WorksetMismatch {
        evaluation: workset.evaluation,
        reason: reason.into(),
    }
}

/// A fill type: scalar representation plus its gather, scatter and boundary condition semantics.
pub trait FillType: 'static + Send + Sync + Sized {
    type ScalarT: FillScalar;

    const EVALUATION: EvaluationType;

    /// Reads a solution entry with the derivative seed of this fill type.
    ///
    /// `local_index` is the position of the DOF in the `(node, eq)` ordering of the cell.
    fn gather_solution(
        workset: &Workset<'_>,
        kind: SolutionKind,
        dof: usize,
        local_index: usize,
    ) -> Result<Self::ScalarT, AssemblyError>;

    /// Accumulates the residual of one cell, given in `(node, eq)` order, into the workset.
    fn scatter_cell(workset: &mut Workset<'_>, cell: usize, residual: &[Self::ScalarT]) -> Result<(), AssemblyError>;

    /// Enforces `x[dof] = value` on the owned accumulators by row replacement.
    fn apply_dirichlet(workset: &mut Workset<'_>, dof: usize, value: &Self::ScalarT) -> Result<(), AssemblyError>;

    /// Accumulator part of a strong Dirichlet condition, whose solution entry already holds `value`.
    fn apply_strong_dirichlet(workset: &mut Workset<'_>, dof: usize) -> Result<(), AssemblyError>;

    /// Reads a scalar parameter.
    fn parameter(param: &ScalarParameter) -> Self::ScalarT {
        Self::ScalarT::constant(param.value())
    }

    /// Reads the nodal value of a distributed parameter at local node `node` of a cell.
    fn dist_param_value(
        _workset: &Workset<'_>,
        _name: &str,
        value: f64,
        _node: usize,
    ) -> Result<Self::ScalarT, AssemblyError> {
        Ok(Self::ScalarT::constant(value))
    }
}

pub struct Residual;

pub struct Jacobian;

pub struct Tangent;

pub struct DistParamDeriv;

impl FillType for Residual {
    type ScalarT = f64;

    const EVALUATION: EvaluationType = EvaluationType::Residual;

    fn gather_solution(
        workset: &Workset<'_>,
        kind: SolutionKind,
        dof: usize,
        _local_index: usize,
    ) -> Result<f64, AssemblyError> {
        solution_value(workset, kind, dof)
    }

    fn scatter_cell(workset: &mut Workset<'_>, cell: usize, residual: &[f64]) -> Result<(), AssemblyError> {
        let partition = workset.partition()?;
        if let Some(f) = workset.f.as_deref_mut() {
            for (dof, r) in partition.cell_dofs(cell).zip(residual) {
                f[dof] += *r;
            }
        }
        Ok(())
    }

    fn apply_dirichlet(workset: &mut Workset<'_>, dof: usize, value: &f64) -> Result<(), AssemblyError> {
        let x = workset.x[dof];
        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = x - value;
        }
        Ok(())
    }

    fn apply_strong_dirichlet(workset: &mut Workset<'_>, dof: usize) -> Result<(), AssemblyError> {
        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = 0.0;
        }
        Ok(())
    }
}

impl FillType for Jacobian {
    type ScalarT = DualDVec64;

    const EVALUATION: EvaluationType = EvaluationType::Jacobian;

    fn gather_solution(
        workset: &Workset<'_>,
        kind: SolutionKind,
        dof: usize,
        local_index: usize,
    ) -> Result<DualDVec64, AssemblyError> {
        let value = solution_value(workset, kind, dof)?;
        let width = workset.deriv_dim()?;
        if local_index >= width {
            return Err(mismatch(workset, "local DOF index exceeds the derivative dimension"));
        }
        Ok(DualDVec64::seeded(value, width, local_index, coefficient(workset, kind)))
    }

    fn scatter_cell(workset: &mut Workset<'_>, cell: usize, residual: &[DualDVec64]) -> Result<(), AssemblyError> {
        let partition = workset.partition()?;
        let width = workset.deriv_dim()?;
        let n = partition.dofs_per_cell();
        if width < n {
            return Err(mismatch(workset, "derivative dimension is smaller than the cell DOF count"));
        }
        let dofs: Vec<usize> = partition.cell_dofs(cell).collect();

        if !workset.ignore_residual {
            if let Some(f) = workset.f.as_deref_mut() {
                for (&dof, r) in dofs.iter().zip(residual) {
                    f[dof] += r.value();
                }
            }
        }

        let is_adjoint = workset.is_adjoint;
        if let Some(jac) = workset.jac.as_deref_mut() {
            for (&row, r) in dofs.iter().zip(residual) {
                let derivatives = r.derivatives(width);
                let local_row = &derivatives.as_slice()[..n];
                if is_adjoint {
                    for (&col, value) in dofs.iter().zip(local_row) {
                        add_to_csr_row(jac, col, &[row], &[*value], CombineMode::Add)?;
                    }
                } else {
                    add_to_csr_row(jac, row, &dofs, local_row, CombineMode::Add)?;
                }
            }
        }
        Ok(())
    }

    fn apply_dirichlet(workset: &mut Workset<'_>, dof: usize, value: &DualDVec64) -> Result<(), AssemblyError> {
        let x = workset.x[dof];
        let j_coeff = workset.j_coeff;
        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = x - value.value();
        }
        if let Some(jac) = workset.jac.as_deref_mut() {
            replace_row_with_diagonal(jac, dof, j_coeff)?;
        }
        Ok(())
    }

    fn apply_strong_dirichlet(workset: &mut Workset<'_>, dof: usize) -> Result<(), AssemblyError> {
        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = 0.0;
        }
        if let Some(jac) = workset.jac.as_deref_mut() {
            replace_row_with_diagonal(jac, dof, 1.0)?;
        }
        Ok(())
    }
}

impl FillType for Tangent {
    type ScalarT = DualDVec64;

    const EVALUATION: EvaluationType = EvaluationType::Tangent;

    fn gather_solution(
        workset: &Workset<'_>,
        kind: SolutionKind,
        dof: usize,
        _local_index: usize,
    ) -> Result<DualDVec64, AssemblyError> {
        let value = solution_value(workset, kind, dof)?;
        let width = workset.deriv_dim()?;
        let seeds = match kind {
            SolutionKind::X => workset.vx,
            SolutionKind::XDot => workset.vxdot,
            SolutionKind::XDotDot => workset.vxdotdot,
        };
        match seeds {
            Some(v) => {
                let c = coefficient(workset, kind);
                let mut derivatives = vec![0.0; width];
                for (k, d) in derivatives.iter_mut().enumerate().take(workset.num_cols_x.min(v.ncols())) {
                    *d = c * v[(dof, k)];
                }
                Ok(DualDVec64::with_derivatives(value, &derivatives))
            }
            None => Ok(DualDVec64::constant(value)),
        }
    }

    fn scatter_cell(workset: &mut Workset<'_>, cell: usize, residual: &[DualDVec64]) -> Result<(), AssemblyError> {
        let partition = workset.partition()?;
        let width = workset.deriv_dim()?;
        let (num_cols_x, num_cols_p, offset) = (workset.num_cols_x, workset.num_cols_p, workset.param_offset);
        if width < num_cols_x || width < offset + num_cols_p {
            return Err(mismatch(workset, "derivative dimension is smaller than the number of seed columns"));
        }

        for (dof, r) in partition.cell_dofs(cell).zip(residual) {
            if let Some(f) = workset.f.as_deref_mut() {
                f[dof] += r.value();
            }
            if workset.jv.is_none() && workset.fp.is_none() {
                continue;
            }
            let derivatives = r.derivatives(width);
            if let Some(jv) = workset.jv.as_deref_mut() {
                for k in 0..num_cols_x {
                    jv[(dof, k)] += derivatives[k];
                }
            }
            if let Some(fp) = workset.fp.as_deref_mut() {
                for k in 0..num_cols_p {
                    fp[(dof, k)] += derivatives[offset + k];
                }
            }
        }
        Ok(())
    }

    fn apply_dirichlet(workset: &mut Workset<'_>, dof: usize, value: &DualDVec64) -> Result<(), AssemblyError> {
        let x = workset.x[dof];
        let width = workset.deriv_dim()?;
        let (num_cols_x, num_cols_p, offset) = (workset.num_cols_x, workset.num_cols_p, workset.param_offset);
        let j_coeff = workset.j_coeff;
        let vx = workset.vx;

        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = x - value.value();
        }
        if let Some(jv) = workset.jv.as_deref_mut() {
            for k in 0..num_cols_x {
                jv[(dof, k)] = vx.map(|vx| j_coeff * vx[(dof, k)]).unwrap_or(0.0);
            }
        }
        if let Some(fp) = workset.fp.as_deref_mut() {
            let derivatives = value.derivatives(width.max(offset + num_cols_p));
            for k in 0..num_cols_p {
                fp[(dof, k)] = -derivatives[offset + k];
            }
        }
        Ok(())
    }

    fn apply_strong_dirichlet(workset: &mut Workset<'_>, dof: usize) -> Result<(), AssemblyError> {
        if let Some(f) = workset.f.as_deref_mut() {
            f[dof] = 0.0;
        }
        if let Some(jv) = workset.jv.as_deref_mut() {
            jv.row_mut(dof).fill(0.0);
        }
        if let Some(fp) = workset.fp.as_deref_mut() {
            fp.row_mut(dof).fill(0.0);
        }
        Ok(())
    }

    fn parameter(param: &ScalarParameter) -> DualDVec64 {
        param
            .tangent()
            .cloned()
            .unwrap_or_else(|| DualDVec64::constant(param.value()))
    }
}

impl FillType for DistParamDeriv {
    type ScalarT = DualDVec64;

    const EVALUATION: EvaluationType = EvaluationType::DistParamDeriv;

    fn gather_solution(
        workset: &Workset<'_>,
        kind: SolutionKind,
        dof: usize,
        _local_index: usize,
    ) -> Result<DualDVec64, AssemblyError> {
        Ok(DualDVec64::constant(solution_value(workset, kind, dof)?))
    }

    fn scatter_cell(workset: &mut Workset<'_>, cell: usize, residual: &[DualDVec64]) -> Result<(), AssemblyError> {
        let partition = workset.partition()?;
        let width = workset.deriv_dim()?;
        let name = workset
            .dist_param_deriv_name
            .ok_or_else(|| mismatch(workset, "missing distributed parameter name"))?;
        let param = workset.dist_param_lib()?.get(name)?;
        let npc = partition.nodes_per_cell;
        if width < npc {
            return Err(mismatch(workset, "derivative dimension is smaller than the nodes per cell"));
        }
        let param_dofs = &param.workset_elem_dofs(workset.workset_index)[npc * cell..npc * (cell + 1)];
        let v = workset
            .vp
            .ok_or_else(|| mismatch(workset, "missing seed multivector"))?;
        let transpose = workset.transpose_dist_param_deriv;
        let fpv = match workset.fpv.as_deref_mut() {
            Some(fpv) => fpv,
            None => return Ok(()),
        };
        let num_cols = fpv.ncols();

        if !transpose {
            // fpV += (df/dp) V, rows on the solution distribution
            for (dof, r) in partition.cell_dofs(cell).zip(residual) {
                let derivatives = r.derivatives(width);
                for col in 0..num_cols {
                    let mut sum = 0.0;
                    for (l, &p) in param_dofs.iter().enumerate() {
                        sum += derivatives[l] * v[(p, col)];
                    }
                    fpv[(dof, col)] += sum;
                }
            }
        } else {
            // fpV += (df/dp)^T V, rows on the parameter distribution
            let dofs: Vec<usize> = partition.cell_dofs(cell).collect();
            let derivatives: Vec<_> = residual.iter().map(|r| r.derivatives(width)).collect();
            for (l, &p) in param_dofs.iter().enumerate() {
                for col in 0..num_cols {
                    let sum: f64 = dofs
                        .iter()
                        .zip(&derivatives)
                        .map(|(&dof, d)| d[l] * v[(dof, col)])
                        .sum();
                    fpv[(p, col)] += sum;
                }
            }
        }
        Ok(())
    }

    fn apply_dirichlet(workset: &mut Workset<'_>, dof: usize, _value: &DualDVec64) -> Result<(), AssemblyError> {
        if workset.transpose_dist_param_deriv {
            if let Some(vp_bc) = workset.vp_bc.as_deref_mut() {
                vp_bc.row_mut(dof).fill(0.0);
            }
        } else if let Some(fpv) = workset.fpv.as_deref_mut() {
            fpv.row_mut(dof).fill(0.0);
        }
        Ok(())
    }

    fn apply_strong_dirichlet(workset: &mut Workset<'_>, dof: usize) -> Result<(), AssemblyError> {
        let value = DualDVec64::constant(workset.x[dof]);
        Self::apply_dirichlet(workset, dof, &value)
    }

    fn dist_param_value(
        workset: &Workset<'_>,
        name: &str,
        value: f64,
        node: usize,
    ) -> Result<DualDVec64, AssemblyError> {
        if workset.dist_param_deriv_name == Some(name) {
            let width = workset.deriv_dim()?;
            Ok(DualDVec64::seeded(value, width, node, 1.0))
        } else {
            Ok(DualDVec64::constant(value))
        }
    }
}
