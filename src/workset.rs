use crate::discretization::{NodeSetDofs, WorksetPartition};
use crate::error::AssemblyError;
use crate::fill::EvaluationType;
use crate::params::{DistParamLib, ParamLib};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::borrow::Cow;

/// Transient bundle of mesh and solution data handed to an evaluator graph.
///
/// A workset is created for a single partition (bulk and Neumann fills) or for the owned
/// data of a whole process (Dirichlet fill), consumed by one `evaluate_fields` call and then
/// dropped. Bulk worksets reference the *overlapping* accumulators, Dirichlet worksets the
/// *owned* ones.
///
/// The solution is held as a [`Cow`] so that strong Dirichlet evaluators can rewrite the
/// constrained entries without touching the caller's vector; the driver reads the rewritten
/// solution back from the workset afterwards.
#[derive(Debug)]
pub struct Workset<'a> {
    pub evaluation: EvaluationType,
    pub partition: Option<&'a WorksetPartition>,
    pub workset_index: usize,
    pub num_cells: usize,
    pub num_eqs: usize,

    pub x: Cow<'a, DVector<f64>>,
    pub xdot: Option<&'a DVector<f64>>,
    pub xdotdot: Option<&'a DVector<f64>>,

    pub f: Option<&'a mut DVector<f64>>,
    pub jac: Option<&'a mut CsrMatrix<f64>>,
    pub jv: Option<&'a mut DMatrix<f64>>,
    pub fp: Option<&'a mut DMatrix<f64>>,
    pub fpv: Option<&'a mut DMatrix<f64>>,

    pub vx: Option<&'a DMatrix<f64>>,
    pub vxdot: Option<&'a DMatrix<f64>>,
    pub vxdotdot: Option<&'a DMatrix<f64>>,
    pub vp: Option<&'a DMatrix<f64>>,
    /// Seed directions of a transposed distributed parameter derivative, zeroed on constrained rows.
    pub vp_bc: Option<&'a mut DMatrix<f64>>,

    pub m_coeff: f64,
    pub j_coeff: f64,
    pub n_coeff: f64,
    pub current_time: f64,
    pub transient_terms: bool,
    pub accel_terms: bool,
    pub ignore_residual: bool,
    pub is_adjoint: bool,

    /// Width of the derivative vectors, required for every fill type with derivatives.
    pub deriv_dim: Option<usize>,
    pub num_cols_x: usize,
    pub num_cols_p: usize,
    pub param_offset: usize,

    pub dist_param_deriv_name: Option<&'a str>,
    pub transpose_dist_param_deriv: bool,
    pub dist_param_lib: Option<&'a DistParamLib>,
    pub param_lib: Option<&'a ParamLib>,
    pub node_sets: Option<&'a NodeSetDofs>,
}

impl<'a> Workset<'a> {
    /// An empty workset for `evaluation` around the solution `x`.
    pub fn new(evaluation: EvaluationType, x: Cow<'a, DVector<f64>>, current_time: f64) -> Self {
        Self {
            evaluation,
            partition: None,
            workset_index: 0,
            num_cells: 0,
            num_eqs: 0,
            x,
            xdot: None,
            xdotdot: None,
            f: None,
            jac: None,
            jv: None,
            fp: None,
            fpv: None,
            vx: None,
            vxdot: None,
            vxdotdot: None,
            vp: None,
            vp_bc: None,
            m_coeff: 0.0,
            j_coeff: 1.0,
            n_coeff: 0.0,
            current_time,
            transient_terms: false,
            accel_terms: false,
            ignore_residual: false,
            is_adjoint: false,
            deriv_dim: None,
            num_cols_x: 0,
            num_cols_p: 0,
            param_offset: 0,
            dist_param_deriv_name: None,
            transpose_dist_param_deriv: false,
            dist_param_lib: None,
            param_lib: None,
            node_sets: None,
        }
    }

    /// Attaches the partition a bulk or Neumann fill runs over.
    pub fn with_partition(mut self, index: usize, partition: &'a WorksetPartition) -> Self {
        self.partition = Some(partition);
        self.workset_index = index;
        self.num_cells = partition.num_cells();
        self.num_eqs = partition.num_eqs;
        self
    }

    pub fn partition(&self) -> Result<&'a WorksetPartition, AssemblyError> {
        self.partition.ok_or_else(|| self.mismatch("no partition attached"))
    }

    pub fn node_sets(&self) -> Result<&'a NodeSetDofs, AssemblyError> {
        self.node_sets.ok_or_else(|| self.mismatch("no node sets attached"))
    }

    pub fn dist_param_lib(&self) -> Result<&'a DistParamLib, AssemblyError> {
        self.dist_param_lib
            .ok_or_else(|| self.mismatch("no distributed parameter library attached"))
    }

    pub fn param_lib(&self) -> Result<&'a ParamLib, AssemblyError> {
        self.param_lib
            .ok_or_else(|| self.mismatch("no parameter library attached"))
    }

    /// Width of derivative vectors.
    pub fn deriv_dim(&self) -> Result<usize, AssemblyError> {
        self.deriv_dim
            .ok_or_else(|| self.mismatch("missing derivative dimension"))
    }

    /// Checks that the workset carries what an evaluation of the given fill type needs.
    pub fn check(&self, evaluation: EvaluationType) -> Result<(), AssemblyError> {
        if self.evaluation != evaluation {
            return Err(AssemblyError::WorksetMismatch {
                evaluation,
                reason: format!("workset was prepared for {}", self.evaluation),
            });
        }
        if evaluation != EvaluationType::Residual && self.deriv_dim.is_none() {
            return Err(self.mismatch("missing derivative dimension"));
        }
        if evaluation == EvaluationType::DistParamDeriv && self.dist_param_deriv_name.is_none() {
            return Err(self.mismatch("missing distributed parameter name"));
        }
        Ok(())
    }

    fn mismatch(&self, reason: &str) -> AssemblyError {
        AssemblyError::WorksetMismatch {
            evaluation: self.evaluation,
            reason: reason.to_string(),
        }
    }
}
