//! Row scaling of the assembled residual and Jacobian.
use crate::config::{ScaleType, ScalingConfig};
use crate::discretization::NodeSetDofs;
use fefill_sparse::{abs_row_sums, diagonal, left_scale, scale_elementwise};
use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use std::collections::BTreeMap;

/// How the scale vector is applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScalingMode {
    /// Scale factor one: nothing is scaled.
    Identity,
    /// Every row is scaled, before the Dirichlet pass.
    Global,
    /// Only rows of Dirichlet node sets are scaled, after the Dirichlet pass.
    BcDofs,
}

/// The scaling state of an assembly driver: policy plus the current scale vector.
///
/// The scale vector is allocated lazily on the first fill that needs it and lives on the owned
/// distribution.
#[derive(Debug, Clone)]
pub struct Scaling {
    scale_type: ScaleType,
    scale: f64,
    mode: ScalingMode,
    vector: Option<DVector<f64>>,
}

impl Scaling {
    pub fn new(config: &ScalingConfig) -> Self {
        let scale = config.effective_scale();
        let mode = if scale == 1.0 {
            ScalingMode::Identity
        } else if config.effective_scale_bc_dofs() {
            ScalingMode::BcDofs
        } else {
            ScalingMode::Global
        };
        Self {
            scale_type: config.scale_type,
            scale,
            mode,
            vector: None,
        }
    }

    pub fn mode(&self) -> ScalingMode {
        self.mode
    }

    pub fn scale_type(&self) -> ScaleType {
        self.scale_type
    }

    /// The current scale factor. In BC-DOF mode with diagonal or row sum scaling it tracks the
    /// infinity norm of the last Jacobian's diagonal or row sums.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_identity(&self) -> bool {
        self.mode == ScalingMode::Identity
    }

    pub fn vector(&self) -> Option<&DVector<f64>> {
        self.vector.as_ref()
    }

    /// Allocates the scale vector for `len` rows if it is missing or has the wrong length.
    ///
    /// A fresh vector starts out as a unit vector and is then initialized without a Jacobian,
    /// see [`set_scale`](Self::set_scale).
    pub fn ensure_allocated(&mut self, len: usize) {
        if self.is_identity() {
            return;
        }
        if self.vector.as_ref().map(|v| v.len() != len).unwrap_or(true) {
            self.vector = Some(DVector::repeat(len, 1.0));
            self.set_scale(None);
        }
    }

    /// Recomputes the scale vector of global scaling from the policy.
    ///
    /// Without a Jacobian, diagonal and row sum scaling fall back to a unit vector. Does
    /// nothing in BC-DOF mode, which computes its vector in
    /// [`set_scale_bc_dofs`](Self::set_scale_bc_dofs).
    pub fn set_scale(&mut self, jac: Option<&CsrMatrix<f64>>) {
        if self.mode == ScalingMode::BcDofs {
            return;
        }
        let (scale_type, scale) = (self.scale_type, self.scale);
        let Some(vector) = self.vector.as_mut() else {
            return;
        };
        match (scale_type, jac) {
            (ScaleType::Constant, _) => vector.fill(1.0 / scale),
            (ScaleType::Diagonal, Some(jac)) => *vector = diagonal(jac).map(|d| 1.0 / d),
            (ScaleType::AbsRowSum, Some(jac)) => *vector = abs_row_sums(jac).map(|s| 1.0 / s),
            (_, None) => vector.fill(1.0),
        }
        debug!("Recomputed {:?} scale vector", scale_type);
    }

    /// Recomputes the scale vector of BC-DOF scaling.
    ///
    /// The vector is one everywhere except on the constrained DOFs of the Dirichlet node sets,
    /// which receive the current scale factor. For diagonal and row sum scaling the factor is
    /// the infinity norm of the Jacobian's diagonal or absolute row sums. Without a Jacobian the
    /// previous vector is kept; a vector that was never set is a unit vector.
    ///
    /// `offsets` lists the constrained equations of each node set.
    pub fn set_scale_bc_dofs(
        &mut self,
        node_sets: &NodeSetDofs,
        offsets: &BTreeMap<String, Vec<usize>>,
        jac: Option<&CsrMatrix<f64>>,
    ) {
        let Some(vector) = self.vector.as_mut() else {
            return;
        };
        let Some(jac) = jac else {
            return;
        };

        match self.scale_type {
            ScaleType::Constant => {}
            ScaleType::Diagonal => self.scale = diagonal(jac).amax(),
            ScaleType::AbsRowSum => self.scale = abs_row_sums(jac).amax(),
        }

        for (name, node_dofs) in node_sets {
            let Some(eqs) = offsets.get(name) else {
                continue;
            };
            for dofs in node_dofs {
                for &eq in eqs {
                    vector[dofs[eq]] = self.scale;
                }
            }
        }
        debug!("Recomputed BC-DOF scale vector with scale {}", self.scale);
    }

    /// Scales a residual by the current scale vector.
    pub fn apply_to_residual(&self, f: &mut DVector<f64>) {
        if let Some(vector) = &self.vector {
            scale_elementwise(f, vector);
        }
    }

    /// Left-scales a Jacobian by the current scale vector.
    pub fn apply_to_jacobian(&self, jac: &mut CsrMatrix<f64>) {
        if let Some(vector) = &self.vector {
            left_scale(jac, vector);
        }
    }
}
