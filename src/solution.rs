//! Overlapping copies of solution vectors and accumulators.
use crate::discretization::Discretization;
use fefill_sparse::{fill_zero, zeroed_csr, CombineMode, DofMap, Exporter, Importer, MapMismatch};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;

/// Owns the transfer plans between the owned and the overlapping DOF distribution, and the
/// overlapping work data of the fills.
#[derive(Debug, Clone)]
pub struct SolutionManager {
    owned_map: DofMap,
    importer: Importer,
    exporter: Exporter,
    pub(crate) x: DVector<f64>,
    pub(crate) xdot: Option<DVector<f64>>,
    pub(crate) xdotdot: Option<DVector<f64>>,
    pub(crate) f: DVector<f64>,
    pub(crate) jac: CsrMatrix<f64>,
}

impl SolutionManager {
    pub fn new(disc: &dyn Discretization) -> Result<Self, MapMismatch> {
        let owned_map = disc.owned_dof_map().clone();
        let overlap_map = disc.overlap_dof_map();
        let n = overlap_map.len();
        Ok(Self {
            importer: Importer::new(&owned_map, overlap_map)?,
            exporter: Exporter::new(overlap_map, &owned_map)?,
            owned_map,
            x: DVector::zeros(n),
            xdot: None,
            xdotdot: None,
            f: DVector::zeros(n),
            jac: zeroed_csr(disc.overlap_jacobian_pattern()),
        })
    }

    pub fn owned_len(&self) -> usize {
        self.owned_map.len()
    }

    pub fn overlap_len(&self) -> usize {
        self.x.len()
    }

    pub fn owned_map(&self) -> &DofMap {
        &self.owned_map
    }

    /// Imports the solution and its time derivatives into the overlapping distribution.
    pub fn scatter_x(
        &mut self,
        x: &DVector<f64>,
        xdot: Option<&DVector<f64>>,
        xdotdot: Option<&DVector<f64>>,
    ) -> Result<(), MapMismatch> {
        let n = self.overlap_len();
        self.importer.import_vector(x, &mut self.x)?;
        self.xdot = import_optional(&self.importer, xdot, n)?;
        self.xdotdot = import_optional(&self.importer, xdotdot, n)?;
        Ok(())
    }

    /// Imports an owned multivector into a new overlapping multivector.
    pub fn import_multivector(&self, owned: &DMatrix<f64>) -> Result<DMatrix<f64>, MapMismatch> {
        let mut overlapped = DMatrix::zeros(self.overlap_len(), owned.ncols());
        self.importer.import_multivector(owned, &mut overlapped)?;
        Ok(overlapped)
    }

    pub fn zero_residual(&mut self) {
        self.f.fill(0.0);
    }

    pub fn zero_jacobian(&mut self) {
        fill_zero(&mut self.jac);
    }

    pub fn export_residual(&self, f: &mut DVector<f64>) -> Result<(), MapMismatch> {
        self.exporter.export_vector(&self.f, f, CombineMode::Add)
    }

    pub fn export_jacobian(&self, jac: &mut CsrMatrix<f64>) -> Result<(), MapMismatch> {
        self.exporter.export_csr(&self.jac, jac, CombineMode::Add)
    }

    pub fn export_multivector(&self, overlapped: &DMatrix<f64>, owned: &mut DMatrix<f64>) -> Result<(), MapMismatch> {
        self.exporter
            .export_multivector(overlapped, owned, CombineMode::Add)
    }

    pub fn overlapped_residual(&self) -> &DVector<f64> {
        &self.f
    }

    pub fn overlapped_jacobian(&self) -> &CsrMatrix<f64> {
        &self.jac
    }
}

fn import_optional(
    importer: &Importer,
    owned: Option<&DVector<f64>>,
    n: usize,
) -> Result<Option<DVector<f64>>, MapMismatch> {
    owned
        .map(|owned| {
            let mut overlapped = DVector::zeros(n);
            importer.import_vector(owned, &mut overlapped)?;
            Ok(overlapped)
        })
        .transpose()
}
