use nalgebra::{DVector, Dyn, RealField, U1};
use num_dual::{Derivative, DualDVec64, DualNum};

pub use nalgebra;
pub use num_dual;

pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Scalar representation carried through an evaluator graph.
///
/// Residual fills use plain `f64`, whereas derivative fills use a forward-mode dual number
/// whose derivative vector has a run-time width (local DOF count, number of tangent
/// directions or number of parameter nodes). Derivative components that were never seeded
/// read as zero.
pub trait FillScalar: DualNum<f64> + Send + Sync + 'static {
    /// A value with a vanishing derivative part.
    fn constant(value: f64) -> Self;

    /// A value whose derivative is `coefficient` in component `index` of a `width`-wide
    /// derivative vector, and zero elsewhere.
    fn seeded(value: f64, width: usize, index: usize, coefficient: f64) -> Self;

    /// A value with an explicitly given derivative vector.
    fn with_derivatives(value: f64, derivatives: &[f64]) -> Self;

    /// The value part.
    fn value(&self) -> f64 {
        self.re()
    }

    /// The derivative vector, padded with zeros to `width` when no derivative was seeded.
    fn derivatives(&self, width: usize) -> DVector<f64>;

    /// Whether the representation carries derivatives at all.
    fn has_derivatives() -> bool;
}

impl FillScalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }

    fn seeded(value: f64, _width: usize, _index: usize, _coefficient: f64) -> Self {
        value
    }

    fn with_derivatives(value: f64, _derivatives: &[f64]) -> Self {
        value
    }

    fn derivatives(&self, width: usize) -> DVector<f64> {
        DVector::zeros(width)
    }

    fn has_derivatives() -> bool {
        false
    }
}

impl FillScalar for DualDVec64 {
    fn constant(value: f64) -> Self {
        DualDVec64::from_re(value)
    }

    fn seeded(value: f64, width: usize, index: usize, coefficient: f64) -> Self {
        assert!(index < width, "Seed index {} out of bounds for width {}", index, width);
        let unit = DualDVec64::new(0.0, Derivative::derivative_generic(Dyn(width), U1, index));
        DualDVec64::from_re(value) + unit * coefficient
    }

    fn with_derivatives(value: f64, derivatives: &[f64]) -> Self {
        let width = derivatives.len();
        derivatives
            .iter()
            .enumerate()
            .filter(|(_, d)| **d != 0.0)
            .fold(DualDVec64::from_re(value), |acc, (i, &d)| {
                let unit = DualDVec64::new(0.0, Derivative::derivative_generic(Dyn(width), U1, i));
                acc + unit * d
            })
    }

    fn derivatives(&self, width: usize) -> DVector<f64> {
        let eps = self.eps.clone().unwrap_generic(Dyn(width), U1);
        let mut result = DVector::zeros(width);
        for (r, e) in result.iter_mut().zip(eps.iter()) {
            *r = *e;
        }
        result
    }

    fn has_derivatives() -> bool {
        true
    }
}
