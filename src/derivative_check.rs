//! Finite difference self-check of an assembled Jacobian.
use fefill_sparse::spmv;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Outcome of a derivative check.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeCheckReport {
    pub level: i32,
    /// `|f(x + dx) - f(x) - J dx| / max(|f(x + dx) - f(x)|, |J dx|)` in the infinity norm.
    pub relative_error: f64,
    /// `|dx|`, the order of magnitude the relative error is expected to have.
    pub perturbation_norm: f64,
    /// For level two and above, the columns `[x, dx, f(x), f(x + dx) - f(x), f(x + dx) - f(x) - J dx]`.
    pub data: Option<DMatrix<f64>>,
}

impl DerivativeCheckReport {
    /// Whether the relative error is far larger than the perturbation warrants.
    pub fn is_suspicious(&self) -> bool {
        !(self.relative_error <= 1.0e2 * self.perturbation_norm.max(f64::EPSILON))
    }
}

/// A random perturbation of `x`, relative to the magnitude of each entry.
///
/// Returns `(dx, x + dx)`. Entries that are exactly zero, or so small that the relative step
/// underflows, receive the absolute step `step * r` with `r` uniform in `[-1, 1]`.
pub fn perturbation(x: &DVector<f64>, step: f64, rng: &mut impl Rng) -> (DVector<f64>, DVector<f64>) {
    let mut dx = DVector::zeros(x.len());
    let mut x_perturbed = DVector::zeros(x.len());
    for i in 0..x.len() {
        let r: f64 = rng.gen_range(-1.0..=1.0);
        let absolute = step * r;
        let (d, xp) = if x[i] == 0.0 {
            (absolute, x[i] + absolute)
        } else {
            let xp = (1.0 + step * r) * x[i];
            let d = xp - x[i];
            if d == 0.0 {
                (absolute, x[i] + absolute)
            } else {
                (d, xp)
            }
        };
        dx[i] = d;
        x_perturbed[i] = xp;
    }
    (dx, x_perturbed)
}

/// Compares `f(x + dx) - f(x)` against `J dx` for a random direction `dx`.
///
/// `residual` evaluates the residual at a perturbed solution. The direction is drawn from a
/// generator seeded with `seed`, so repeated checks with the same seed use the same direction
/// up to the step size. A large error is logged as a warning and never treated as an error.
pub fn check_derivatives<F>(
    level: i32,
    step: f64,
    seed: u64,
    x: &DVector<f64>,
    f: &DVector<f64>,
    jac: &CsrMatrix<f64>,
    mut residual: F,
) -> eyre::Result<DerivativeCheckReport>
where
    F: FnMut(&DVector<f64>) -> eyre::Result<DVector<f64>>,
{
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (dx, x_perturbed) = perturbation(x, step, &mut rng);

    let f_perturbed = residual(&x_perturbed)?;
    let fd = f_perturbed - f;
    let j_dx = spmv(jac, &dx);
    let difference = &fd - &j_dx;

    let denominator = fd.amax().max(j_dx.amax());
    let relative_error = if denominator > 0.0 {
        difference.amax() / denominator
    } else {
        0.0
    };

    let data = (level > 1).then(|| {
        DMatrix::from_columns(&[x.clone(), dx.clone(), f.clone(), fd, difference])
    });
    let report = DerivativeCheckReport {
        level,
        relative_error,
        perturbation_norm: dx.amax(),
        data,
    };

    info!(
        "Derivative check level {}: reldif(f(x + dx) - f(x), J(x) dx) = {:e}, which should be on the order of {:e}",
        level, report.relative_error, report.perturbation_norm
    );
    if let Some(data) = &report.data {
        info!("Derivative check data [x, dx, f, fd, fd - J dx]:{}", data);
    }
    if report.is_suspicious() {
        warn!(
            "Derivative check: relative error {:e} is large compared to the perturbation {:e}",
            report.relative_error, report.perturbation_norm
        );
    }
    Ok(report)
}
