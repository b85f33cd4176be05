use crate::{test_solution, TestBc, TestProblem};
use fefill::application::{Application, JacobianCoefficients, SolutionState};
use fefill::config::{AssemblyConfig, ScaleType, ScalingConfig};
use fefill::discretization::NodeSetDofs;
use fefill::procedural::create_unit_interval_discretization;
use fefill::scaling::{Scaling, ScalingMode};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::collections::BTreeMap;

fn scaling_config(scale: f64, scale_type: ScaleType, scale_bc_dofs: bool) -> ScalingConfig {
    ScalingConfig {
        scale,
        scale_type,
        scale_bc_dofs,
    }
}

fn test_matrix() -> CsrMatrix<f64> {
    let dense = DMatrix::from_row_slice(3, 3, &[4.0, -1.0, 0.0, -1.0, 2.0, 1.0, 0.0, -3.0, 5.0]);
    CsrMatrix::from(&dense)
}

#[test]
fn unit_constant_scale_is_the_identity() {
    let mut scaling = Scaling::new(&ScalingConfig::default());
    assert_eq!(scaling.mode(), ScalingMode::Identity);
    scaling.ensure_allocated(3);
    assert!(scaling.vector().is_none());

    let mut f = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
    scaling.apply_to_residual(&mut f);
    assert_eq!(f, DVector::from_column_slice(&[1.0, 2.0, 3.0]));
}

#[test]
fn constant_scaling_uses_the_reciprocal_scale() {
    let mut scaling = Scaling::new(&scaling_config(2.0, ScaleType::Constant, false));
    assert_eq!(scaling.mode(), ScalingMode::Global);
    scaling.ensure_allocated(3);
    assert_eq!(scaling.vector(), Some(&DVector::repeat(3, 0.5)));

    let mut jac = test_matrix();
    scaling.set_scale(Some(&jac));
    scaling.apply_to_jacobian(&mut jac);
    assert_matrix_eq!(DMatrix::from(&jac), DMatrix::from(&test_matrix()) * 0.5, comp = float);
}

#[test]
fn diagonal_scaling_normalizes_the_diagonal() {
    let mut scaling = Scaling::new(&scaling_config(1.0, ScaleType::Diagonal, false));
    assert_eq!(scaling.mode(), ScalingMode::Global);
    scaling.ensure_allocated(3);
    // Without a Jacobian there is nothing to normalize with
    assert_eq!(scaling.vector(), Some(&DVector::repeat(3, 1.0)));

    let mut jac = test_matrix();
    scaling.set_scale(Some(&jac));
    assert_eq!(
        scaling.vector(),
        Some(&DVector::from_column_slice(&[0.25, 0.5, 0.2]))
    );
    scaling.apply_to_jacobian(&mut jac);
    let dense = DMatrix::from(&jac);
    for i in 0..3 {
        assert_eq!(dense[(i, i)], 1.0);
    }
}

#[test]
fn abs_row_sum_scaling_uses_absolute_row_sums() {
    let mut scaling = Scaling::new(&scaling_config(1.0, ScaleType::AbsRowSum, false));
    scaling.ensure_allocated(3);
    scaling.set_scale(Some(&test_matrix()));
    assert_eq!(
        scaling.vector(),
        Some(&DVector::from_column_slice(&[0.2, 0.25, 0.125]))
    );
}

#[test]
fn bc_dof_scaling_only_touches_constrained_dofs() {
    let mut scaling = Scaling::new(&scaling_config(3.0, ScaleType::Constant, true));
    assert_eq!(scaling.mode(), ScalingMode::BcDofs);

    let mut node_sets = NodeSetDofs::new();
    node_sets.insert("left".to_string(), vec![vec![0, 1]]);
    node_sets.insert("right".to_string(), vec![vec![4, 5]]);
    let mut offsets = BTreeMap::new();
    offsets.insert("left".to_string(), vec![1]);

    scaling.ensure_allocated(6);
    scaling.set_scale_bc_dofs(&node_sets, &offsets, None);
    assert_eq!(scaling.vector(), Some(&DVector::repeat(6, 1.0)));

    let jac = CsrMatrix::from(&DMatrix::<f64>::identity(6, 6));
    scaling.set_scale_bc_dofs(&node_sets, &offsets, Some(&jac));
    assert_eq!(
        scaling.vector(),
        Some(&DVector::from_column_slice(&[1.0, 3.0, 1.0, 1.0, 1.0, 1.0]))
    );
}

#[test]
fn bc_dof_diagonal_scaling_tracks_the_largest_diagonal_entry() {
    let mut scaling = Scaling::new(&scaling_config(1.0, ScaleType::Diagonal, true));
    assert_eq!(scaling.mode(), ScalingMode::BcDofs);
    let mut node_sets = NodeSetDofs::new();
    node_sets.insert("left".to_string(), vec![vec![2]]);
    let mut offsets = BTreeMap::new();
    offsets.insert("left".to_string(), vec![0]);

    scaling.ensure_allocated(3);
    scaling.set_scale_bc_dofs(&node_sets, &offsets, Some(&test_matrix()));
    assert_eq!(scaling.scale(), 5.0);
    assert_eq!(
        scaling.vector(),
        Some(&DVector::from_column_slice(&[1.0, 1.0, 5.0]))
    );
}

fn assemble(app: &mut Application, x: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let mut f = DVector::zeros(x.len());
    let mut jac = app.create_jacobian();
    app.compute_jacobian(JacobianCoefficients::steady(), &SolutionState::steady(x), &[], Some(&mut f), &mut jac)
        .unwrap();
    (f, DMatrix::from(&jac))
}

fn residual(app: &mut Application, x: &DVector<f64>) -> DVector<f64> {
    let mut f = DVector::zeros(x.len());
    app.compute_residual(&SolutionState::steady(x), &[], &mut f)
        .unwrap();
    f
}

fn scaled_application(problem: &TestProblem, scaling: ScalingConfig) -> Application {
    let disc = create_unit_interval_discretization(4, 1)
        .with_workset_size(2)
        .build()
        .unwrap();
    let config = AssemblyConfig {
        scaling,
        ..Default::default()
    };
    problem.application(config, disc)
}

#[test]
fn constant_scaling_scales_residual_and_jacobian() {
    let problem = TestProblem::steady(2.0);
    let x = test_solution(5);
    let mut reference = scaled_application(&problem, ScalingConfig::default());
    let mut scaled = scaled_application(&problem, scaling_config(2.0, ScaleType::Constant, false));

    let (f_ref, jac_ref) = assemble(&mut reference, &x);
    let (f, jac) = assemble(&mut scaled, &x);
    assert_matrix_eq!(f, &f_ref * 0.5, comp = float);
    assert_matrix_eq!(jac, &jac_ref * 0.5, comp = float);
    assert_matrix_eq!(residual(&mut scaled, &x), f_ref * 0.5, comp = abs, tol = 1e-14);
}

#[test]
fn diagonal_scaling_is_computed_from_the_last_jacobian() {
    let problem = TestProblem::steady(2.0);
    let x = test_solution(5);
    let mut reference = scaled_application(&problem, ScalingConfig::default());
    let mut scaled = scaled_application(&problem, scaling_config(1.0, ScaleType::Diagonal, false));

    let (f_ref, jac_ref) = assemble(&mut reference, &x);
    // Before the first Jacobian the scale vector is a unit vector
    assert_matrix_eq!(residual(&mut scaled, &x), f_ref, comp = abs, tol = 1e-14);

    let (f, jac) = assemble(&mut scaled, &x);
    let inverse_diagonal = jac_ref.diagonal().map(|d| 1.0 / d);
    for i in 0..5 {
        assert!((jac[(i, i)] - 1.0).abs() < 1e-14);
    }
    let f_expected = f_ref.component_mul(&inverse_diagonal);
    assert_matrix_eq!(f, f_expected, comp = abs, tol = 1e-14);
    assert_matrix_eq!(residual(&mut scaled, &x), f_expected, comp = abs, tol = 1e-14);
}

#[test]
fn bc_dof_scaling_scales_dirichlet_rows_after_the_dirichlet_pass() {
    let problem = TestProblem::steady(2.0).with_dirichlet(TestBc::constant("left", 0, 0.5));
    let x = test_solution(5);
    let mut reference = scaled_application(&problem, ScalingConfig::default());
    let mut scaled = scaled_application(&problem, scaling_config(3.0, ScaleType::Constant, true));

    let (f_ref, jac_ref) = assemble(&mut reference, &x);
    let (f, jac) = assemble(&mut scaled, &x);

    assert_eq!(f[0], 3.0 * (x[0] - 0.5));
    assert_eq!(jac[(0, 0)], 3.0);
    assert_eq!(jac[(0, 1)], 0.0);
    for i in 1..5 {
        assert_eq!(f[i], f_ref[i]);
        assert_eq!(jac.row(i), jac_ref.row(i));
    }
    // The residual reuses the scale vector of the last Jacobian
    assert_matrix_eq!(residual(&mut scaled, &x), f, comp = abs, tol = 1e-14);
}

#[test]
fn bc_dof_scaling_without_dirichlet_conditions_leaves_the_system_unchanged() {
    let problem = TestProblem::steady(2.0);
    let x = test_solution(5);
    let mut reference = scaled_application(&problem, ScalingConfig::default());
    let mut scaled = scaled_application(&problem, scaling_config(2.0, ScaleType::Constant, true));
    assert_eq!(scaled.scaling().mode(), ScalingMode::BcDofs);

    let (f_ref, jac_ref) = assemble(&mut reference, &x);
    let (f, jac) = assemble(&mut scaled, &x);
    assert!(jac_ref.amax() > 0.0);
    assert_eq!(scaled.scaling().vector(), Some(&DVector::repeat(5, 1.0)));
    assert_eq!(f, f_ref);
    assert_eq!(jac, jac_ref);
    assert_eq!(residual(&mut scaled, &x), f_ref);
}

#[test]
fn bc_dof_residual_before_any_jacobian_uses_a_unit_scale() {
    let problem = TestProblem::steady(2.0).with_dirichlet(TestBc::constant("left", 0, 0.5));
    let x = test_solution(5);
    let mut reference = scaled_application(&problem, ScalingConfig::default());
    let mut scaled = scaled_application(&problem, scaling_config(3.0, ScaleType::Constant, true));

    assert_eq!(residual(&mut scaled, &x), residual(&mut reference, &x));
}
