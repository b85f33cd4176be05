use crate::{test_solution, TestBc, TestProblem};
use fefill::application::{Application, JacobianCoefficients, SolutionState};
use fefill::config::AssemblyConfig;
use fefill::discretization::Discretization;
use fefill::evaluators::MassMatrixType;
use fefill::procedural::{create_unit_interval_discretization, create_unit_square_tri_discretization};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

/// Central difference approximation of the residual Jacobian.
fn finite_difference_jacobian(app: &mut Application, x: &DVector<f64>) -> DMatrix<f64> {
    let n = x.len();
    let h = 1e-6;
    let mut jac = DMatrix::zeros(n, n);
    for j in 0..n {
        let mut xp = x.clone();
        let mut xm = x.clone();
        xp[j] += h;
        xm[j] -= h;
        let mut fp = DVector::zeros(n);
        let mut fm = DVector::zeros(n);
        app.compute_residual(&SolutionState::steady(&xp), &[], &mut fp).unwrap();
        app.compute_residual(&SolutionState::steady(&xm), &[], &mut fm).unwrap();
        jac.set_column(j, &((fp - fm) / (2.0 * h)));
    }
    jac
}

fn assemble_jacobian(
    app: &mut Application,
    coefficients: JacobianCoefficients,
    state: &SolutionState<'_>,
) -> (DVector<f64>, DMatrix<f64>) {
    let mut f = DVector::zeros(state.x.len());
    let mut jac = app.create_jacobian();
    app.compute_jacobian(coefficients, state, &[], Some(&mut f), &mut jac)
        .unwrap();
    (f, DMatrix::from(&jac))
}

fn nonlinear_problem() -> TestProblem {
    TestProblem {
        reaction: 2.0,
        advection: 0.7,
        ..Default::default()
    }
}

#[test]
fn jacobian_matches_finite_differences() {
    let disc = create_unit_square_tri_discretization(2, 1)
        .with_workset_size(3)
        .build()
        .unwrap();
    let mut app = nonlinear_problem().application(AssemblyConfig::default(), disc);
    let x = test_solution(9);

    let (f, jac) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    let jac_fd = finite_difference_jacobian(&mut app, &x);
    assert_matrix_eq!(jac, jac_fd, comp = abs, tol = 1e-6);

    let mut f_residual = DVector::zeros(9);
    app.compute_residual(&SolutionState::steady(&x), &[], &mut f_residual)
        .unwrap();
    assert_matrix_eq!(f, f_residual, comp = abs, tol = 1e-14);
}

#[test]
fn jacobian_without_residual_leaves_only_the_matrix() {
    let disc = create_unit_interval_discretization(3, 2).build().unwrap();
    let mut app = nonlinear_problem().application(AssemblyConfig::default(), disc);
    let x = test_solution(8);
    let (_, expected) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));

    let mut jac = app.create_jacobian();
    app.compute_jacobian(JacobianCoefficients::steady(), &SolutionState::steady(&x), &[], None, &mut jac)
        .unwrap();
    assert_matrix_eq!(DMatrix::from(&jac), expected, comp = abs, tol = 1e-14);
}

#[test]
fn jacobian_pattern_matches_owned_pattern() {
    let disc = create_unit_square_tri_discretization(2, 2).build().unwrap();
    let mut app = nonlinear_problem().application(AssemblyConfig::default(), disc);
    let x = test_solution(18);
    let mut jac = app.create_jacobian();
    let nnz = jac.nnz();
    app.compute_jacobian(JacobianCoefficients::steady(), &SolutionState::steady(&x), &[], None, &mut jac)
        .unwrap();
    assert_eq!(jac.nnz(), nnz);
    assert_eq!(jac.pattern(), app.discretization().owned_jacobian_pattern());
}

#[test]
fn dirichlet_rows_become_scaled_identity_rows() {
    let disc = create_unit_interval_discretization(4, 1).build().unwrap();
    let problem = nonlinear_problem().with_dirichlet(TestBc::constant("right", 0, -1.0));
    let mut app = problem.application(AssemblyConfig::default(), disc);
    let x = test_solution(5);

    let coefficients = JacobianCoefficients {
        alpha: 0.0,
        beta: 3.0,
        omega: 0.0,
    };
    let (f, jac) = assemble_jacobian(&mut app, coefficients, &SolutionState::steady(&x));
    for j in 0..5 {
        let expected = if j == 4 { 3.0 } else { 0.0 };
        assert_eq!(jac[(4, j)], expected);
    }
    assert_eq!(f[4], x[4] + 1.0);
    // Columns of constrained DOFs are untouched
    assert!(jac[(3, 4)] != 0.0);
}

#[test]
fn dirichlet_perturbation_replaces_a_vanishing_beta() {
    let disc = || create_unit_interval_discretization(2, 1).build().unwrap();
    let problem = TestProblem::steady(0.0).with_dirichlet(TestBc::constant("left", 0, 0.0));
    let x = test_solution(3);
    let coefficients = JacobianCoefficients {
        alpha: 1.0,
        beta: 0.0,
        omega: 0.0,
    };

    let mut app = problem.application(AssemblyConfig::default(), disc());
    let (_, jac) = assemble_jacobian(&mut app, coefficients, &SolutionState::steady(&x));
    assert_eq!(jac[(0, 0)], 0.0);

    let config = AssemblyConfig {
        perturb_dirichlet: 1e-3,
        ..Default::default()
    };
    let mut app = problem.application(config, disc());
    let (_, jac) = assemble_jacobian(&mut app, coefficients, &SolutionState::steady(&x));
    assert_eq!(jac[(0, 0)], 1e-3);
}

#[test]
fn transient_jacobian_combines_mass_and_stiffness() {
    let h = 0.25;
    let disc = create_unit_interval_discretization(4, 1).build().unwrap();
    let mut problem = TestProblem::steady(0.0);
    problem.num_time_derivatives = 1;
    problem.mass = Some(MassMatrixType::Full);
    let config = AssemblyConfig {
        number_of_time_derivatives: 1,
        ..Default::default()
    };
    let mut app = problem.application(config, disc);
    let x = test_solution(5);
    let xdot = DVector::repeat(5, 0.5);
    let state = SolutionState::transient(0.1, &x, &xdot);

    let coefficients = |alpha, beta| JacobianCoefficients {
        alpha,
        beta,
        omega: 0.0,
    };
    let (_, mass) = assemble_jacobian(&mut app, coefficients(1.0, 0.0), &state);
    let (_, stiffness) = assemble_jacobian(&mut app, coefficients(0.0, 1.0), &state);
    let (_, combined) = assemble_jacobian(&mut app, coefficients(2.0, 3.0), &state);

    assert!((mass[(0, 0)] - h / 3.0).abs() < 1e-14);
    assert!((mass[(1, 1)] - 2.0 * h / 3.0).abs() < 1e-14);
    assert!((mass[(1, 2)] - h / 6.0).abs() < 1e-14);
    assert!((stiffness[(1, 1)] - 2.0 / h).abs() < 1e-12);
    assert_matrix_eq!(combined, mass * 2.0 + stiffness * 3.0, comp = abs, tol = 1e-12);
}

#[test]
fn adjoint_jacobian_is_the_transpose() {
    let disc = || create_unit_square_tri_discretization(2, 1).build().unwrap();
    let x = test_solution(9);

    let mut app = nonlinear_problem().application(AssemblyConfig::default(), disc());
    let (_, jac) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    assert!((&jac - jac.transpose()).amax() > 1e-3);

    let config = AssemblyConfig {
        solve_adjoint: true,
        ..Default::default()
    };
    let mut adjoint = nonlinear_problem().application(config, disc());
    let (_, jac_adjoint) = assemble_jacobian(&mut adjoint, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    assert_matrix_eq!(jac_adjoint, jac.transpose(), comp = abs, tol = 1e-14);
}

#[test]
fn ignoring_the_residual_skips_its_accumulation() {
    let disc = create_unit_interval_discretization(3, 1).build().unwrap();
    let config = AssemblyConfig {
        ignore_residual_in_jacobian: true,
        ..Default::default()
    };
    let mut app = nonlinear_problem().application(config, disc);
    let x = test_solution(4);
    let (f, jac) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    assert_eq!(f, DVector::zeros(4));
    assert!(jac.amax() > 0.0);
}

#[test]
fn jacobian_debug_output_does_not_disturb_assembly() {
    let disc = create_unit_interval_discretization(3, 1).build().unwrap();
    let mut config = AssemblyConfig::default();
    config.debug.write_jacobian = 2;
    config.debug.jacobian_condition_number = -1;
    let mut app = nonlinear_problem().application(config, disc);
    let x = test_solution(4);
    let (_, first) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    let (_, second) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
    assert_eq!(first, second);
}

#[test]
fn derivative_check_reports_a_small_error_for_a_correct_jacobian() {
    let disc = create_unit_square_tri_discretization(2, 1).build().unwrap();
    let mut config = AssemblyConfig::default();
    config.debug.derivative_check = 1;
    config.debug.derivative_check_step = 1e-6;
    let mut app = nonlinear_problem().application(config, disc);
    let x = test_solution(9);

    let mut jac = app.create_jacobian();
    let summary = app
        .compute_jacobian(JacobianCoefficients::steady(), &SolutionState::steady(&x), &[], None, &mut jac)
        .unwrap();
    let report = summary.derivative_check.expect("Derivative check was requested");
    assert_eq!(report.level, 1);
    assert!(report.data.is_none());
    assert!(report.relative_error < 1e-4);
    assert!(!report.is_suspicious());
}

#[test]
fn derivative_check_residuals_do_not_advance_the_debug_counters() {
    let disc = create_unit_square_tri_discretization(2, 1).build().unwrap();
    let mut config = AssemblyConfig::default();
    config.debug.derivative_check = 1;
    config.debug.write_residual = 1;
    let mut app = nonlinear_problem().application(config, disc);
    let x = test_solution(9);

    let mut jac = app.create_jacobian();
    app.compute_jacobian(JacobianCoefficients::steady(), &SolutionState::steady(&x), &[], None, &mut jac)
        .unwrap();
    assert_eq!(app.jacobian_count(), 1);
    assert_eq!(app.residual_count(), 0);

    let mut f = DVector::zeros(9);
    app.compute_residual(&SolutionState::steady(&x), &[], &mut f)
        .unwrap();
    assert_eq!(app.residual_count(), 1);
}

#[test]
fn derivative_check_error_shrinks_with_the_step() {
    let x = test_solution(5);
    let relative_error = |step: f64| {
        let disc = create_unit_interval_discretization(4, 1).build().unwrap();
        let mut config = AssemblyConfig::default();
        config.debug.derivative_check = 2;
        config.debug.derivative_check_step = step;
        config.debug.derivative_check_seed = 7;
        let mut app = TestProblem::steady(5.0).application(config, disc);
        let mut f = DVector::zeros(5);
        let mut jac = app.create_jacobian();
        let summary = app
            .compute_jacobian(
                JacobianCoefficients::steady(),
                &SolutionState::steady(&x),
                &[],
                Some(&mut f),
                &mut jac,
            )
            .unwrap();
        let report = summary.derivative_check.unwrap();
        let data = report.data.unwrap();
        assert_eq!(data.shape(), (5, 5));
        assert_eq!(data.column(0), x.column(0));
        report.relative_error
    };

    let coarse = relative_error(1e-2);
    let fine = relative_error(1e-4);
    assert!(fine < coarse);
    assert!(fine < 1e-3);
}

#[test]
fn wrong_jacobian_is_reported_as_suspicious() {
    use fefill::derivative_check::check_derivatives;

    let x = DVector::from_column_slice(&[1.0, -2.0, 0.0]);
    let f = x.map(|v| v * v);
    // The correct Jacobian is diag(2 x)
    let wrong = nalgebra_sparse::CsrMatrix::from(&DMatrix::<f64>::identity(3, 3));
    let report = check_derivatives(1, 1e-6, 3, &x, &f, &wrong, |xp| Ok(xp.map(|v| v * v))).unwrap();
    assert!(report.is_suspicious());

    let right = nalgebra_sparse::CsrMatrix::from(&DMatrix::from_diagonal(&(&x * 2.0)));
    let report = check_derivatives(1, 1e-6, 3, &x, &f, &right, |xp| Ok(xp.map(|v| v * v))).unwrap();
    assert!(!report.is_suspicious());
}

proptest! {
    #[test]
    fn jacobian_does_not_depend_on_workset_partitioning(
        disc in fefill::proptest::unit_interval_discretization(10, 2),
    ) {
        let num_cells = disc.owned_node_map().len() - 1;
        let n = disc.owned_dof_map().len();
        let x = test_solution(n);
        let problem = nonlinear_problem();

        let reference_disc = create_unit_interval_discretization(num_cells, 2).build().unwrap();
        let mut reference = problem.application(AssemblyConfig::default(), reference_disc);
        let (f_ref, jac_ref) = assemble_jacobian(&mut reference, JacobianCoefficients::steady(), &SolutionState::steady(&x));

        let mut app = problem.application(AssemblyConfig::default(), disc);
        let (f, jac) = assemble_jacobian(&mut app, JacobianCoefficients::steady(), &SolutionState::steady(&x));
        assert_matrix_eq!(f, f_ref, comp = abs, tol = 1e-12);
        assert_matrix_eq!(jac, jac_ref, comp = abs, tol = 1e-12);
    }
}
