use crate::{test_solution, TestBc, TestProblem};
use fefill::application::{Application, FillSummary, JacobianCoefficients, SolutionState};
use fefill::config::{AssemblyConfig, ReducedOrderModelConfig};
use fefill::procedural::create_unit_interval_discretization;
use fefill::sdbc::SdbcTracker;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};

const BOUNDARY_VALUE: f64 = 0.5;

fn strong_problem() -> TestProblem {
    TestProblem {
        reaction: 2.0,
        advection: 0.5,
        strong_dirichlet: true,
        ..Default::default()
    }
    .with_dirichlet(TestBc::constant("left", 0, BOUNDARY_VALUE))
}

fn sdbc_config() -> AssemblyConfig {
    AssemblyConfig {
        use_sdbcs: true,
        ..Default::default()
    }
}

fn application(problem: &TestProblem, config: AssemblyConfig) -> Application {
    let disc = create_unit_interval_discretization(4, 1)
        .with_workset_size(2)
        .build()
        .unwrap();
    problem.application(config, disc)
}

fn residual_at(app: &mut Application, time: f64, x: &DVector<f64>) -> (DVector<f64>, FillSummary) {
    let mut f = DVector::zeros(x.len());
    let summary = app
        .compute_residual(&SolutionState::steady(x).with_time(time), &[], &mut f)
        .unwrap();
    (f, summary)
}

/// The residual of the same problem without any boundary conditions.
fn unconstrained_residual(x: &DVector<f64>) -> DVector<f64> {
    let mut problem = strong_problem();
    problem.dirichlet.clear();
    let mut app = application(&problem, AssemblyConfig::default());
    residual_at(&mut app, 0.0, x).0
}

fn post_bc_solution(x: &DVector<f64>) -> DVector<f64> {
    let mut x_post = x.clone();
    x_post[0] = BOUNDARY_VALUE;
    x_post
}

#[test]
fn tracker_detects_new_time_steps_and_applications() {
    let mut tracker = SdbcTracker::new();
    assert!(tracker.begins_time_step(0, 0.0));
    tracker.record(0, 0.0);
    assert!(!tracker.begins_time_step(0, 0.0));
    assert!(tracker.begins_time_step(0, 0.1));
    assert!(tracker.begins_time_step(1, 0.0));

    tracker.record(1, 0.0);
    assert_eq!(tracker.previous_app(), Some(1));
    assert_eq!(tracker.previous_time(0), Some(0.0));
    // Application 0 filled at this time before, but not last
    assert!(tracker.begins_time_step(0, 0.0));
}

#[test]
fn first_residual_of_a_time_step_is_reassembled_with_the_post_bc_solution() {
    let mut app = application(&strong_problem(), sdbc_config());
    let x = test_solution(5);
    let (f, summary) = residual_at(&mut app, 0.0, &x);

    assert!(summary.reassembled);
    assert_eq!(summary.worksets, 4);
    let x_post = post_bc_solution(&x);
    assert_eq!(summary.post_bc_solution.as_ref(), Some(&x_post));

    let mut expected = unconstrained_residual(&x_post);
    expected[0] = 0.0;
    assert_matrix_eq!(f, expected, comp = abs, tol = 1e-14);
}

#[test]
fn repeated_fills_at_the_same_time_are_not_reassembled() {
    let mut app = application(&strong_problem(), sdbc_config());
    let x = test_solution(5);
    residual_at(&mut app, 0.0, &x);

    let (f, summary) = residual_at(&mut app, 0.0, &x);
    assert!(!summary.reassembled);
    assert_eq!(summary.worksets, 2);
    assert_eq!(summary.post_bc_solution, Some(post_bc_solution(&x)));
    // Without reassembly the bulk rows still see the unconstrained solution
    let mut expected = unconstrained_residual(&x);
    expected[0] = 0.0;
    assert_matrix_eq!(f, expected, comp = abs, tol = 1e-14);

    let (_, summary) = residual_at(&mut app, 0.25, &x);
    assert!(summary.reassembled);
    assert_eq!(summary.worksets, 4);
}

#[test]
fn strong_dirichlet_jacobian_has_identity_rows() {
    let mut app = application(&strong_problem(), sdbc_config());
    let x = test_solution(5);
    let mut f = DVector::zeros(5);
    let mut jac = app.create_jacobian();
    let coefficients = JacobianCoefficients {
        alpha: 0.0,
        beta: 2.0,
        omega: 0.0,
    };
    let summary = app
        .compute_jacobian(coefficients, &SolutionState::steady(&x), &[], Some(&mut f), &mut jac)
        .unwrap();
    assert!(summary.reassembled);
    let jac = DMatrix::from(&jac);

    // The identity row ignores the Jacobian coefficients
    assert_eq!(jac[(0, 0)], 1.0);
    assert_eq!(jac[(0, 1)], 0.0);
    assert_eq!(f[0], 0.0);

    let mut unconstrained = strong_problem();
    unconstrained.dirichlet.clear();
    let mut reference = application(&unconstrained, AssemblyConfig::default());
    let mut jac_ref = reference.create_jacobian();
    let x_post = post_bc_solution(&x);
    reference
        .compute_jacobian(coefficients, &SolutionState::steady(&x_post), &[], None, &mut jac_ref)
        .unwrap();
    let jac_ref = DMatrix::from(&jac_ref);
    assert_matrix_eq!(jac.rows(1, 4).into_owned(), jac_ref.rows(1, 4).into_owned(), comp = abs, tol = 1e-14);
}

fn jacobian_at(app: &mut Application, time: f64, x: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>, FillSummary) {
    let mut f = DVector::zeros(x.len());
    let mut jac = app.create_jacobian();
    let summary = app
        .compute_jacobian(
            JacobianCoefficients::steady(),
            &SolutionState::steady(x).with_time(time),
            &[],
            Some(&mut f),
            &mut jac,
        )
        .unwrap();
    (f, DMatrix::from(&jac), summary)
}

#[test]
fn jacobian_is_reassembled_once_per_time_step() {
    let mut app = application(&strong_problem(), sdbc_config());
    let x = test_solution(5);
    let reassembled: Vec<_> = [0.0, 0.0, 0.1, 0.2, 0.2]
        .into_iter()
        .map(|t| jacobian_at(&mut app, t, &x).2.reassembled)
        .collect();
    assert_eq!(reassembled, vec![true, false, true, true, false]);
    assert_eq!(app.sdbc_tracker().lock().previous_time(0), Some(0.2));
}

#[test]
fn jacobian_reassembly_without_boundary_conditions_keeps_the_bulk_rows() {
    let config = AssemblyConfig {
        reduced_order_model: Some(ReducedOrderModelConfig { apply_bcs: false }),
        ..sdbc_config()
    };
    let mut app = application(&strong_problem(), config);
    let x = test_solution(5);
    let (f, jac, summary) = jacobian_at(&mut app, 0.0, &x);
    assert!(summary.reassembled);
    assert_eq!(summary.worksets, 4);

    let x_post = post_bc_solution(&x);
    let mut unconstrained = strong_problem();
    unconstrained.dirichlet.clear();
    let mut reference = application(&unconstrained, AssemblyConfig::default());
    let (f_ref, jac_ref, _) = jacobian_at(&mut reference, 0.0, &x_post);
    assert_ne!(jac[(0, 0)], 1.0);
    assert_matrix_eq!(jac, jac_ref, comp = abs, tol = 1e-14);
    assert_matrix_eq!(f, f_ref, comp = abs, tol = 1e-14);
}

#[test]
fn reassembly_without_boundary_conditions_keeps_the_bulk_row() {
    let config = AssemblyConfig {
        reduced_order_model: Some(ReducedOrderModelConfig { apply_bcs: false }),
        ..sdbc_config()
    };
    let mut app = application(&strong_problem(), config);
    let x = test_solution(5);
    let (f, summary) = residual_at(&mut app, 0.0, &x);
    assert!(summary.reassembled);

    let x_post = post_bc_solution(&x);
    assert_eq!(summary.post_bc_solution, Some(x_post.clone()));
    assert_matrix_eq!(f, unconstrained_residual(&x_post), comp = abs, tol = 1e-14);
}

#[test]
fn coupled_applications_share_the_tracker() {
    let tracker = SdbcTracker::shared();
    let mut first = application(&strong_problem(), sdbc_config())
        .with_app_index(0)
        .with_sdbc_tracker(tracker.clone());
    let mut second = application(&strong_problem(), sdbc_config())
        .with_app_index(1)
        .with_sdbc_tracker(tracker.clone());
    let x = test_solution(5);

    assert!(residual_at(&mut first, 0.0, &x).1.reassembled);
    assert!(!residual_at(&mut first, 0.0, &x).1.reassembled);
    assert!(residual_at(&mut second, 0.0, &x).1.reassembled);
    assert!(!residual_at(&mut second, 0.0, &x).1.reassembled);
    assert!(residual_at(&mut first, 0.0, &x).1.reassembled);

    let tracker = tracker.lock();
    assert_eq!(tracker.previous_app(), Some(0));
    assert_eq!(tracker.previous_time(1), Some(0.0));
}
