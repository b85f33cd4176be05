use crate::{test_solution, TestBc, TestProblem};
use fefill::application::{Application, SolutionState};
use fefill::config::AssemblyConfig;
use fefill::error::AssemblyError;
use fefill::params::{sensitivity_name, DistParam};
use fefill::procedural::create_unit_square_tri_discretization;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};

const NUM_NODES: usize = 9;

fn conductivity_problem() -> TestProblem {
    TestProblem {
        reaction: 1.0,
        advection: 0.3,
        conductivity: Some("kappa".to_string()),
        ..Default::default()
    }
}

fn conductivity_values() -> DVector<f64> {
    DVector::from_fn(NUM_NODES, |i, _| 1.0 + 0.1 * i as f64)
}

/// An application with a nodal conductivity `kappa` and an empty `kappa_sensitivity`.
fn conductivity_application(problem: &TestProblem) -> Application {
    let disc = create_unit_square_tri_discretization(2, 1)
        .with_workset_size(3)
        .build()
        .unwrap();
    let mut kappa = DistParam::nodal("kappa", &disc, 1.0).unwrap();
    kappa.set_vector(conductivity_values()).unwrap();
    let sensitivity = DistParam::nodal(sensitivity_name("kappa"), &disc, 0.0).unwrap();

    let app = problem.application(AssemblyConfig::default(), disc);
    {
        let mut dist_params = app.dist_param_lib().write();
        dist_params.add(kappa);
        dist_params.add(sensitivity);
    }
    app
}

/// `df/dkappa`, column by column. The residual is linear in the conductivity.
fn conductivity_derivative(app: &mut Application, x: &DVector<f64>) -> DMatrix<f64> {
    let base = conductivity_values();
    let mut f0 = DVector::zeros(x.len());
    app.compute_residual(&SolutionState::steady(x), &[], &mut f0)
        .unwrap();

    let mut derivative = DMatrix::zeros(x.len(), NUM_NODES);
    for j in 0..NUM_NODES {
        let mut perturbed = base.clone();
        perturbed[j] += 1.0;
        set_conductivity(app, perturbed);
        let mut f1 = DVector::zeros(x.len());
        app.compute_residual(&SolutionState::steady(x), &[], &mut f1)
            .unwrap();
        derivative.set_column(j, &(f1 - &f0));
    }
    set_conductivity(app, base);
    derivative
}

fn set_conductivity(app: &Application, values: DVector<f64>) {
    app.dist_param_lib()
        .write()
        .get_mut("kappa")
        .unwrap()
        .set_vector(values)
        .unwrap();
}

#[test]
fn dist_param_derivative_matches_finite_differences() {
    let problem = conductivity_problem();
    let mut app = conductivity_application(&problem);
    let x = test_solution(9);

    let v = DMatrix::identity(NUM_NODES, NUM_NODES);
    let mut fpv = DMatrix::zeros(9, NUM_NODES);
    let summary = app
        .apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", false, &v, &mut fpv)
        .unwrap();
    assert_eq!(summary.worksets, 3);

    let expected = conductivity_derivative(&mut app, &x);
    assert_matrix_eq!(fpv, expected, comp = abs, tol = 1e-12);
}

#[test]
fn transposed_derivative_applies_the_adjoint() {
    let problem = conductivity_problem();
    let mut app = conductivity_application(&problem);
    let x = test_solution(9);
    let w = DMatrix::from_fn(9, 2, |i, j| ((3 * i + j) as f64 * 0.37).sin());

    let mut fpv = DMatrix::zeros(NUM_NODES, 2);
    app.apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", true, &w, &mut fpv)
        .unwrap();

    let derivative = conductivity_derivative(&mut app, &x);
    assert_matrix_eq!(fpv, derivative.transpose() * &w, comp = abs, tol = 1e-12);

    let dist_params = app.dist_param_lib().read();
    let sensitivity = dist_params.get("kappa_sensitivity").unwrap();
    assert_matrix_eq!(sensitivity.vector().clone(), fpv.column(0).into_owned(), comp = abs, tol = 0.0);
}

#[test]
fn transposed_derivative_accumulates_into_the_output() {
    let problem = conductivity_problem();
    let mut app = conductivity_application(&problem);
    let x = test_solution(9);
    let w = DMatrix::from_element(9, 1, 1.0);

    let mut first = DMatrix::zeros(NUM_NODES, 1);
    app.apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", true, &w, &mut first)
        .unwrap();
    let mut accumulated = first.clone();
    app.apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", true, &w, &mut accumulated)
        .unwrap();
    assert_matrix_eq!(accumulated, &first * 2.0, comp = abs, tol = 1e-12);
}

#[test]
fn dirichlet_rows_do_not_depend_on_the_parameter() {
    let mut problem = conductivity_problem();
    problem = problem.with_dirichlet(TestBc::constant("left", 0, 0.0));
    let mut app = conductivity_application(&problem);
    let x = test_solution(9);
    // Nodes 0, 3 and 6 lie on x = 0
    let constrained = [0, 3, 6];

    let v = DMatrix::identity(NUM_NODES, NUM_NODES);
    let mut fpv = DMatrix::zeros(9, NUM_NODES);
    app.apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", false, &v, &mut fpv)
        .unwrap();
    for &row in &constrained {
        assert!(fpv.row(row).iter().all(|&entry| entry == 0.0));
    }
    assert!(fpv.row(4).amax() > 0.0);

    let w = DMatrix::from_fn(9, 1, |i, _| 1.0 + i as f64);
    let mut fpv_transposed = DMatrix::zeros(NUM_NODES, 1);
    app.apply_dist_param_deriv(&SolutionState::steady(&x), &[], "kappa", true, &w, &mut fpv_transposed)
        .unwrap();
    // Equivalent to the transpose of the non-transposed fill, which has the constrained rows removed
    assert_matrix_eq!(fpv_transposed, fpv.transpose() * &w, comp = abs, tol = 1e-12);
}

#[test]
fn unknown_dist_param_is_an_error() {
    let problem = conductivity_problem();
    let mut app = conductivity_application(&problem);
    let x = test_solution(9);
    let v = DMatrix::identity(NUM_NODES, NUM_NODES);
    let mut fpv = DMatrix::zeros(9, NUM_NODES);

    let err = app
        .apply_dist_param_deriv(&SolutionState::steady(&x), &[], "missing", false, &v, &mut fpv)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<AssemblyError>(),
        Some(&AssemblyError::UnknownDistParam("missing".to_string()))
    );
}
