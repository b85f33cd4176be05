use fefill::config::{
    counter_fires, AssemblyConfig, BcSchemeRequirement, ReducedOrderModelConfig, ScaleType, ScalingConfig,
    SecondOrder, SolutionMethod, LINE_SEARCH_BASED, NEWMARK_IMPLICIT_A_FORM, NEWMARK_IMPLICIT_D_FORM,
};
use fefill::error::ConfigError;

fn tempus(stepper: &str, solver: Option<&str>) -> SolutionMethod {
    SolutionMethod::TransientTempus {
        stepper_type: stepper.to_string(),
        nonlinear_solver: solver.map(str::to_string),
    }
}

#[test]
fn default_config_is_valid() {
    let config = AssemblyConfig::default();
    assert!(config.validate(true).is_ok());
    assert!(config.validate(false).is_ok());
    assert!(config.reassembly_applies_bcs());
}

#[test]
fn config_deserializes_from_json_with_defaults() {
    let json = r#"{
        "solution_method": { "TransientTempus": { "stepper_type": "Backward Euler" } },
        "number_of_time_derivatives": 1,
        "scaling": { "scale": 2.0, "scale_type": "AbsRowSum" },
        "debug": { "write_residual": -1 },
        "second_order": "Velocity Verlet"
    }"#;
    let config: AssemblyConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.solution_method, tempus("Backward Euler", None));
    assert_eq!(config.second_order, SecondOrder::VelocityVerlet);
    assert_eq!(config.number_of_time_derivatives, 1);
    assert_eq!(config.scaling.scale_type, ScaleType::AbsRowSum);
    assert!(!config.scaling.scale_bc_dofs);
    assert_eq!(config.debug.write_residual, -1);
    assert_eq!(config.debug.write_jacobian, 0);
    assert!(!config.use_sdbcs);
    assert!(config.validate(true).is_ok());

    let roundtrip: AssemblyConfig = serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
    assert_eq!(roundtrip, config);
}

#[test]
fn scaling_with_strong_dirichlet_is_rejected() {
    let config: AssemblyConfig = serde_json::from_str(r#"{ "use_sdbcs": true, "scaling": { "scale": 2.0 } }"#).unwrap();
    assert_eq!(config.validate(true), Err(ConfigError::ScalingWithSdbcs { scale: 2.0 }));

    // Jacobian based scaling always counts as non-unity
    let config = AssemblyConfig {
        use_sdbcs: true,
        scaling: ScalingConfig {
            scale: 1.0,
            scale_type: ScaleType::Diagonal,
            scale_bc_dofs: false,
        },
        ..Default::default()
    };
    assert_eq!(config.validate(true), Err(ConfigError::ScalingWithSdbcs { scale: 10.0 }));
}

#[test]
fn effective_scale_bc_dofs_requires_non_unity_scale() {
    let mut scaling = ScalingConfig {
        scale: 1.0,
        scale_type: ScaleType::Constant,
        scale_bc_dofs: true,
    };
    assert!(!scaling.effective_scale_bc_dofs());
    scaling.scale = 5.0;
    assert!(scaling.effective_scale_bc_dofs());
    scaling.scale = 1.0;
    scaling.scale_type = ScaleType::Diagonal;
    assert_eq!(scaling.effective_scale(), 10.0);
    assert!(scaling.effective_scale_bc_dofs());
}

#[test]
fn implicit_d_form_requires_line_search_and_strong_dirichlet() {
    let mut config = AssemblyConfig {
        solution_method: tempus(NEWMARK_IMPLICIT_D_FORM, Some("Trust Region Based")),
        use_sdbcs: true,
        ..Default::default()
    };
    assert_eq!(
        config.validate(true),
        Err(ConfigError::IncompatibleNonlinearSolver {
            stepper: NEWMARK_IMPLICIT_D_FORM.to_string(),
            required: LINE_SEARCH_BASED.to_string(),
            found: "Trust Region Based".to_string(),
        })
    );

    config.solution_method = tempus(NEWMARK_IMPLICIT_D_FORM, Some(LINE_SEARCH_BASED));
    assert!(config.validate(true).is_ok());

    config.use_sdbcs = false;
    assert_eq!(
        config.validate(true),
        Err(ConfigError::IncompatibleBcScheme {
            stepper: NEWMARK_IMPLICIT_D_FORM.to_string(),
            requires_sdbcs: true,
        })
    );
    // Without any Dirichlet conditions the scheme does not matter
    assert!(config.validate(false).is_ok());
}

#[test]
fn implicit_a_form_rejects_strong_dirichlet() {
    let config = AssemblyConfig {
        solution_method: tempus(NEWMARK_IMPLICIT_A_FORM, None),
        use_sdbcs: true,
        ..Default::default()
    };
    assert_eq!(
        config.solution_method.bc_scheme_requirement(),
        BcSchemeRequirement::OriginalDirichlet
    );
    assert_eq!(
        config.validate(false),
        Err(ConfigError::IncompatibleBcScheme {
            stepper: NEWMARK_IMPLICIT_A_FORM.to_string(),
            requires_sdbcs: false,
        })
    );
}

#[test]
fn invalid_parameters_are_rejected() {
    let invalid = |config: AssemblyConfig, name: &str| match config.validate(false) {
        Err(ConfigError::InvalidParameter { name: found, .. }) => assert_eq!(found, name),
        other => panic!("Expected invalid parameter {}, got {:?}", name, other),
    };

    invalid(
        AssemblyConfig {
            number_of_time_derivatives: 3,
            ..Default::default()
        },
        "number_of_time_derivatives",
    );

    let mut config = AssemblyConfig::default();
    config.scaling.scale = 0.0;
    invalid(config, "scaling.scale");

    let mut config = AssemblyConfig::default();
    config.debug.write_jacobian = -2;
    invalid(config, "debug.write_jacobian");

    let mut config = AssemblyConfig::default();
    config.debug.derivative_check_step = f64::NAN;
    invalid(config, "debug.derivative_check_step");

    let mut config = AssemblyConfig::default();
    config.debug.derivative_check = -1;
    invalid(config, "debug.derivative_check");
}

#[test]
fn reduced_order_model_controls_reassembly_bcs() {
    let mut config = AssemblyConfig {
        reduced_order_model: Some(ReducedOrderModelConfig::default()),
        ..Default::default()
    };
    assert!(config.reassembly_applies_bcs());
    config.reduced_order_model = Some(ReducedOrderModelConfig { apply_bcs: false });
    assert!(!config.reassembly_applies_bcs());
}

#[test]
fn counters_fire_on_the_configured_calls() {
    assert!(!counter_fires(0, 1));
    assert!(counter_fires(-1, 1));
    assert!(counter_fires(-1, 17));
    assert!(!counter_fires(3, 2));
    assert!(counter_fires(3, 3));
    assert!(!counter_fires(3, 4));
}

#[test]
fn solution_methods_resolve_by_name() {
    assert_eq!(SolutionMethod::from_name("Steady", None, None), Ok(SolutionMethod::Steady));
    assert_eq!(
        SolutionMethod::from_name("Transient Tempus", None, None),
        Ok(tempus("Backward Euler", None))
    );
    assert_eq!(
        SolutionMethod::from_name("Multi-Problem", None, None),
        Err(ConfigError::UnsupportedSolutionMethod("Multi-Problem".to_string()))
    );

    assert_eq!(SolutionMethod::Steady.solver_token(SecondOrder::No), "NOX");
    assert_eq!(SolutionMethod::Continuation.solver_token(SecondOrder::No), "LOCA");
    assert_eq!(SolutionMethod::Transient.solver_token(SecondOrder::No), "Rythmos");
    assert_eq!(SolutionMethod::Transient.solver_token(SecondOrder::Newmark), "Newmark");
    assert_eq!(tempus("Backward Euler", None).solver_token(SecondOrder::No), "Tempus");
    assert!(tempus("Backward Euler", None).is_transient());
    assert!(!SolutionMethod::Steady.is_transient());
}
