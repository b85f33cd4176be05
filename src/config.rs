//! Assembly configuration.
//!
//! The configuration is plain data that can be deserialized with `serde`. Call
//! [`AssemblyConfig::validate`] before handing it to an [`Application`](crate::application::Application),
//! which does so itself on construction.
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Time stepper that needs strong Dirichlet conditions and a line search solver.
pub const NEWMARK_IMPLICIT_D_FORM: &str = "Newmark Implicit d-Form";
/// Time stepper that cannot be combined with strong Dirichlet conditions.
pub const NEWMARK_IMPLICIT_A_FORM: &str = "Newmark Implicit a-Form";
/// Explicit time stepper that needs strong Dirichlet conditions.
pub const NEWMARK_EXPLICIT_A_FORM: &str = "Newmark Explicit a-Form";
/// The only nonlinear solver the implicit d-form stepper works with.
pub const LINE_SEARCH_BASED: &str = "Line Search Based";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub solution_method: SolutionMethod,
    pub second_order: SecondOrder,
    /// Number of time derivatives of the solution (0, 1 or 2).
    pub number_of_time_derivatives: usize,
    /// Whether the Dirichlet graph rewrites the solution (strong Dirichlet conditions).
    pub use_sdbcs: bool,
    pub scaling: ScalingConfig,
    pub debug: DebugConfig,
    /// Replaces `j_coeff` in the Dirichlet workset when `beta == 0`.
    pub perturb_dirichlet: f64,
    pub ignore_residual_in_jacobian: bool,
    pub solve_adjoint: bool,
    pub reduced_order_model: Option<ReducedOrderModelConfig>,
    /// Log the finalized graphs as Graphviz DOT when non-zero.
    pub graph_visualization_detail: u32,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            solution_method: SolutionMethod::Steady,
            second_order: SecondOrder::No,
            number_of_time_derivatives: 0,
            use_sdbcs: false,
            scaling: ScalingConfig::default(),
            debug: DebugConfig::default(),
            perturb_dirichlet: 0.0,
            ignore_residual_in_jacobian: false,
            solve_adjoint: false,
            reduced_order_model: None,
            graph_visualization_detail: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolutionMethod {
    Steady,
    Continuation,
    Transient,
    TransientTempus {
        stepper_type: String,
        #[serde(default)]
        nonlinear_solver: Option<String>,
    },
    Eigensolve,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecondOrder {
    No,
    #[serde(rename = "Velocity Verlet")]
    VelocityVerlet,
    Newmark,
    #[serde(rename = "Trapezoid Rule")]
    TrapezoidRule,
}

impl SecondOrder {
    pub fn name(&self) -> &'static str {
        match self {
            SecondOrder::No => "No",
            SecondOrder::VelocityVerlet => "Velocity Verlet",
            SecondOrder::Newmark => "Newmark",
            SecondOrder::TrapezoidRule => "Trapezoid Rule",
        }
    }
}

/// Requirements a time stepper places on the Dirichlet boundary condition scheme.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BcSchemeRequirement {
    Any,
    StrongDirichlet,
    OriginalDirichlet,
}

impl SolutionMethod {
    /// Resolves a solution method from its conventional name.
    ///
    /// "Transient Tempus" takes its stepper type and nonlinear solver from the extra arguments.
    pub fn from_name(
        name: &str,
        stepper_type: Option<&str>,
        nonlinear_solver: Option<&str>,
    ) -> Result<Self, ConfigError> {
        match name {
            "Steady" => Ok(SolutionMethod::Steady),
            "Continuation" => Ok(SolutionMethod::Continuation),
            "Transient" => Ok(SolutionMethod::Transient),
            "Eigensolve" => Ok(SolutionMethod::Eigensolve),
            "Transient Tempus" | "Transient Tempus No Piro" => Ok(SolutionMethod::TransientTempus {
                stepper_type: stepper_type.unwrap_or("Backward Euler").to_string(),
                nonlinear_solver: nonlinear_solver.map(str::to_string),
            }),
            other => Err(ConfigError::UnsupportedSolutionMethod(other.to_string())),
        }
    }

    /// The family of downstream solver that drives this solution method.
    pub fn solver_token(&self, second_order: SecondOrder) -> &'static str {
        match (self, second_order) {
            (SolutionMethod::Steady, _) => "NOX",
            (SolutionMethod::Continuation, _) => "LOCA",
            (SolutionMethod::Transient, SecondOrder::No) => "Rythmos",
            (SolutionMethod::TransientTempus { .. }, SecondOrder::No) => "Tempus",
            (SolutionMethod::Transient, other) | (SolutionMethod::TransientTempus { .. }, other) => other.name(),
            (SolutionMethod::Eigensolve, _) => "Unsupported",
        }
    }

    pub fn bc_scheme_requirement(&self) -> BcSchemeRequirement {
        match self {
            SolutionMethod::TransientTempus { stepper_type, .. } => match stepper_type.as_str() {
                NEWMARK_IMPLICIT_D_FORM | NEWMARK_EXPLICIT_A_FORM => BcSchemeRequirement::StrongDirichlet,
                NEWMARK_IMPLICIT_A_FORM => BcSchemeRequirement::OriginalDirichlet,
                _ => BcSchemeRequirement::Any,
            },
            _ => BcSchemeRequirement::Any,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SolutionMethod::Transient | SolutionMethod::TransientTempus { .. })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleType {
    #[default]
    Constant,
    Diagonal,
    AbsRowSum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub scale: f64,
    pub scale_type: ScaleType,
    pub scale_bc_dofs: bool,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            scale_type: ScaleType::Constant,
            scale_bc_dofs: false,
        }
    }
}

impl ScalingConfig {
    /// The scale factor actually used.
    ///
    /// Diagonal and absolute row sum scaling compute their scale from the Jacobian, so only
    /// the fact that the factor differs from one matters; it is fixed at 10.
    pub fn effective_scale(&self) -> f64 {
        match self.scale_type {
            ScaleType::Constant => self.scale,
            ScaleType::Diagonal | ScaleType::AbsRowSum => 10.0,
        }
    }

    /// Whether BC-DOF scaling is in effect. A unit scale factor always disables it.
    pub fn effective_scale_bc_dofs(&self) -> bool {
        self.scale_bc_dofs && self.effective_scale() != 1.0
    }
}

/// Diagnostics. Counters take -1 (every call), 0 (never) or `n` (only the `n`-th call).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Derivative check level; 0 disables the check, 2 and above also reports per-entry data.
    pub derivative_check: i32,
    pub derivative_check_step: f64,
    pub derivative_check_seed: u64,
    pub write_residual: i32,
    pub write_jacobian: i32,
    pub jacobian_condition_number: i32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            derivative_check: 0,
            derivative_check_step: 1.0e-7,
            derivative_check_seed: 0,
            write_residual: 0,
            write_jacobian: 0,
            jacobian_condition_number: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducedOrderModelConfig {
    /// Whether the Dirichlet graph runs again after strong Dirichlet reassembly.
    pub apply_bcs: bool,
}

impl Default for ReducedOrderModelConfig {
    fn default() -> Self {
        Self { apply_bcs: true }
    }
}

fn check_counter(name: &str, value: i32) -> Result<(), ConfigError> {
    if value < -1 {
        Err(ConfigError::InvalidParameter {
            name: name.to_string(),
            reason: format!("must be -1, 0 or a positive call number, got {}", value),
        })
    } else {
        Ok(())
    }
}

impl AssemblyConfig {
    /// Whether the second Dirichlet pass of a strong Dirichlet reassembly runs.
    pub fn reassembly_applies_bcs(&self) -> bool {
        self.reduced_order_model
            .as_ref()
            .map(|rom| rom.apply_bcs)
            .unwrap_or(true)
    }

    /// Checks the configuration for internal consistency.
    ///
    /// `has_dirichlet_bcs` tells whether the problem defines any Dirichlet conditions at all;
    /// without them the boundary-condition scheme requirements of the time stepper are moot.
    pub fn validate(&self, has_dirichlet_bcs: bool) -> Result<(), ConfigError> {
        if self.number_of_time_derivatives > 2 {
            return Err(ConfigError::InvalidParameter {
                name: "number_of_time_derivatives".to_string(),
                reason: format!(
                    "must be at most 2 (solution, solution_dot, solution_dotdot), got {}",
                    self.number_of_time_derivatives
                ),
            });
        }

        if let SolutionMethod::TransientTempus {
            stepper_type,
            nonlinear_solver,
        } = &self.solution_method
        {
            if stepper_type == NEWMARK_IMPLICIT_D_FORM {
                let found = nonlinear_solver.as_deref().unwrap_or("");
                if found != LINE_SEARCH_BASED {
                    return Err(ConfigError::IncompatibleNonlinearSolver {
                        stepper: stepper_type.clone(),
                        required: LINE_SEARCH_BASED.to_string(),
                        found: found.to_string(),
                    });
                }
            }
        }

        let stepper_name = || match &self.solution_method {
            SolutionMethod::TransientTempus { stepper_type, .. } => stepper_type.clone(),
            _ => String::new(),
        };
        match self.solution_method.bc_scheme_requirement() {
            BcSchemeRequirement::StrongDirichlet if !self.use_sdbcs && has_dirichlet_bcs => {
                return Err(ConfigError::IncompatibleBcScheme {
                    stepper: stepper_name(),
                    requires_sdbcs: true,
                });
            }
            BcSchemeRequirement::OriginalDirichlet if self.use_sdbcs => {
                return Err(ConfigError::IncompatibleBcScheme {
                    stepper: stepper_name(),
                    requires_sdbcs: false,
                });
            }
            _ => {}
        }

        if !self.scaling.scale.is_finite() || self.scaling.scale == 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "scaling.scale".to_string(),
                reason: format!("must be finite and non-zero, got {}", self.scaling.scale),
            });
        }
        if self.use_sdbcs && self.scaling.effective_scale() != 1.0 {
            return Err(ConfigError::ScalingWithSdbcs {
                scale: self.scaling.effective_scale(),
            });
        }

        check_counter("debug.write_residual", self.debug.write_residual)?;
        check_counter("debug.write_jacobian", self.debug.write_jacobian)?;
        check_counter("debug.jacobian_condition_number", self.debug.jacobian_condition_number)?;
        if self.debug.derivative_check < 0 {
            return Err(ConfigError::InvalidParameter {
                name: "debug.derivative_check".to_string(),
                reason: format!("must be non-negative, got {}", self.debug.derivative_check),
            });
        }
        if self.debug.derivative_check_step.is_nan() || self.debug.derivative_check_step <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "debug.derivative_check_step".to_string(),
                reason: format!("must be positive, got {}", self.debug.derivative_check_step),
            });
        }
        Ok(())
    }
}

/// Decides whether a debug action tied to a call counter fires on call number `count` (1-based).
pub fn counter_fires(setting: i32, count: usize) -> bool {
    match setting {
        -1 => true,
        n if n > 0 => n as usize == count,
        _ => false,
    }
}
