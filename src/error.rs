//! Error types for configuration, graph setup and assembly.
use crate::field::FieldTag;
use crate::fill::EvaluationType;
use fefill_sparse::MapMismatch;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Invalid or inconsistent assembly configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A parameter has a value outside its admissible range.
    InvalidParameter { name: String, reason: String },
    /// Non-unity scaling was requested together with strong Dirichlet conditions.
    ScalingWithSdbcs { scale: f64 },
    /// The time stepper needs a different boundary-condition scheme than the problem uses.
    IncompatibleBcScheme { stepper: String, requires_sdbcs: bool },
    /// The time stepper needs a different nonlinear solver.
    IncompatibleNonlinearSolver { stepper: String, required: String, found: String },
    /// The solution method does not support the requested feature.
    UnsupportedSolutionMethod(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            ConfigError::InvalidParameter { name, reason } => {
                write!(f, "Invalid value for parameter \"{}\": {}", name, reason)
            }
            ConfigError::ScalingWithSdbcs { scale } => write!(
                f,
                "Scaling (scale = {}) cannot be used with strong Dirichlet boundary conditions",
                scale
            ),
            ConfigError::IncompatibleBcScheme { stepper, requires_sdbcs } => {
                if *requires_sdbcs {
                    write!(f, "Time stepper \"{}\" requires strong Dirichlet boundary conditions", stepper)
                } else {
                    write!(f, "Time stepper \"{}\" cannot be used with strong Dirichlet boundary conditions", stepper)
                }
            }
            ConfigError::IncompatibleNonlinearSolver { stepper, required, found } => write!(
                f,
                "Time stepper \"{}\" requires nonlinear solver \"{}\", but \"{}\" was specified",
                stepper, required, found
            ),
            ConfigError::UnsupportedSolutionMethod(method) => {
                write!(f, "Unsupported solution method \"{}\"", method)
            }
        }
    }
}

impl Error for ConfigError {}

/// Failure to finalize an evaluator graph or the driver that owns the graphs.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupError {
    /// An evaluator depends on a field that no registered evaluator produces.
    MissingField { field: FieldTag, evaluator: String },
    /// The dependency graph contains a cycle through the listed evaluators.
    CyclicDependency { evaluators: Vec<String> },
    /// Two evaluators claim to produce the same field.
    DuplicateField { field: FieldTag, first: String, second: String },
    /// A required field is not produced by any evaluator.
    UnproducedRequiredField { field: FieldTag },
    /// A partition refers to a physics index without a bulk field manager.
    MissingFieldManager { physics_index: usize },
    /// Evaluation was requested for a fill type whose graph has not been finalized.
    NotFinalized { evaluation: EvaluationType },
    /// An evaluator failed in its own setup hook.
    Evaluator { evaluator: String, reason: String },
}

impl Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            SetupError::MissingField { field, evaluator } => write!(
                f,
                "Evaluator \"{}\" depends on field {} which no evaluator provides",
                evaluator, field
            ),
            SetupError::CyclicDependency { evaluators } => {
                write!(f, "Cyclic dependency among evaluators: {}", evaluators.join(", "))
            }
            SetupError::DuplicateField { field, first, second } => write!(
                f,
                "Field {} is evaluated by both \"{}\" and \"{}\"",
                field, first, second
            ),
            SetupError::UnproducedRequiredField { field } => {
                write!(f, "Required field {} is not evaluated by any evaluator", field)
            }
            SetupError::MissingFieldManager { physics_index } => {
                write!(f, "No field manager for physics index {}", physics_index)
            }
            SetupError::NotFinalized { evaluation } => {
                write!(f, "Evaluator graph for fill type {} has not been set up", evaluation)
            }
            SetupError::Evaluator { evaluator, reason } => {
                write!(f, "Setup of evaluator \"{}\" failed: {}", evaluator, reason)
            }
        }
    }
}

impl Error for SetupError {}

/// Violated precondition at the boundary of a fill operation.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyError {
    /// Vectors, multivectors or matrices do not conform to the expected distribution.
    Distribution(MapMismatch),
    /// The workset does not carry what its fill type requires.
    WorksetMismatch { evaluation: EvaluationType, reason: String },
    /// No distributed parameter with the given name exists.
    UnknownDistParam(String),
    /// No scalar parameter with the given name exists.
    UnknownParameter(String),
    /// Tangent seed directions for solution and parameters disagree in count.
    TangentColumnMismatch { num_cols_x: usize, num_cols_p: usize },
    /// The parameter seed multivector does not have one row per derivative parameter.
    TangentParameterRowMismatch { num_params: usize, num_rows: usize },
}

impl Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            AssemblyError::Distribution(err) => write!(f, "Distribution mismatch: {}", err),
            AssemblyError::WorksetMismatch { evaluation, reason } => {
                write!(f, "Workset is not valid for fill type {}: {}", evaluation, reason)
            }
            AssemblyError::UnknownDistParam(name) => {
                write!(f, "Distributed parameter \"{}\" does not exist", name)
            }
            AssemblyError::UnknownParameter(name) => write!(f, "Parameter \"{}\" does not exist", name),
            AssemblyError::TangentColumnMismatch { num_cols_x, num_cols_p } => write!(
                f,
                "Seed multivectors for the solution ({} columns) and for the parameters ({} columns) \
                 must have the same number of columns when summing derivatives",
                num_cols_x, num_cols_p
            ),
            AssemblyError::TangentParameterRowMismatch { num_params, num_rows } => write!(
                f,
                "Parameter seed multivector has {} rows, expected one per derivative parameter ({})",
                num_rows, num_params
            ),
        }
    }
}

impl Error for AssemblyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AssemblyError::Distribution(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MapMismatch> for AssemblyError {
    fn from(err: MapMismatch) -> Self {
        AssemblyError::Distribution(err)
    }
}
